// Virtual-output router: discovers loopback endpoints, writes processed
// frames at wall-clock rate, and survives hot-unplug.
//
// State machine:
//   Uninit -> Scanning -> (device found) Idle -> Routing
//   Routing -> (write failures / device vanished) Reconnecting
//   Reconnecting -> (reopen ok) Routing | (attempts exhausted) Scanning
//
// A background thread rescans every two seconds and drives reconnection
// with capped exponential backoff. The route path runs on the audio
// thread: it only try-locks, never opens or closes devices, and counts a
// contended lock as one dropped buffer.

pub mod sink;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::Colorize;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{info, warn};

use crate::audio::devices::{DeviceDescriptor, DeviceEnumerator};
use crate::audio::events::{EventBus, EventKind, EventPayload};
use crate::audio::frame::AudioFrame;
use crate::error::{AudioError, AudioResult};

pub use sink::{CpalSink, MockOutput, MockSink, OutputFormat, OutputSink};

/// Poll period of the hot-plug thread.
const HOT_PLUG_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive write failures before the router declares the device gone.
const FAILURES_BEFORE_RECONNECT: u32 = 8;

/// Reconnection backoff: 250ms * 2^attempt, capped.
const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_CAP: Duration = Duration::from_secs(4);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Minimum spacing between output level events.
const LEVEL_EVENT_INTERVAL_US: u64 = 50_000;

/// Largest callback buffer the scratch conversion buffer accommodates
/// without allocating on the audio thread.
const MAX_BUFFER_SAMPLES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouterState {
    Uninit,
    Scanning,
    Selected,
    Idle,
    Routing,
    Reconnecting,
}

/// Snapshot of router counters. All fields update atomically and are safe
/// to read concurrently with routing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub buffers_routed: u64,
    pub dropped_buffers: u64,
    pub ema_latency_ms: f32,
    pub output_level: f32,
}

/// Which sink implementation the router drives, fixed at construction.
#[derive(Clone)]
pub enum RouterBackend {
    Cpal,
    Mock(MockOutput),
}

impl RouterBackend {
    fn supported(&self) -> bool {
        match self {
            RouterBackend::Cpal => cfg!(any(target_os = "windows", target_os = "macos")),
            RouterBackend::Mock(_) => true,
        }
    }

    fn scan(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        match self {
            RouterBackend::Cpal => DeviceEnumerator::new().list_virtual_outputs(),
            RouterBackend::Mock(mock) => Ok(mock.devices()),
        }
    }

    fn make_sink(&self) -> Box<dyn OutputSink> {
        match self {
            RouterBackend::Cpal => Box::new(CpalSink::new()),
            RouterBackend::Mock(mock) => Box::new(mock.sink()),
        }
    }
}

struct RouterCore {
    state: RouterState,
    backend: RouterBackend,
    sink: Box<dyn OutputSink>,
    current: Option<DeviceDescriptor>,
    format: OutputFormat,
    scratch: Vec<f32>,
    known_ids: Vec<String>,
    consecutive_failures: u32,
    reconnect_attempt: u32,
    next_reconnect_at: Option<Instant>,
    was_routing: bool,
}

struct StatsInner {
    buffers_routed: AtomicU64,
    dropped_buffers: AtomicU64,
    ema_latency_ms: AtomicU32,
    output_level: AtomicU32,
    last_level_event_us: AtomicU64,
}

struct RouterShared {
    core: Mutex<RouterCore>,
    cv: Condvar,
    running: AtomicBool,
    stats: StatsInner,
    bus: Arc<EventBus>,
    epoch: Instant,
}

/// Routes processed audio to a virtual output endpoint with hot-plug
/// recovery.
pub struct OutputRouter {
    shared: Arc<RouterShared>,
    hotplug: Mutex<Option<JoinHandle<()>>>,
}

impl OutputRouter {
    /// Router over the platform cpal backend.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_backend(bus, RouterBackend::Cpal)
    }

    /// Router over an explicit backend; tests pass `RouterBackend::Mock`.
    pub fn with_backend(bus: Arc<EventBus>, backend: RouterBackend) -> Self {
        let sink = backend.make_sink();
        Self {
            shared: Arc::new(RouterShared {
                core: Mutex::new(RouterCore {
                    state: RouterState::Uninit,
                    backend,
                    sink,
                    current: None,
                    format: OutputFormat::default(),
                    scratch: Vec::new(),
                    known_ids: Vec::new(),
                    consecutive_failures: 0,
                    reconnect_attempt: 0,
                    next_reconnect_at: None,
                    was_routing: false,
                }),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                stats: StatsInner {
                    buffers_routed: AtomicU64::new(0),
                    dropped_buffers: AtomicU64::new(0),
                    ema_latency_ms: AtomicU32::new(0.0f32.to_bits()),
                    output_level: AtomicU32::new(0.0f32.to_bits()),
                    last_level_event_us: AtomicU64::new(0),
                },
                bus,
                epoch: Instant::now(),
            }),
            hotplug: Mutex::new(None),
        }
    }

    /// Scan once, auto-select the first discovered endpoint, and start the
    /// hot-plug thread. Idempotent.
    pub fn init(&self) -> AudioResult<()> {
        {
            let core = self.shared.core.lock();
            if !core.backend.supported() {
                return Err(AudioError::Unsupported);
            }
            if core.state != RouterState::Uninit {
                return Ok(());
            }
        }

        self.shared.core.lock().state = RouterState::Scanning;
        self.shared.running.store(true, Ordering::SeqCst);
        tick(&self.shared);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("quiet-hotplug".to_string())
            .spawn(move || hotplug_loop(shared))
            .ok();
        *self.hotplug.lock() = handle;

        info!(
            "{} hot-plug watcher started ({}s interval)",
            "ROUTER_INIT".bright_cyan(),
            HOT_PLUG_INTERVAL.as_secs()
        );
        Ok(())
    }

    /// Stop the hot-plug thread, close the device, return to Uninit.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.cv.notify_all();
            if let Some(handle) = self.hotplug.lock().take() {
                let _ = handle.join();
            }
        }

        let mut core = self.shared.core.lock();
        core.sink.close();
        core.current = None;
        core.state = RouterState::Uninit;
        info!("{} shut down", "ROUTER_SHUTDOWN".bright_yellow());
    }

    pub fn state(&self) -> RouterState {
        self.shared.core.lock().state
    }

    pub fn current_device(&self) -> Option<DeviceDescriptor> {
        self.shared.core.lock().current.clone()
    }

    /// Fresh enumeration of installed virtual outputs.
    pub fn list_virtual_outputs(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let backend = self.shared.core.lock().backend.clone();
        backend.scan()
    }

    /// Close the current endpoint and open the requested one.
    pub fn select(&self, device_id: &str) -> AudioResult<()> {
        let mut core = self.shared.core.lock();
        if core.state == RouterState::Uninit {
            return Err(AudioError::NotInitialized);
        }

        let devices = core.backend.scan()?;
        let Some(mut descriptor) = devices.into_iter().find(|d| d.id == device_id) else {
            self.shared.bus.publish(
                EventKind::DeviceError,
                EventPayload::Error {
                    message: format!("virtual output not found: {}", device_id),
                },
            );
            return Err(AudioError::DeviceNotFound(device_id.to_string()));
        };

        let was_routing = core.state == RouterState::Routing;
        core.state = RouterState::Selected;
        core.sink.close();
        let format = core.format;
        match core.sink.open(device_id, &format) {
            Ok(()) => {
                descriptor.connected = true;
                self.shared.bus.publish(
                    EventKind::DeviceSelected,
                    EventPayload::Device {
                        id: descriptor.id.clone(),
                        name: descriptor.name.clone(),
                    },
                );
                self.shared
                    .bus
                    .publish(EventKind::RouterConnected, EventPayload::None);
                core.current = Some(descriptor);
                core.consecutive_failures = 0;
                core.state = if was_routing {
                    RouterState::Routing
                } else {
                    RouterState::Idle
                };
                Ok(())
            }
            Err(e) => {
                core.current = None;
                core.state = RouterState::Scanning;
                self.shared.bus.publish(
                    EventKind::DeviceError,
                    EventPayload::Error {
                        message: format!("failed to open {}: {}", device_id, e),
                    },
                );
                Err(e)
            }
        }
    }

    /// Change the render format. Validates and reopens the device when one
    /// is held.
    pub fn set_format(
        &self,
        sample_rate: u32,
        buffer_size: u32,
        channels: u16,
    ) -> AudioResult<()> {
        if !(8000..=192000).contains(&sample_rate) {
            return Err(AudioError::InvalidFormat(format!(
                "sample rate {} outside 8000..=192000",
                sample_rate
            )));
        }
        if !(32..=8192).contains(&buffer_size) || !buffer_size.is_power_of_two() {
            return Err(AudioError::InvalidFormat(format!(
                "buffer size {} must be a power of two in 32..=8192",
                buffer_size
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(AudioError::InvalidFormat(format!(
                "channel count {} outside 1..=2",
                channels
            )));
        }

        let mut core = self.shared.core.lock();
        core.format = OutputFormat {
            sample_rate,
            buffer_size,
            channels,
        };
        core.scratch = Vec::with_capacity(MAX_BUFFER_SAMPLES * channels as usize);

        if core.sink.is_open() {
            if let Some(id) = core.current.as_ref().map(|d| d.id.clone()) {
                let format = core.format;
                core.sink.close();
                core.sink.open(&id, &format)?;
            }
        }
        Ok(())
    }

    /// Begin accepting frames. Requires a connected endpoint.
    pub fn start_routing(&self) -> AudioResult<()> {
        let mut core = self.shared.core.lock();
        match core.state {
            RouterState::Routing => Ok(()),
            RouterState::Idle => {
                let capacity = MAX_BUFFER_SAMPLES * core.format.channels as usize;
                if core.scratch.capacity() < capacity {
                    core.scratch = Vec::with_capacity(capacity);
                }
                core.state = RouterState::Routing;
                core.was_routing = true;
                info!("{} routing started", "ROUTER_START".bright_green());
                Ok(())
            }
            _ => Err(AudioError::NotInitialized),
        }
    }

    pub fn stop_routing(&self) {
        let mut core = self.shared.core.lock();
        core.was_routing = false;
        if core.state == RouterState::Routing {
            core.state = RouterState::Idle;
            info!("{} routing stopped", "ROUTER_STOP".bright_yellow());
        }
    }

    /// Write one frame to the endpoint, adapting channel count on the way.
    ///
    /// Runs on the audio thread: a contended router lock or a full device
    /// buffer costs one dropped buffer, never a block. A streak of write
    /// failures flips the router into Reconnecting and the hot-plug thread
    /// takes it from there.
    pub fn route(&self, frame: &AudioFrame) -> AudioResult<()> {
        let Some(mut core) = self.shared.core.try_lock() else {
            self.shared.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
            return Err(AudioError::WriteFailed);
        };

        match core.state {
            RouterState::Routing => {}
            RouterState::Reconnecting => {
                self.shared.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
                return Err(AudioError::WriteFailed);
            }
            _ => return Err(AudioError::NotInitialized),
        }

        if frame.is_empty() {
            return Err(AudioError::InvalidFormat("empty frame".to_string()));
        }
        if frame.sample_rate() != core.format.sample_rate {
            // Rate adaptation is a known future enhancement; for now a
            // mismatched frame is counted and refused.
            self.shared.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
            return Err(AudioError::FormatMismatch {
                frame_rate: frame.sample_rate(),
                output_rate: core.format.sample_rate,
            });
        }

        let started = Instant::now();
        let out_channels = core.format.channels as usize;
        let needed = frame.samples() * out_channels;
        core.scratch.resize(needed, 0.0);

        // Up-mix duplicates the last available channel, down-mix drops
        // extras.
        for s in 0..frame.samples() {
            for ch in 0..out_channels {
                let src = ch.min(frame.channels() - 1);
                core.scratch[s * out_channels + ch] = frame.sample(src, s);
            }
        }

        let RouterCore { sink, scratch, .. } = &mut *core;
        if sink.write(&scratch[..needed]) {
            core.consecutive_failures = 0;
            self.shared.stats.buffers_routed.fetch_add(1, Ordering::Relaxed);

            let mut level = 0.0f32;
            for ch in 0..frame.channels() {
                level = level.max(frame.peak_magnitude(ch, 0, frame.samples()));
            }
            self.shared
                .stats
                .output_level
                .store(level.to_bits(), Ordering::Relaxed);

            let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
            let prev =
                f32::from_bits(self.shared.stats.ema_latency_ms.load(Ordering::Relaxed));
            let ema = 0.1 * elapsed_ms + 0.9 * prev;
            self.shared
                .stats
                .ema_latency_ms
                .store(ema.to_bits(), Ordering::Relaxed);

            self.maybe_publish_level(level);
            Ok(())
        } else {
            self.shared.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
            core.consecutive_failures += 1;

            if core.consecutive_failures == FAILURES_BEFORE_RECONNECT {
                if let Some(current) = core.current.as_mut() {
                    current.connected = false;
                }
                core.state = RouterState::Reconnecting;
                core.was_routing = true;
                core.reconnect_attempt = 0;
                core.next_reconnect_at = Some(Instant::now());
                drop(core);
                self.shared
                    .bus
                    .publish(EventKind::RouterDisconnected, EventPayload::None);
                self.shared.cv.notify_all();
            }
            Err(AudioError::WriteFailed)
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            buffers_routed: self.shared.stats.buffers_routed.load(Ordering::Relaxed),
            dropped_buffers: self.shared.stats.dropped_buffers.load(Ordering::Relaxed),
            ema_latency_ms: f32::from_bits(
                self.shared.stats.ema_latency_ms.load(Ordering::Relaxed),
            ),
            output_level: f32::from_bits(self.shared.stats.output_level.load(Ordering::Relaxed)),
        }
    }

    /// Per-OS guidance for installing a virtual loopback driver.
    pub fn install_instructions() -> &'static str {
        if cfg!(target_os = "windows") {
            "Install VB-Cable: download from https://vb-audio.com/Cable/, run \
             VBCABLE_Setup_x64.exe as administrator, restart, and the device \
             appears as 'CABLE Input'."
        } else if cfg!(target_os = "macos") {
            "Install BlackHole: download from https://existential.audio/blackhole/, \
             open the 2ch PKG, follow the prompts, and 'BlackHole 2ch' appears \
             in your audio devices."
        } else {
            "Virtual audio routing is not supported on this platform."
        }
    }

    fn maybe_publish_level(&self, level: f32) {
        let now_us = self.shared.epoch.elapsed().as_micros() as u64;
        let last = self.shared.stats.last_level_event_us.load(Ordering::Relaxed);
        if now_us.saturating_sub(last) >= LEVEL_EVENT_INTERVAL_US
            && self
                .shared
                .stats
                .last_level_event_us
                .compare_exchange(last, now_us, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.shared
                .bus
                .publish(EventKind::AudioLevelOutput, EventPayload::Level(level));
        }
    }
}

impl Drop for OutputRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn hotplug_loop(shared: Arc<RouterShared>) {
    loop {
        {
            let mut core = shared.core.lock();
            let wait = next_wait(&core);
            shared.cv.wait_for(&mut core, wait);
        }
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        tick(&shared);
    }
}

fn next_wait(core: &RouterCore) -> Duration {
    if core.state == RouterState::Reconnecting {
        if let Some(at) = core.next_reconnect_at {
            let until = at.saturating_duration_since(Instant::now());
            return until.min(HOT_PLUG_INTERVAL).max(Duration::from_millis(10));
        }
    }
    HOT_PLUG_INTERVAL
}

/// One hot-plug pass: re-enumerate, then advance the state machine.
fn tick(shared: &Arc<RouterShared>) {
    let backend = shared.core.lock().backend.clone();
    let scan = match backend.scan() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("{} device scan failed: {}", "ROUTER_SCAN".bright_red(), e);
            return;
        }
    };
    let scan_ids: Vec<String> = scan.iter().map(|d| d.id.clone()).collect();

    let mut core = shared.core.lock();
    let list_changed = scan_ids != core.known_ids;
    core.known_ids = scan_ids;

    if list_changed {
        crate::audio_debug!(
            "🔌 HOTPLUG_SCAN: {} virtual output(s) visible",
            core.known_ids.len()
        );
        shared
            .bus
            .publish(EventKind::DeviceListChanged, EventPayload::None);
    }

    match core.state {
        RouterState::Scanning => {
            if let Some(first) = scan.into_iter().next() {
                core.state = RouterState::Selected;
                open_device(shared, &mut core, first, false);
            }
        }
        RouterState::Idle | RouterState::Routing => {
            let vanished = core
                .current
                .as_ref()
                .is_some_and(|current| !core.known_ids.contains(&current.id));
            if vanished {
                if let Some(current) = core.current.as_mut() {
                    current.connected = false;
                }
                core.was_routing = core.state == RouterState::Routing;
                core.state = RouterState::Reconnecting;
                core.reconnect_attempt = 0;
                core.next_reconnect_at = Some(Instant::now());
                warn!(
                    "{} virtual output vanished",
                    "ROUTER_HOTPLUG".bright_red()
                );
                shared
                    .bus
                    .publish(EventKind::RouterDisconnected, EventPayload::None);
            }
        }
        RouterState::Reconnecting => {
            let due = core
                .next_reconnect_at
                .map_or(true, |at| Instant::now() >= at);
            if due {
                attempt_reconnect(shared, &mut core);
            }
        }
        _ => {}
    }
}

fn open_device(
    shared: &Arc<RouterShared>,
    core: &mut RouterCore,
    mut descriptor: DeviceDescriptor,
    resume_routing: bool,
) {
    let format = core.format;
    core.sink.close();
    match core.sink.open(&descriptor.id, &format) {
        Ok(()) => {
            descriptor.connected = true;
            info!(
                "{} connected to '{}'",
                "ROUTER_CONNECT".bright_green(),
                descriptor.name
            );
            shared.bus.publish(
                EventKind::DeviceSelected,
                EventPayload::Device {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                },
            );
            shared
                .bus
                .publish(EventKind::RouterConnected, EventPayload::None);
            core.current = Some(descriptor);
            core.consecutive_failures = 0;
            core.reconnect_attempt = 0;
            core.next_reconnect_at = None;
            core.state = if resume_routing {
                RouterState::Routing
            } else {
                RouterState::Idle
            };
        }
        Err(e) => {
            shared.bus.publish(
                EventKind::DeviceError,
                EventPayload::Error {
                    message: format!("failed to open {}: {}", descriptor.id, e),
                },
            );
            core.current = None;
            core.state = RouterState::Scanning;
        }
    }
}

fn attempt_reconnect(shared: &Arc<RouterShared>, core: &mut RouterCore) {
    let Some(descriptor) = core.current.clone() else {
        core.state = RouterState::Scanning;
        return;
    };

    let format = core.format;
    core.sink.close();
    match core.sink.open(&descriptor.id, &format) {
        Ok(()) => {
            let resume = core.was_routing;
            if let Some(current) = core.current.as_mut() {
                current.connected = true;
            }
            core.consecutive_failures = 0;
            core.reconnect_attempt = 0;
            core.next_reconnect_at = None;
            core.state = if resume {
                RouterState::Routing
            } else {
                RouterState::Idle
            };
            info!(
                "{} reconnected to '{}'",
                "ROUTER_RECONNECT".bright_green(),
                descriptor.name
            );
            shared
                .bus
                .publish(EventKind::RouterConnected, EventPayload::None);
        }
        Err(e) => {
            core.reconnect_attempt += 1;
            if core.reconnect_attempt >= MAX_RECONNECT_ATTEMPTS {
                warn!(
                    "{} giving up on '{}' after {} attempts: {}",
                    "ROUTER_RECONNECT".bright_red(),
                    descriptor.id,
                    core.reconnect_attempt,
                    e
                );
                core.current = None;
                core.state = RouterState::Scanning;
                shared.bus.publish(
                    EventKind::DeviceError,
                    EventPayload::Error {
                        message: format!("reconnection to {} failed: {}", descriptor.id, e),
                    },
                );
            } else {
                let backoff = RECONNECT_BASE
                    .saturating_mul(1 << core.reconnect_attempt.min(16))
                    .min(RECONNECT_CAP);
                core.next_reconnect_at = Some(Instant::now() + backoff);
            }
        }
    }
}
