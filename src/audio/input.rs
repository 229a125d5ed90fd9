// Capture-side engine: opens one input device and delivers fixed-size
// frames to a registered callback on the host's audio thread.
//
// The cpal data callback deinterleaves into a pooled frame, applies mute,
// folds the block into the smoothed input level, and hands the frame to
// the user callback by mutable borrow. The callback contract is strict:
// no blocking, no allocation, no retaining the borrow.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::devices::{DeviceDescriptor, DeviceEnumerator};
use crate::audio::events::{EventBus, EventKind, EventPayload};
use crate::audio::frame::AudioFrame;
use crate::error::{AudioError, AudioResult};

/// Floor of the level meter in dB; anything quieter reads as 0.0.
const MIN_LEVEL_DB: f32 = -60.0;

/// Smoothing applied against the stored level each block.
const LEVEL_SMOOTHING: f32 = 0.9;

/// Minimum spacing between input level events.
const LEVEL_EVENT_INTERVAL_US: u64 = 50_000;

/// Callback receiving each captured frame on the audio thread. The frame
/// may be mutated in place; the borrow must not outlive the call.
pub type FrameCallback = Box<dyn FnMut(&mut AudioFrame) + Send>;

struct InputShared {
    bus: Arc<EventBus>,
    muted: AtomicBool,
    level: AtomicU32,
    last_level_event_us: AtomicU64,
    epoch: Instant,
    callback: Mutex<Option<FrameCallback>>,
    stream_failed: AtomicBool,
}

/// Capture device lifecycle and real-time frame delivery.
pub struct InputEngine {
    enumerator: DeviceEnumerator,
    shared: Arc<InputShared>,
    stream: Option<cpal::Stream>,
    current: Option<DeviceDescriptor>,
    sample_rate: u32,
    buffer_size: u32,
    initialized: bool,
    running: bool,
}

impl InputEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            enumerator: DeviceEnumerator::new(),
            shared: Arc::new(InputShared {
                bus,
                muted: AtomicBool::new(false),
                level: AtomicU32::new(0.0f32.to_bits()),
                last_level_event_us: AtomicU64::new(0),
                epoch: Instant::now(),
                callback: Mutex::new(None),
                stream_failed: AtomicBool::new(false),
            }),
            stream: None,
            current: None,
            sample_rate: 48000,
            buffer_size: 512,
            initialized: false,
            running: false,
        }
    }

    /// Idempotent.
    pub fn init(&mut self) -> AudioResult<()> {
        self.initialized = true;
        Ok(())
    }

    /// Stop capture and forget the selected device. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop();
        self.current = None;
        self.initialized = false;
    }

    pub fn list_inputs(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        self.enumerator.list_inputs()
    }

    /// Close the current device and open the requested one. Selecting an
    /// unknown id is an error; an open failure leaves the engine stopped.
    pub fn select(&mut self, device_id: &str) -> AudioResult<()> {
        if !self.initialized {
            return Err(AudioError::NotInitialized);
        }

        let devices = self.list_inputs()?;
        let Some(descriptor) = devices.into_iter().find(|d| d.id == device_id) else {
            return Err(AudioError::DeviceNotFound(device_id.to_string()));
        };

        let was_running = self.running;
        if was_running {
            self.stop();
        }
        info!(
            "{} selected '{}'",
            "INPUT_SELECT".bright_cyan(),
            descriptor.name
        );
        self.shared.bus.publish(
            EventKind::DeviceSelected,
            EventPayload::Device {
                id: descriptor.id.clone(),
                name: descriptor.name.clone(),
            },
        );
        self.current = Some(descriptor);

        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Validate and apply a capture format; reopens the device if capture
    /// is running.
    pub fn set_format(&mut self, sample_rate: u32, buffer_size: u32) -> AudioResult<()> {
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

        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;

        if self.running {
            self.stop();
            self.start()?;
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Register the frame callback invoked on the audio thread.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut AudioFrame) + Send + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(callback));
    }

    /// Open the capture stream and begin delivering frames. Falls back to
    /// the system default device when none is selected.
    pub fn start(&mut self) -> AudioResult<()> {
        if !self.initialized {
            return Err(AudioError::NotInitialized);
        }
        if self.running {
            return Ok(());
        }

        match self.build_stream() {
            Ok(stream) => {
                self.stream = Some(stream);
                self.running = true;
                self.shared.stream_failed.store(false, Ordering::Relaxed);
                self.shared
                    .bus
                    .publish(EventKind::ProcessingStarted, EventPayload::None);
                info!(
                    "{} capture running at {} Hz / {} samples",
                    "INPUT_START".bright_green(),
                    self.sample_rate,
                    self.buffer_size
                );
                Ok(())
            }
            Err(e) => {
                self.shared.bus.publish(
                    EventKind::DeviceError,
                    EventPayload::Error {
                        message: format!("failed to open capture device: {}", e),
                    },
                );
                Err(e)
            }
        }
    }

    /// Tear down the capture stream. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.stream = None;
        self.running = false;
        self.shared.level.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.shared
            .bus
            .publish(EventKind::ProcessingStopped, EventPayload::None);
        info!("{} capture stopped", "INPUT_STOP".bright_yellow());
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.shared.stream_failed.load(Ordering::Relaxed)
    }

    /// Smoothed input level in [0, 1].
    pub fn input_level(&self) -> f32 {
        f32::from_bits(self.shared.level.load(Ordering::Relaxed))
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn current_device(&self) -> Option<DeviceDescriptor> {
        self.current.clone()
    }

    fn build_stream(&self) -> AudioResult<cpal::Stream> {
        let device = match &self.current {
            Some(descriptor) => self.enumerator.find_input(&descriptor.id)?,
            None => self
                .enumerator
                .default_input()
                .ok_or_else(|| AudioError::DeviceNotFound("default input".to_string()))?,
        };
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let channels = device
            .default_input_config()
            .map(|c| c.channels())
            .unwrap_or(1)
            .clamp(1, 2);

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.buffer_size),
        };

        let mut frame = AudioFrame::new(
            channels as usize,
            self.buffer_size as usize,
            self.sample_rate,
        )?;
        let shared = self.shared.clone();
        let err_shared = self.shared.clone();
        let err_name = device_name.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    capture_block(&shared, &mut frame, data, channels as usize);
                },
                move |e| {
                    warn!(
                        "{} stream error on '{}': {}",
                        "INPUT_STREAM".bright_red(),
                        err_name,
                        e
                    );
                    err_shared.stream_failed.store(true, Ordering::Relaxed);
                    err_shared.bus.publish(
                        EventKind::DeviceError,
                        EventPayload::Error {
                            message: format!("capture stream error: {}", e),
                        },
                    );
                },
                None,
            )
            .map_err(|e| AudioError::OpenFailed {
                device: device_name.clone(),
                reason: e.to_string(),
            })?;

        stream.play().map_err(|e| AudioError::OpenFailed {
            device: device_name,
            reason: e.to_string(),
        })?;

        Ok(stream)
    }
}

/// Runs on the audio thread for every captured block.
fn capture_block(shared: &Arc<InputShared>, frame: &mut AudioFrame, data: &[f32], channels: usize) {
    let samples = data.len() / channels.max(1);
    if samples == 0 {
        return;
    }

    if frame.deinterleave_from(data, samples).is_err() {
        return;
    }

    if shared.muted.load(Ordering::Relaxed) {
        frame.clear();
    }

    update_level(shared, frame);

    if let Some(callback) = shared.callback.lock().as_mut() {
        callback(frame);
    }
}

/// Combine per-channel RMS, map to dB in [-60, 0], normalize, smooth, and
/// publish a throttled level event.
fn update_level(shared: &Arc<InputShared>, frame: &AudioFrame) {
    let channels = frame.channels();
    let mut square_sum = 0.0f32;
    for ch in 0..channels {
        let rms = frame.rms(ch, 0, frame.samples());
        square_sum += rms * rms;
    }
    let rms = (square_sum / channels.max(1) as f32).sqrt();

    let db = (20.0 * rms.max(1e-6).log10()).clamp(MIN_LEVEL_DB, 0.0);
    let normalized = (db - MIN_LEVEL_DB) / -MIN_LEVEL_DB;

    let previous = f32::from_bits(shared.level.load(Ordering::Relaxed));
    let smoothed = LEVEL_SMOOTHING * previous + (1.0 - LEVEL_SMOOTHING) * normalized;
    shared.level.store(smoothed.to_bits(), Ordering::Relaxed);

    let now_us = shared.epoch.elapsed().as_micros() as u64;
    let last = shared.last_level_event_us.load(Ordering::Relaxed);
    if now_us.saturating_sub(last) >= LEVEL_EVENT_INTERVAL_US
        && shared
            .last_level_event_us
            .compare_exchange(last, now_us, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        shared
            .bus
            .publish(EventKind::AudioLevelInput, EventPayload::Level(smoothed));
    }
}
