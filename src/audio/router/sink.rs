// Output sinks: where routed frames actually go.
//
// The platform sink drives a cpal render stream fed from a lock-free
// sample ring; the render callback fills silence on underrun and never
// blocks. cpal streams are not Send, so the stream lives on a dedicated
// thread and the sink handle only owns the producer half plus a close
// signal. The mock sink gives tests a programmable failure point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use colored::Colorize;
use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::devices::{DeviceDescriptor, DeviceEnumerator};
use crate::audio::ring_buffer::{FrameRing, FrameRingConfig, RingProducer};
use crate::error::{AudioError, AudioResult};

/// Render-side stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub channels: u16,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size: 512,
            channels: 2,
        }
    }
}

/// A destination for interleaved output samples.
pub trait OutputSink: Send {
    /// Open the device, closing any previous one first.
    fn open(&mut self, device_id: &str, format: &OutputFormat) -> AudioResult<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Write one interleaved buffer. Returns false instead of blocking
    /// when the device cannot take the data.
    fn write(&mut self, interleaved: &[f32]) -> bool;
}

/// cpal-backed sink for the virtual output endpoint.
pub struct CpalSink {
    producer: Option<RingProducer>,
    close_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            producer: None,
            close_tx: None,
            thread: None,
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for CpalSink {
    fn open(&mut self, device_id: &str, format: &OutputFormat) -> AudioResult<()> {
        self.close();

        // Half a second of headroom between the routing path and the
        // render callback.
        let capacity = (format.sample_rate as usize * format.channels as usize) / 2;
        crate::audio_debug!(
            "🔧 SINK_OPEN: {} ring of {} samples ({} ch @ {} Hz)",
            device_id,
            capacity,
            format.channels,
            format.sample_rate
        );
        let ring = FrameRing::new(FrameRingConfig { capacity });
        let (producer, mut consumer) = ring.split();

        let (result_tx, result_rx) = mpsc::channel::<AudioResult<()>>();
        let (close_tx, close_rx) = mpsc::channel::<()>();

        let id = device_id.to_string();
        let stream_format = *format;
        let thread = std::thread::Builder::new()
            .name("quiet-output-stream".to_string())
            .spawn(move || {
                let enumerator = DeviceEnumerator::new();
                let device = match enumerator.find_virtual_output(&id) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                        return;
                    }
                };

                let config = cpal::StreamConfig {
                    channels: stream_format.channels,
                    sample_rate: cpal::SampleRate(stream_format.sample_rate),
                    buffer_size: cpal::BufferSize::Fixed(stream_format.buffer_size),
                };

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let filled = consumer.pop_slice(data);
                        data[filled..].fill(0.0);
                    },
                    |e| warn!("{} output stream error: {}", "OUTPUT_SINK".bright_red(), e),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = result_tx.send(Err(AudioError::OpenFailed {
                            device: id.clone(),
                            reason: e.to_string(),
                        }));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = result_tx.send(Err(AudioError::OpenFailed {
                        device: id.clone(),
                        reason: e.to_string(),
                    }));
                    return;
                }

                let _ = result_tx.send(Ok(()));
                // Park until the sink is closed; the stream must stay on
                // this thread.
                let _ = close_rx.recv();
            })
            .map_err(|e| AudioError::OpenFailed {
                device: device_id.to_string(),
                reason: e.to_string(),
            })?;

        match result_rx.recv() {
            Ok(Ok(())) => {
                self.producer = Some(producer);
                self.close_tx = Some(close_tx);
                self.thread = Some(thread);
                info!(
                    "{} opened virtual output '{}'",
                    "OUTPUT_SINK".bright_green(),
                    device_id
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::OpenFailed {
                    device: device_id.to_string(),
                    reason: "stream thread exited before reporting".to_string(),
                })
            }
        }
    }

    fn close(&mut self) {
        self.close_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.producer = None;
    }

    fn is_open(&self) -> bool {
        self.producer.is_some()
    }

    fn write(&mut self, interleaved: &[f32]) -> bool {
        let Some(producer) = self.producer.as_mut() else {
            return false;
        };
        // Refuse a partial write; the caller counts it as one dropped
        // buffer rather than an audible glitch.
        if producer.available_write() < interleaved.len() {
            return false;
        }
        producer.push_slice(interleaved) == interleaved.len()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared state backing a [`MockSink`], controlled by tests.
#[derive(Default)]
pub struct MockOutputState {
    devices: Mutex<Vec<DeviceDescriptor>>,
    writes: AtomicU64,
    fail_after: AtomicU64,
    last_write_len: AtomicU64,
    open_should_fail: AtomicBool,
    opened: AtomicBool,
}

/// Test handle for the mock backend: owns the simulated device list and
/// the programmable failure point.
#[derive(Clone, Default)]
pub struct MockOutput {
    state: Arc<MockOutputState>,
}

impl MockOutput {
    pub fn new() -> Self {
        let output = Self::default();
        output.state.fail_after.store(u64::MAX, Ordering::Relaxed);
        output
    }

    pub fn add_device(&self, descriptor: DeviceDescriptor) {
        self.state.devices.lock().push(descriptor);
    }

    pub fn remove_device(&self, device_id: &str) {
        self.state.devices.lock().retain(|d| d.id != device_id);
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.state.devices.lock().clone()
    }

    /// Let the next `n` writes succeed, then fail every write until
    /// [`recover`](Self::recover).
    pub fn fail_after(&self, n: u64) {
        self.state
            .fail_after
            .store(self.state.writes.load(Ordering::Relaxed) + n, Ordering::Relaxed);
    }

    /// Clear the failure point so writes succeed again.
    pub fn recover(&self) {
        self.state.fail_after.store(u64::MAX, Ordering::Relaxed);
    }

    pub fn set_open_failing(&self, failing: bool) {
        self.state.open_should_fail.store(failing, Ordering::Relaxed);
    }

    pub fn writes(&self) -> u64 {
        self.state.writes.load(Ordering::Relaxed)
    }

    /// Interleaved length of the most recent write.
    pub fn last_write_len(&self) -> u64 {
        self.state.last_write_len.load(Ordering::Relaxed)
    }

    pub fn is_opened(&self) -> bool {
        self.state.opened.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> MockSink {
        MockSink {
            state: self.state.clone(),
            open: false,
        }
    }
}

/// Sink half of the mock backend.
pub struct MockSink {
    state: Arc<MockOutputState>,
    open: bool,
}

impl OutputSink for MockSink {
    fn open(&mut self, device_id: &str, _format: &OutputFormat) -> AudioResult<()> {
        self.close();
        if self.state.open_should_fail.load(Ordering::Relaxed) {
            return Err(AudioError::OpenFailed {
                device: device_id.to_string(),
                reason: "mock open failure".to_string(),
            });
        }
        if !self.state.devices.lock().iter().any(|d| d.id == device_id) {
            return Err(AudioError::DeviceNotFound(device_id.to_string()));
        }
        self.open = true;
        self.state.opened.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.opened.store(false, Ordering::Relaxed);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, interleaved: &[f32]) -> bool {
        if !self.open {
            return false;
        }
        self.state
            .last_write_len
            .store(interleaved.len() as u64, Ordering::Relaxed);
        let count = self.state.writes.fetch_add(1, Ordering::Relaxed) + 1;
        count <= self.state.fail_after.load(Ordering::Relaxed)
    }
}
