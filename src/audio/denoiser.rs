// Frame-aligned noise-reduction processor built on the RNNoise model.
//
// The model contract is fixed: 480-sample mono frames at 48 kHz, samples
// in the i16 value range. This component adapts whatever (channels,
// sample_rate, frame_size) the capture side produces to that contract and
// back, queueing residue between calls. Stereo input runs each channel
// through its own model instance so channel state never bleeds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use nnnoiseless::DenoiseState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audio::events::{EventBus, EventKind, EventPayload};
use crate::audio::frame::AudioFrame;
use crate::audio::resampler::{model_chunk_size, resample_linear};
use crate::error::{AudioError, AudioResult};

/// Samples per model invocation: 10 ms at 48 kHz.
pub const MODEL_FRAME_SIZE: usize = DenoiseState::<'static>::FRAME_SIZE;

/// Depth of the rolling voice-activity history.
pub const VAD_HISTORY_LEN: usize = 64;

const I16_SCALE: f32 = 32767.0;
const I16_INV_SCALE: f32 = 1.0 / 32768.0;

/// User-selectable suppression depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionStrength {
    Low,
    Medium,
    High,
}

impl ReductionStrength {
    /// Base attenuation factor applied on non-voice passages.
    fn base_factor(self) -> f32 {
        match self {
            ReductionStrength::Low => 0.5,
            ReductionStrength::Medium => 0.7,
            ReductionStrength::High => 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserConfig {
    pub enabled: bool,
    pub strength: ReductionStrength,
    /// Voice probability above which a model frame counts as speech.
    pub vad_threshold: f32,
    /// Soften suppression while the model reports speech.
    pub adaptive: bool,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strength: ReductionStrength::Medium,
            vad_threshold: 0.5,
            adaptive: true,
        }
    }
}

/// Counters and moving averages kept by the processor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DenoiserStats {
    pub frames_processed: u64,
    pub total_processing_us: u64,
    pub last_reduction_db: f32,
    pub ema_reduction_db: f32,
    pub last_voice_probability: f32,
    pub vad_history: VecDeque<f32>,
}

struct ChannelState {
    model: Box<DenoiseState<'static>>,
    input_queue: VecDeque<f32>,
    output_queue: VecDeque<f32>,
}

struct Scratch {
    chunk_in: Vec<f32>,
    chunk_out: Vec<f32>,
    model_in: Vec<f32>,
    model_out: Vec<f32>,
    shaped: Vec<f32>,
}

/// Real-time noise reduction with per-channel model state.
pub struct Denoiser {
    bus: Arc<EventBus>,
    config: Mutex<DenoiserConfig>,
    enabled: AtomicBool,
    stats: Mutex<DenoiserStats>,
    channels: Vec<ChannelState>,
    scratch: Scratch,
    vad_log: Vec<f32>,
    sample_rate: u32,
    chunk_size: usize,
    needs_resampling: bool,
    initialized: bool,
}

impl Denoiser {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            config: Mutex::new(DenoiserConfig::default()),
            enabled: AtomicBool::new(true),
            stats: Mutex::new(DenoiserStats::default()),
            channels: Vec::new(),
            scratch: Scratch {
                chunk_in: Vec::new(),
                chunk_out: Vec::new(),
                model_in: Vec::new(),
                model_out: Vec::new(),
                shaped: Vec::new(),
            },
            vad_log: Vec::new(),
            sample_rate: 48000,
            chunk_size: MODEL_FRAME_SIZE,
            needs_resampling: false,
            initialized: false,
        }
    }

    /// Allocate model instances, queues, and scratch buffers for the given
    /// capture rate. One model per stereo channel; mono uses the first.
    /// No further allocation happens in `process` for frames up to the
    /// maximum supported buffer size.
    pub fn init(&mut self, sample_rate: u32) -> AudioResult<()> {
        if self.initialized {
            return Ok(());
        }
        if !(8000..=192000).contains(&sample_rate) {
            return Err(AudioError::InvalidFormat(format!(
                "unsupported sample rate {} Hz",
                sample_rate
            )));
        }

        self.sample_rate = sample_rate;
        self.needs_resampling = sample_rate != 48000;
        self.chunk_size = model_chunk_size(sample_rate, MODEL_FRAME_SIZE);

        // Queue headroom: the largest callback buffer plus one chunk of
        // residue on each side of the model.
        let queue_capacity = 8192 + self.chunk_size + MODEL_FRAME_SIZE;
        self.channels = (0..2)
            .map(|_| ChannelState {
                model: DenoiseState::new(),
                input_queue: VecDeque::with_capacity(queue_capacity),
                output_queue: VecDeque::with_capacity(queue_capacity),
            })
            .collect();

        self.scratch.chunk_in = vec![0.0; self.chunk_size];
        self.scratch.chunk_out = vec![0.0; self.chunk_size];
        self.scratch.model_in = vec![0.0; MODEL_FRAME_SIZE];
        self.scratch.model_out = vec![0.0; MODEL_FRAME_SIZE];
        self.scratch.shaped = vec![0.0; MODEL_FRAME_SIZE];
        self.vad_log = Vec::with_capacity(64);

        self.initialized = true;
        info!(
            "{} model ready ({} Hz capture, chunk {} samples, resampling: {})",
            "DENOISER_INIT".bright_green(),
            sample_rate,
            self.chunk_size,
            self.needs_resampling
        );
        Ok(())
    }

    /// Release model instances and buffers. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.channels.clear();
        self.scratch.chunk_in = Vec::new();
        self.scratch.chunk_out = Vec::new();
        self.scratch.model_in = Vec::new();
        self.scratch.model_out = Vec::new();
        self.scratch.shaped = Vec::new();
        self.initialized = false;
        info!("{} model released", "DENOISER_SHUTDOWN".bright_yellow());
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_config(&self, config: DenoiserConfig) {
        let mut clamped = config;
        clamped.vad_threshold = clamped.vad_threshold.clamp(0.0, 1.0);
        self.enabled.store(clamped.enabled, Ordering::Relaxed);
        *self.config.lock() = clamped.clone();
        self.bus.publish(
            EventKind::NoiseReductionChanged,
            EventPayload::NoiseReduction(clamped),
        );
    }

    pub fn get_config(&self) -> DenoiserConfig {
        self.config.lock().clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut config = self.config.lock();
            let changed = config.enabled != enabled;
            config.enabled = enabled;
            self.enabled.store(enabled, Ordering::Relaxed);
            changed.then(|| config.clone())
        };
        if let Some(config) = changed {
            self.bus.publish(
                EventKind::NoiseReductionChanged,
                EventPayload::NoiseReduction(config),
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Denoise a frame in place.
    ///
    /// Incoming samples append to per-channel queues; every full chunk is
    /// run through the model and shaped; the frame is then refilled from
    /// the output queue with a zero-filled remainder while the algorithmic
    /// group delay drains on the first frames. Disabled processing leaves
    /// the frame bit-exact.
    pub fn process(&mut self, frame: &mut AudioFrame) -> AudioResult<()> {
        if !self.initialized {
            return Err(AudioError::NotInitialized);
        }
        if frame.is_empty() {
            return Err(AudioError::InvalidFormat("empty frame".to_string()));
        }

        let config = self.config.lock().clone();
        if !config.enabled {
            return Ok(());
        }

        let started = Instant::now();
        let samples = frame.samples();
        let active = frame.channels().min(2);

        let mut pre_square_sum = 0.0f32;
        for ch in 0..active {
            let rms = frame.rms(ch, 0, samples);
            pre_square_sum += rms * rms;
        }
        let pre_rms = (pre_square_sum / active as f32).sqrt();

        self.vad_log.clear();
        for ch in 0..active {
            let state = &mut self.channels[ch];
            state.input_queue.extend(frame.channel(ch).iter().copied());

            while state.input_queue.len() >= self.chunk_size {
                process_chunk(
                    state,
                    &mut self.scratch,
                    &config,
                    self.chunk_size,
                    self.needs_resampling,
                    &mut self.vad_log,
                );
            }

            let out = frame.channel_mut(ch);
            let take = out.len().min(state.output_queue.len());
            for slot in &mut out[..take] {
                *slot = state.output_queue.pop_front().unwrap_or(0.0);
            }
            out[take..].fill(0.0);
        }

        let mut post_square_sum = 0.0f32;
        for ch in 0..active {
            let rms = frame.rms(ch, 0, samples);
            post_square_sum += rms * rms;
        }
        let post_rms = (post_square_sum / active as f32).sqrt();

        let reduction_db = if pre_rms > 1e-9 && post_rms > 1e-9 {
            (20.0 * (pre_rms / post_rms).log10()).max(0.0)
        } else {
            0.0
        };

        let elapsed_us = started.elapsed().as_micros() as u64;
        let mut stats = self.stats.lock();
        stats.frames_processed += 1;
        stats.total_processing_us += elapsed_us;
        stats.last_reduction_db = reduction_db;
        stats.ema_reduction_db = 0.1 * reduction_db + 0.9 * stats.ema_reduction_db;
        if let Some(&vad) = self.vad_log.last() {
            stats.last_voice_probability = vad;
        }
        for &vad in &self.vad_log {
            if stats.vad_history.len() == VAD_HISTORY_LEN {
                stats.vad_history.pop_front();
            }
            stats.vad_history.push_back(vad);
        }

        Ok(())
    }

    pub fn stats(&self) -> DenoiserStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DenoiserStats::default();
    }
}

/// Pull one chunk off the input queue, run it through the model at the
/// 48 kHz grid, shape it, and append the result to the output queue.
fn process_chunk(
    state: &mut ChannelState,
    scratch: &mut Scratch,
    config: &DenoiserConfig,
    chunk_size: usize,
    needs_resampling: bool,
    vad_log: &mut Vec<f32>,
) {
    for slot in scratch.chunk_in.iter_mut() {
        *slot = state.input_queue.pop_front().unwrap_or(0.0);
    }

    // Onto the model's 48 kHz grid and into the i16 value range.
    if needs_resampling {
        resample_linear(&scratch.chunk_in, &mut scratch.shaped);
    } else {
        scratch.shaped.copy_from_slice(&scratch.chunk_in);
    }
    for (dst, &src) in scratch.model_in.iter_mut().zip(scratch.shaped.iter()) {
        *dst = src.clamp(-1.0, 1.0) * I16_SCALE;
    }

    let voice_prob = state
        .model
        .process_frame(&mut scratch.model_out, &scratch.model_in);
    vad_log.push(voice_prob);

    for (dst, &src) in scratch.shaped.iter_mut().zip(scratch.model_out.iter()) {
        *dst = src * I16_INV_SCALE;
    }

    apply_strength_shaping(&mut scratch.shaped, config, voice_prob);

    if needs_resampling {
        resample_linear(&scratch.shaped, &mut scratch.chunk_out);
        state.output_queue.extend(&scratch.chunk_out[..chunk_size]);
    } else {
        state.output_queue.extend(&scratch.shaped[..]);
    }
}

/// Deepen suppression on frames the model deems non-speech.
///
/// The base factor comes from the user strength; adaptive mode backs it
/// off while speech is present. Voice passages are never attenuated
/// beyond what the model already produced.
fn apply_strength_shaping(samples: &mut [f32], config: &DenoiserConfig, voice_prob: f32) {
    let mut factor = config.strength.base_factor();

    if config.adaptive && voice_prob > config.vad_threshold {
        factor *= 1.0 - voice_prob * 0.5;
    }

    if voice_prob < config.vad_threshold {
        let gain = 1.0 - 0.3 * factor;
        for sample in samples {
            *sample *= gain;
        }
    }
}
