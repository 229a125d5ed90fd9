use std::f32::consts::TAU;
use std::sync::Arc;

use quiet_lib::audio::{
    AudioFrame, Denoiser, DenoiserConfig, EventBus, ReductionStrength, MODEL_FRAME_SIZE,
};
use quiet_lib::error::AudioError;

fn denoiser_at(sample_rate: u32) -> Denoiser {
    let bus = Arc::new(EventBus::new());
    let mut denoiser = Denoiser::new(bus);
    denoiser.init(sample_rate).unwrap();
    denoiser
}

fn sine_frame(channels: usize, samples: usize, sample_rate: u32, freq: f32, amp: f32) -> AudioFrame {
    let mut frame = AudioFrame::new(channels, samples, sample_rate).unwrap();
    for ch in 0..channels {
        for i in 0..samples {
            let value = amp * (TAU * freq * i as f32 / sample_rate as f32).sin();
            frame.set_sample(ch, i, value);
        }
    }
    frame
}

/// Deterministic white-ish noise from a linear congruential generator.
fn noise_sample(state: &mut u32) -> f32 {
    *state = state.wrapping_mul(1664525).wrapping_add(1013904223);
    (*state >> 8) as f32 / (1 << 24) as f32 * 2.0 - 1.0
}

fn rms_of(frame: &AudioFrame, channel: usize, offset: usize, len: usize) -> f32 {
    frame.rms(channel, offset, len)
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_process_before_init_is_an_error() {
        let bus = Arc::new(EventBus::new());
        let mut denoiser = Denoiser::new(bus);
        let mut frame = AudioFrame::new(1, 480, 48000).unwrap();
        assert!(matches!(
            denoiser.process(&mut frame),
            Err(AudioError::NotInitialized)
        ));
    }

    #[test]
    fn test_empty_frame_is_an_error() {
        let mut denoiser = denoiser_at(48000);
        let mut frame = AudioFrame::empty();
        assert!(matches!(
            denoiser.process(&mut frame),
            Err(AudioError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_init_rejects_out_of_range_rates() {
        let bus = Arc::new(EventBus::new());
        let mut denoiser = Denoiser::new(bus);
        assert!(denoiser.init(4000).is_err());
        assert!(denoiser.init(48000).is_ok());
    }

    #[test]
    fn test_shutdown_and_reinit() {
        let mut denoiser = denoiser_at(48000);
        assert!(denoiser.is_initialized());
        denoiser.shutdown();
        assert!(!denoiser.is_initialized());
        denoiser.init(44100).unwrap();
        assert!(denoiser.is_initialized());
    }
}

#[cfg(test)]
mod processing_tests {
    use super::*;

    // Scenario: silence in, silence out.
    #[test]
    fn test_silence_stays_silent() {
        let mut denoiser = denoiser_at(48000);
        let mut frame = AudioFrame::new(1, MODEL_FRAME_SIZE, 48000).unwrap();
        denoiser.process(&mut frame).unwrap();

        assert!(frame.peak_magnitude(0, 0, MODEL_FRAME_SIZE) <= 1e-6);
        assert!(denoiser.stats().last_voice_probability <= 0.5);
    }

    // Scenario: a clean 440 Hz tone survives low-strength processing
    // within +-3 dB.
    #[test]
    fn test_tone_preservation_at_low_strength() {
        let mut denoiser = denoiser_at(48000);
        denoiser.set_config(DenoiserConfig {
            enabled: true,
            strength: ReductionStrength::Low,
            vad_threshold: 0.5,
            adaptive: true,
        });

        let samples = 48000;
        let mut frame = sine_frame(1, samples, 48000, 440.0, 0.5);
        let measure_from = MODEL_FRAME_SIZE * 10;
        let input_rms = rms_of(&frame, 0, measure_from, samples - measure_from);

        denoiser.process(&mut frame).unwrap();

        let output_rms = rms_of(&frame, 0, measure_from, samples - measure_from);
        let ratio_db = 20.0 * (output_rms / input_rms).log10();
        assert!(
            ratio_db.abs() <= 3.0,
            "tonal content over-attenuated: {:.2} dB",
            ratio_db
        );
    }

    // Scenario: additive noise on a tone is reduced at medium strength.
    // This is a smoke test on RMS, not an audio-quality metric.
    #[test]
    fn test_noisy_sine_loses_energy() {
        let mut denoiser = denoiser_at(48000);
        denoiser.set_config(DenoiserConfig {
            enabled: true,
            strength: ReductionStrength::Medium,
            vad_threshold: 0.5,
            adaptive: true,
        });

        let mut rng = 0x1234_5678u32;
        let mut input_square_sum = 0.0f64;
        let mut output_square_sum = 0.0f64;

        for block in 0..10 {
            let mut frame = AudioFrame::new(1, MODEL_FRAME_SIZE, 48000).unwrap();
            for i in 0..MODEL_FRAME_SIZE {
                let t = (block * MODEL_FRAME_SIZE + i) as f32 / 48000.0;
                let value = 0.7 * (TAU * 440.0 * t).sin() + 0.2 * noise_sample(&mut rng);
                frame.set_sample(0, i, value);
            }

            // Skip the first block on both sides of the comparison; it
            // carries the group delay.
            if block > 0 {
                let rms = frame.rms(0, 0, MODEL_FRAME_SIZE) as f64;
                input_square_sum += rms * rms;
            }
            denoiser.process(&mut frame).unwrap();
            if block > 0 {
                let rms = frame.rms(0, 0, MODEL_FRAME_SIZE) as f64;
                output_square_sum += rms * rms;
            }
        }

        assert!(
            output_square_sum < input_square_sum,
            "expected energy reduction: in {:.5} out {:.5}",
            input_square_sum,
            output_square_sum
        );
    }

    // Scenario: resampling round-trip at 44.1 kHz keeps the sample count.
    #[test]
    fn test_non_native_rate_round_trip() {
        let mut denoiser = denoiser_at(44100);
        let samples = 4410;
        let mut frame = sine_frame(1, samples, 44100, 1000.0, 0.5);
        denoiser.process(&mut frame).unwrap();

        assert_eq!(frame.samples(), samples);
        // The tone must survive somewhere past the group delay.
        let tail_rms = frame.rms(0, samples / 2, samples / 2);
        assert!(tail_rms > 0.01, "tail silent after resampling: {}", tail_rms);
    }

    // Invariant: disabled processing leaves the frame bit-exact.
    #[test]
    fn test_disabled_processing_is_bit_exact() {
        let mut denoiser = denoiser_at(48000);
        denoiser.set_enabled(false);

        let mut frame = sine_frame(1, 480, 48000, 333.0, 0.4);
        let reference = frame.clone();
        denoiser.process(&mut frame).unwrap();

        for i in 0..480 {
            assert_eq!(
                frame.sample(0, i).to_bits(),
                reference.sample(0, i).to_bits()
            );
        }
    }

    #[test]
    fn test_stereo_channels_are_processed_independently() {
        let mut denoiser = denoiser_at(48000);
        let mut frame = AudioFrame::new(2, MODEL_FRAME_SIZE, 48000).unwrap();
        // Left: tone. Right: silence.
        for i in 0..MODEL_FRAME_SIZE {
            let value = 0.5 * (TAU * 440.0 * i as f32 / 48000.0).sin();
            frame.set_sample(0, i, value);
        }
        denoiser.process(&mut frame).unwrap();

        assert_eq!(frame.channels(), 2);
        assert!(frame.peak_magnitude(1, 0, MODEL_FRAME_SIZE) <= 1e-6);
        assert!(frame.rms(0, 0, MODEL_FRAME_SIZE) > 0.0);
    }

    #[test]
    fn test_partial_frames_queue_until_a_chunk_is_ready() {
        let mut denoiser = denoiser_at(48000);
        // 100 samples < one model chunk: output is pure group delay.
        let mut frame = sine_frame(1, 100, 48000, 440.0, 0.5);
        denoiser.process(&mut frame).unwrap();
        assert!(frame.peak_magnitude(0, 0, 100) <= 1e-6);

        // Keep feeding; once the queue crosses 480 the signal emerges.
        let mut saw_signal = false;
        for _ in 0..10 {
            let mut next = sine_frame(1, 100, 48000, 440.0, 0.5);
            denoiser.process(&mut next).unwrap();
            if next.peak_magnitude(0, 0, 100) > 1e-4 {
                saw_signal = true;
            }
        }
        assert!(saw_signal);
    }
}

#[cfg(test)]
mod config_and_stats_tests {
    use super::*;

    #[test]
    fn test_set_config_clamps_threshold() {
        let denoiser = denoiser_at(48000);
        denoiser.set_config(DenoiserConfig {
            enabled: true,
            strength: ReductionStrength::High,
            vad_threshold: 7.0,
            adaptive: false,
        });
        let config = denoiser.get_config();
        assert_eq!(config.vad_threshold, 1.0);
        assert_eq!(config.strength, ReductionStrength::High);
    }

    #[test]
    fn test_config_change_publishes_event() {
        use quiet_lib::audio::{EventKind, EventPayload};
        use std::sync::atomic::{AtomicU64, Ordering};

        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        bus.subscribe(EventKind::NoiseReductionChanged, move |event| {
            assert!(matches!(event.payload, EventPayload::NoiseReduction(_)));
            sink.fetch_add(1, Ordering::Relaxed);
        });
        bus.start();

        let mut denoiser = Denoiser::new(bus.clone());
        denoiser.init(48000).unwrap();
        denoiser.set_enabled(false);
        denoiser.set_enabled(false); // no-op, no second event
        denoiser.set_config(DenoiserConfig::default());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while count.load(Ordering::Relaxed) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::Relaxed), 2);
        bus.stop();
    }

    #[test]
    fn test_stats_accumulate_and_reset() {
        let mut denoiser = denoiser_at(48000);
        let mut frame = sine_frame(1, 480, 48000, 440.0, 0.5);
        denoiser.process(&mut frame).unwrap();
        let mut frame2 = sine_frame(1, 480, 48000, 440.0, 0.5);
        denoiser.process(&mut frame2).unwrap();

        let stats = denoiser.stats();
        assert_eq!(stats.frames_processed, 2);
        assert!(!stats.vad_history.is_empty());

        denoiser.reset_stats();
        let stats = denoiser.stats();
        assert_eq!(stats.frames_processed, 0);
        assert!(stats.vad_history.is_empty());
        assert_eq!(stats.ema_reduction_db, 0.0);
    }

    #[test]
    fn test_vad_history_is_bounded() {
        use quiet_lib::audio::denoiser::VAD_HISTORY_LEN;

        let mut denoiser = denoiser_at(48000);
        // 200 model frames worth of audio.
        for _ in 0..200 {
            let mut frame = sine_frame(1, 480, 48000, 440.0, 0.3);
            denoiser.process(&mut frame).unwrap();
        }
        assert_eq!(denoiser.stats().vad_history.len(), VAD_HISTORY_LEN);
    }
}
