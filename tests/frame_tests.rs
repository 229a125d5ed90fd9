use quiet_lib::audio::AudioFrame;

#[cfg(test)]
mod allocation_tests {
    use super::*;

    #[test]
    fn test_new_frame_is_zero_initialized() {
        let frame = AudioFrame::new(2, 480, 48000).unwrap();
        for ch in 0..2 {
            assert!(frame.channel(ch).iter().all(|&s| s == 0.0));
            assert!(frame.channel(ch).iter().all(|s| s.is_sign_positive()));
        }
    }

    #[test]
    fn test_resize_is_idempotent_for_matching_dimensions() {
        let mut frame = AudioFrame::new(1, 256, 48000).unwrap();
        frame.set_sample(0, 10, 0.75);
        frame.resize(1, 256, false).unwrap();
        assert_eq!(frame.sample(0, 10), 0.75);

        frame.resize(1, 256, true).unwrap();
        assert_eq!(frame.sample(0, 10), 0.0);
    }

    #[test]
    fn test_resize_to_new_dimensions_reallocates_zeroed() {
        let mut frame = AudioFrame::new(1, 64, 48000).unwrap();
        frame.set_sample(0, 0, 1.0);
        frame.resize(2, 128, false).unwrap();
        assert_eq!(frame.channels(), 2);
        assert_eq!(frame.samples(), 128);
        assert!(frame.channel(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_clone_is_an_independent_allocation() {
        let mut frame = AudioFrame::new(1, 32, 44100).unwrap();
        frame.set_sample(0, 5, 0.5);
        let mut copy = frame.clone();
        copy.set_sample(0, 5, -0.5);
        assert_eq!(frame.sample(0, 5), 0.5);
        assert_eq!(copy.sample(0, 5), -0.5);
        assert_eq!(copy.sample_rate(), 44100);
    }

    #[test]
    fn test_take_transfers_ownership_and_empties_source() {
        let mut frame = AudioFrame::new(2, 16, 48000).unwrap();
        frame.set_sample(0, 0, 0.25);
        let moved = frame.take();
        assert!(frame.is_empty());
        assert_eq!(frame.channels(), 0);
        assert_eq!(moved.sample(0, 0), 0.25);
    }
}

#[cfg(test)]
mod copy_tests {
    use super::*;

    // Invariant: an in-bounds copy reproduces the source range bit-exact.
    #[test]
    fn test_copy_from_is_bit_exact() {
        let mut src = AudioFrame::new(1, 100, 48000).unwrap();
        for i in 0..100 {
            src.set_sample(0, i, (i as f32 * 0.731).sin());
        }
        let mut dst = AudioFrame::new(1, 100, 48000).unwrap();
        dst.copy_from(&src, 0, 0, 0, 0, 100);
        for i in 0..100 {
            assert_eq!(dst.sample(0, i).to_bits(), src.sample(0, i).to_bits());
        }
    }

    #[test]
    fn test_copy_from_clamps_to_overlap() {
        let src = AudioFrame::new(1, 10, 48000).unwrap();
        let mut dst = AudioFrame::new(1, 10, 48000).unwrap();
        // Request far more than either side holds; must not panic.
        dst.copy_from(&src, 0, 5, 0, 8, 1000);
        dst.copy_from(&src, 7, 0, 0, 0, 10);
        dst.copy_from(&src, 0, 50, 0, 0, 10);
    }

    #[test]
    fn test_add_from_applies_gain() {
        let mut src = AudioFrame::new(1, 4, 48000).unwrap();
        for i in 0..4 {
            src.set_sample(0, i, 1.0);
        }
        let mut dst = AudioFrame::new(1, 4, 48000).unwrap();
        dst.copy_from(&src, 0, 0, 0, 0, 4);
        dst.add_from(&src, 0, 0, 0, 0, 4, 0.5);
        for i in 0..4 {
            assert!((dst.sample(0, i) - 1.5).abs() < 1e-6);
        }
    }
}

#[cfg(test)]
mod clear_tests {
    use super::*;

    // Invariant: clear writes +0.0 into every slot.
    #[test]
    fn test_clear_writes_positive_zero_everywhere() {
        let mut frame = AudioFrame::new(2, 137, 48000).unwrap();
        for ch in 0..2 {
            for i in 0..137 {
                frame.set_sample(ch, i, -0.25);
            }
        }
        frame.clear();
        for ch in 0..2 {
            for &s in frame.channel(ch) {
                assert_eq!(s.to_bits(), 0.0f32.to_bits());
            }
        }
    }

    #[test]
    fn test_clear_range_only_touches_the_range() {
        let mut frame = AudioFrame::new(1, 16, 48000).unwrap();
        for i in 0..16 {
            frame.set_sample(0, i, 1.0);
        }
        frame.clear_range(0, 4, 8);
        for i in 0..16 {
            let expected = if (4..12).contains(&i) { 0.0 } else { 1.0 };
            assert_eq!(frame.sample(0, i), expected);
        }
    }
}

#[cfg(test)]
mod analysis_tests {
    use super::*;

    #[test]
    fn test_rms_of_constant_signal() {
        let mut frame = AudioFrame::new(1, 1000, 48000).unwrap();
        for i in 0..1000 {
            frame.set_sample(0, i, 0.5);
        }
        assert!((frame.rms(0, 0, 1000) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_peak_magnitude_finds_negative_extremes() {
        let mut frame = AudioFrame::new(1, 100, 48000).unwrap();
        frame.set_sample(0, 42, -0.9);
        frame.set_sample(0, 10, 0.3);
        assert!((frame.peak_magnitude(0, 0, 100) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_min_max_over_range() {
        let mut frame = AudioFrame::new(1, 10, 48000).unwrap();
        frame.set_sample(0, 3, -0.7);
        frame.set_sample(0, 7, 0.4);
        let (min, max) = frame.min_max(0, 0, 10);
        assert_eq!(min, -0.7);
        assert_eq!(max, 0.4);
    }

    #[test]
    fn test_out_of_range_analysis_returns_zero() {
        let frame = AudioFrame::new(1, 10, 48000).unwrap();
        assert_eq!(frame.rms(5, 0, 10), 0.0);
        assert_eq!(frame.peak_magnitude(0, 100, 10), 0.0);
        assert_eq!(frame.min_max(3, 0, 10), (0.0, 0.0));
    }

    #[test]
    fn test_has_clipped_detects_overs() {
        let mut frame = AudioFrame::new(1, 8, 48000).unwrap();
        assert!(!frame.has_clipped());
        frame.set_sample(0, 2, 1.5);
        assert!(frame.has_clipped());
    }
}

#[cfg(test)]
mod conversion_tests {
    use super::*;

    // Invariant: interleave then deinterleave is the identity.
    #[test]
    fn test_interleave_round_trip_is_identity() {
        let mut frame = AudioFrame::new(2, 480, 48000).unwrap();
        for ch in 0..2 {
            for i in 0..480 {
                frame.set_sample(ch, i, ((ch * 480 + i) as f32 * 0.017).sin());
            }
        }

        let mut interleaved = Vec::new();
        frame.interleave_into(&mut interleaved);
        assert_eq!(interleaved.len(), 960);

        let mut restored = AudioFrame::new(2, 480, 48000).unwrap();
        restored.deinterleave_from(&interleaved, 480).unwrap();

        for ch in 0..2 {
            for i in 0..480 {
                assert_eq!(
                    restored.sample(ch, i).to_bits(),
                    frame.sample(ch, i).to_bits()
                );
            }
        }
    }

    #[test]
    fn test_to_mono_averages_all_channels() {
        let mut frame = AudioFrame::new(2, 8, 48000).unwrap();
        for i in 0..8 {
            frame.set_sample(0, i, 0.8);
            frame.set_sample(1, i, 0.2);
        }
        let mut mono = AudioFrame::empty();
        frame.to_mono_into(&mut mono).unwrap();
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.samples(), 8);
        for &s in mono.channel(0) {
            assert!((s - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_to_stereo_duplicates_mono() {
        let mut mono = AudioFrame::new(1, 8, 48000).unwrap();
        for i in 0..8 {
            mono.set_sample(0, i, 0.3);
        }
        let mut stereo = AudioFrame::empty();
        mono.to_stereo_into(&mut stereo).unwrap();
        assert_eq!(stereo.channels(), 2);
        for ch in 0..2 {
            for &s in stereo.channel(ch) {
                assert!((s - 0.3).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_to_stereo_keeps_first_two_of_many() {
        let mut multi = AudioFrame::new(4, 4, 48000).unwrap();
        for ch in 0..4 {
            for i in 0..4 {
                multi.set_sample(ch, i, ch as f32);
            }
        }
        let mut stereo = AudioFrame::empty();
        multi.to_stereo_into(&mut stereo).unwrap();
        assert!(stereo.channel(0).iter().all(|&s| s == 0.0));
        assert!(stereo.channel(1).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_gain_and_reverse() {
        let mut frame = AudioFrame::new(1, 4, 48000).unwrap();
        for i in 0..4 {
            frame.set_sample(0, i, (i + 1) as f32 * 0.1);
        }
        frame.apply_gain(2.0);
        assert!((frame.sample(0, 3) - 0.8).abs() < 1e-6);

        frame.reverse(0, 0, 4);
        assert!((frame.sample(0, 0) - 0.8).abs() < 1e-6);
        assert!((frame.sample(0, 3) - 0.2).abs() < 1e-6);
    }
}
