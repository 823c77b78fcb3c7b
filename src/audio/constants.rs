//! Fixed output format of the pipeline.
//!
//! Everything downstream of the resampler is 48 kHz interleaved stereo i16,
//! cut into 20 ms frames.

/// Output sample rate (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

pub const TARGET_CHANNELS: usize = 2;

/// Samples per channel in one 20 ms frame. Also the RTP timestamp step.
pub const SAMPLES_PER_FRAME: usize = 960;

/// Interleaved samples in one frame (960 frames × 2 channels).
pub const FRAME_SIZE_SAMPLES: usize = SAMPLES_PER_FRAME * TARGET_CHANNELS;

/// Frame length in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;

/// Hard ceiling for any gain multiply applied to PCM.
pub const MAX_APPLIED_GAIN: f32 = 2.0;

/// Largest encoded Opus packet we ever emit.
pub const MAX_OPUS_PACKET: usize = 4000;

/// Interleaved samples per second of output audio.
pub const SAMPLES_PER_SECOND: usize = TARGET_SAMPLE_RATE as usize * TARGET_CHANNELS;

/// Scale every sample by `gain` (clamped to [`MAX_APPLIED_GAIN`]), saturating.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    let gain = gain.clamp(0.0, MAX_APPLIED_GAIN);
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        let s = (*sample as f32 * gain) as i32;
        *sample = s.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_above_ceiling_is_clamped() {
        let mut samples = vec![1000i16, -1000];
        apply_gain(&mut samples, 2.5);
        assert_eq!(samples, vec![2000, -2000]);
    }

    #[test]
    fn gain_saturates_instead_of_wrapping() {
        let mut samples = vec![30_000i16, -30_000];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![i16::MAX, i16::MIN]);
    }
}
