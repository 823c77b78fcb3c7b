//! Conversion of decoded PCM into the fixed 48 kHz stereo output format.

use thiserror::Error;

use crate::audio::{
    constants::{TARGET_CHANNELS, TARGET_SAMPLE_RATE},
    decoder::StreamParams,
};

/// The frame handed to the resampler no longer matches the format it was
/// built for. Recoverable: rebuild the resampler and drop the frame.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("resampler built for {expected:?}, got {actual:?}")]
pub struct FormatMismatch {
    pub expected: StreamParams,
    pub actual: StreamParams,
}

/// Interleave any channel layout into stereo. Mono is duplicated, extra
/// channels beyond the first two are dropped.
pub fn to_stereo(samples: &[i16], channels: usize) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Linear-interpolation rate converter with channel mapping to stereo.
pub struct Resampler {
    source: StreamParams,
    /// Source / target ratio (< 1.0 upsamples, > 1.0 downsamples).
    ratio: f64,
    /// Fractional read head relative to the current input block.
    index: f64,
    /// Last stereo frame of the previous block for cross-block interpolation.
    last: [i16; TARGET_CHANNELS],
}

impl Resampler {
    pub fn new(source: StreamParams) -> Self {
        Self {
            source,
            ratio: source.sample_rate as f64 / TARGET_SAMPLE_RATE as f64,
            index: 0.0,
            last: [0; TARGET_CHANNELS],
        }
    }

    pub fn source(&self) -> StreamParams {
        self.source
    }

    pub fn is_passthrough(&self) -> bool {
        self.source.sample_rate == TARGET_SAMPLE_RATE
    }

    /// Fails when `params` differ from the format this resampler was built for.
    pub fn check(&self, params: StreamParams) -> Result<(), FormatMismatch> {
        if params != self.source {
            return Err(FormatMismatch {
                expected: self.source,
                actual: params,
            });
        }
        Ok(())
    }

    /// Resample interleaved stereo at the source rate to the output rate.
    pub fn process(&mut self, stereo: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return stereo.to_vec();
        }

        let frames = stereo.len() / TARGET_CHANNELS;
        let mut out =
            Vec::with_capacity(((frames as f64 / self.ratio) as usize + 1) * TARGET_CHANNELS);

        while self.index < frames as f64 {
            let idx = self.index as usize;
            let fract = self.index.fract();

            for c in 0..TARGET_CHANNELS {
                let s1 = if idx == 0 {
                    self.last[c] as f64
                } else {
                    stereo[(idx - 1) * TARGET_CHANNELS + c] as f64
                };
                let s2 = stereo[idx * TARGET_CHANNELS + c] as f64;
                out.push((s1 * (1.0 - fract) + s2 * fract) as i16);
            }

            self.index += self.ratio;
        }
        self.index -= frames as f64;

        if frames > 0 {
            let tail = (frames - 1) * TARGET_CHANNELS;
            self.last.copy_from_slice(&stereo[tail..tail + TARGET_CHANNELS]);
        }
        out
    }

    pub fn reset(&mut self) {
        self.index = 0.0;
        self.last = [0; TARGET_CHANNELS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sample_rate: u32, channels: usize) -> StreamParams {
        StreamParams {
            sample_rate,
            channels,
        }
    }

    #[test]
    fn mono_is_duplicated() {
        assert_eq!(to_stereo(&[1, 2], 1), vec![1, 1, 2, 2]);
    }

    #[test]
    fn surround_keeps_front_pair() {
        assert_eq!(to_stereo(&[1, 2, 3, 4, 5, 6], 3), vec![1, 2, 4, 5]);
    }

    #[test]
    fn upsampling_doubles_frame_count() {
        let mut r = Resampler::new(params(24_000, 2));
        let out = r.process(&[100; 2 * 480]);
        assert_eq!(out.len(), 2 * 960);
    }

    #[test]
    fn downsampling_roughly_preserves_duration() {
        let mut r = Resampler::new(params(96_000, 2));
        let mut total = 0;
        for _ in 0..10 {
            total += r.process(&[0; 2 * 1920]).len();
        }
        assert_eq!(total, 10 * 2 * 960);
    }

    #[test]
    fn format_change_is_reported() {
        let r = Resampler::new(params(44_100, 2));
        assert!(r.check(params(44_100, 2)).is_ok());
        let err = r.check(params(48_000, 1)).unwrap_err();
        assert_eq!(err.actual, params(48_000, 1));
    }
}
