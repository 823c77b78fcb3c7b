//! Boundary between the pipeline and the codec library.
//!
//! The loader only ever sees [`FrameDecoder`]; how a locator becomes one is
//! the [`MediaOpener`]'s business.

pub mod symphonia_decoder;

use thiserror::Error;

use crate::{common::errors::NodeError, track::TrackDescriptor};

pub use symphonia_decoder::{SymphoniaDecoder, SymphoniaOpener};

/// Sample rate and channel count of a decoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: usize,
}

/// One block of interleaved PCM as the codec produced it.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub samples: Vec<i16>,
    pub params: StreamParams,
    /// Presentation time of the first sample, in seconds.
    pub timestamp: f64,
}

impl DecodedFrame {
    /// Duration covered by this frame, in seconds.
    pub fn duration(&self) -> f64 {
        let channels = self.params.channels.max(1);
        (self.samples.len() / channels) as f64 / self.params.sample_rate.max(1) as f64
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// A bad packet or a reset request. The loader drops the frame and goes on.
    #[error("transient decode error: {0}")]
    Transient(String),
    /// Anything else. The track ends with an exception event.
    #[error(transparent)]
    Fatal(NodeError),
}

impl DecodeError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(NodeError::DecodeFatal(message.into()))
    }

    pub fn into_node_error(self) -> NodeError {
        match self {
            Self::Transient(m) => NodeError::DecodeTransient(m),
            Self::Fatal(e) => e,
        }
    }
}

pub trait FrameDecoder: Send {
    fn params(&self) -> StreamParams;

    /// Total length in seconds, `None` for live or unknown-length streams.
    fn duration(&self) -> Option<f64>;

    /// Next decoded block. `Ok(None)` is end of stream.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError>;

    /// Reposition near `seconds`. Returns where the stream actually landed;
    /// frame-exact placement is not guaranteed.
    fn seek(&mut self, seconds: f64) -> Result<f64, DecodeError>;

    /// Release the underlying demuxer and its I/O.
    fn close(&mut self) {}
}

/// Turns a descriptor into a running decoder. Called on the decode thread,
/// so implementations may block.
pub trait MediaOpener: Send + Sync {
    fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, NodeError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::audio::constants::{SAMPLES_PER_FRAME, TARGET_SAMPLE_RATE};

    /// Scripted failure injected after `after` frames.
    #[derive(Debug, Clone)]
    pub enum Fault {
        Transient { after: usize, count: usize },
        Fatal { after: usize },
    }

    const TONE_PARAMS: StreamParams = StreamParams {
        sample_rate: TARGET_SAMPLE_RATE,
        channels: 2,
    };

    /// Constant-amplitude 20 ms frames of a fixed length, 48 kHz stereo
    /// unless `switch` changes the format after some number of frames.
    pub struct ToneDecoder {
        pub amplitude: i16,
        pub length: Option<f64>,
        pub position: f64,
        pub frames: usize,
        pub fault: Option<Fault>,
        pub switch: Option<(usize, StreamParams)>,
        pub closed: Arc<AtomicBool>,
    }

    impl ToneDecoder {
        pub fn new(amplitude: i16, length: Option<f64>) -> Self {
            Self {
                amplitude,
                length,
                position: 0.0,
                frames: 0,
                fault: None,
                switch: None,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameDecoder for ToneDecoder {
        fn params(&self) -> StreamParams {
            match self.switch {
                Some((after, params)) if self.frames >= after => params,
                _ => TONE_PARAMS,
            }
        }

        fn duration(&self) -> Option<f64> {
            self.length
        }

        fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
            match self.fault.as_mut() {
                Some(Fault::Transient { after, count }) if self.frames >= *after && *count > 0 => {
                    *count -= 1;
                    return Err(DecodeError::Transient("corrupt packet".into()));
                }
                Some(Fault::Fatal { after }) if self.frames >= *after => {
                    return Err(DecodeError::fatal("stream truncated"));
                }
                _ => {}
            }

            let params = self.params();
            let frame_secs = SAMPLES_PER_FRAME as f64 / TARGET_SAMPLE_RATE as f64;
            let per_channel = (params.sample_rate as f64 * frame_secs).round() as usize;
            if let Some(length) = self.length {
                if self.position + frame_secs > length + 1e-9 {
                    return Ok(None);
                }
            }

            let frame = DecodedFrame {
                samples: vec![self.amplitude; per_channel * params.channels],
                params,
                timestamp: self.position,
            };
            self.position += frame_secs;
            self.frames += 1;
            Ok(Some(frame))
        }

        fn seek(&mut self, seconds: f64) -> Result<f64, DecodeError> {
            self.position = seconds;
            Ok(seconds)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Opener that hands out [`ToneDecoder`]s sized from the descriptor.
    #[derive(Default)]
    pub struct ToneOpener {
        pub amplitude: i16,
        pub fault: Option<Fault>,
        pub fail_open: Option<NodeError>,
        pub switch: Option<(usize, StreamParams)>,
        /// Sleep this long before opening the track with this id.
        pub open_delay: Option<(String, Duration)>,
        pub opened: AtomicUsize,
        pub last_closed: parking_lot::Mutex<Option<Arc<AtomicBool>>>,
    }

    impl ToneOpener {
        pub fn new(amplitude: i16) -> Self {
            Self {
                amplitude,
                ..Default::default()
            }
        }
    }

    impl MediaOpener for ToneOpener {
        fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, NodeError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if let Some((id, delay)) = &self.open_delay {
                if *id == descriptor.id {
                    thread::sleep(*delay);
                }
            }
            if let Some(err) = &self.fail_open {
                return Err(err.clone());
            }
            let length = if descriptor.is_live {
                None
            } else {
                descriptor.duration
            };
            let mut decoder = ToneDecoder::new(self.amplitude, length);
            decoder.fault = self.fault.clone();
            decoder.switch = self.switch;
            *self.last_closed.lock() = Some(decoder.closed.clone());
            Ok(Box::new(decoder))
        }
    }
}
