//! Decode thread: locator → decoded frames → filters → 48 kHz stereo → ring.

use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::Duration,
};

use flume::{Receiver, TryRecvError};
use tracing::{Level, debug, info, span, warn};

use super::state::TrackState;
use crate::{
    audio::{
        decoder::{DecodeError, FrameDecoder, MediaOpener, StreamParams},
        filters::{FilterGraph, FilterOutput},
        resample::{Resampler, to_stereo},
    },
    common::errors::NodeError,
};

/// Consecutive transient errors tolerated before the stream is declared dead.
const MAX_TRANSIENT_STREAK: u32 = 32;

/// How long one backpressure wait lasts before commands are re-checked.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LoaderCommand {
    /// Reposition to the given source time in seconds.
    Seek(f64),
    /// Rebuild the resampler against the current stream parameters.
    ReloadFormat,
    Stop,
}

#[derive(Debug, Default, PartialEq)]
struct Pending {
    seek: Option<f64>,
    reload: bool,
    stop: bool,
}

enum PushOutcome {
    Written,
    /// A command arrived while waiting; the rest of the frame is dropped.
    Interrupted,
    Stopped,
}

/// Runs on exit regardless of path: closes the demuxer and marks the track
/// as no longer producing.
struct ExitGuard {
    state: Arc<TrackState>,
    decoder: Option<Box<dyn FrameDecoder>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
        self.state.loading.store(false, Ordering::Release);
        self.state.ended.store(true, Ordering::Release);
        self.state.ring.wake_readers();
    }
}

pub(crate) struct DecodeLoader {
    state: Arc<TrackState>,
    opener: Arc<dyn MediaOpener>,
    commands: Receiver<LoaderCommand>,
    start_at: Option<f64>,
}

impl DecodeLoader {
    pub fn new(
        state: Arc<TrackState>,
        opener: Arc<dyn MediaOpener>,
        commands: Receiver<LoaderCommand>,
        start_at: Option<f64>,
    ) -> Self {
        Self {
            state,
            opener,
            commands,
            start_at,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        self.state.loading.store(true, Ordering::Release);
        let name = format!("decode-{}", self.state.descriptor.id);
        thread::Builder::new().name(name).spawn(move || self.run())
    }

    fn drain_commands(&self) -> Pending {
        let mut pending = Pending::default();
        loop {
            match self.commands.try_recv() {
                Ok(LoaderCommand::Seek(at)) => pending.seek = Some(at),
                Ok(LoaderCommand::ReloadFormat) => pending.reload = true,
                Ok(LoaderCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    pending.stop = true;
                    return pending;
                }
                Err(TryRecvError::Empty) => return pending,
            }
        }
    }

    fn push(&self, mut samples: &[i16]) -> PushOutcome {
        let ring = &self.state.ring;
        loop {
            let taken = ring.write(samples);
            samples = &samples[taken..];
            if samples.is_empty() {
                return PushOutcome::Written;
            }
            if self.state.is_stopped() || ring.is_closed() {
                return PushOutcome::Stopped;
            }
            if !self.commands.is_empty() {
                return PushOutcome::Interrupted;
            }
            ring.wait_accepting(BACKPRESSURE_POLL);
        }
    }

    /// Filters always see stereo, at the decoder's own rate.
    fn graph_for(&self, params: StreamParams) -> FilterGraph {
        FilterGraph::build(
            &self.state.filters(),
            StreamParams {
                sample_rate: params.sample_rate,
                channels: 2,
            },
        )
    }

    fn run(self) {
        let id = self.state.descriptor.id.clone();
        let _span = span!(Level::DEBUG, "decode", track = %id).entered();

        let mut guard = ExitGuard {
            state: self.state.clone(),
            decoder: None,
        };

        let mut decoder = match self.opener.open(&self.state.descriptor) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("[{}] Failed to open stream: {}", id, e);
                self.state.fail(e);
                return;
            }
        };
        self.state.set_duration(decoder.duration());

        if let Some(at) = self.start_at.filter(|at| *at > 0.0) {
            match decoder.seek(at) {
                Ok(actual) => self.state.set_decoded_position(actual),
                Err(e) => warn!("[{}] Start position {}s not applied: {}", id, at, e),
            }
        }

        let mut params = decoder.params();
        let mut resampler = Resampler::new(params);
        let mut graph = self.graph_for(params);
        let mut filters_version = self.state.filters_version();
        let mut reload = false;
        let mut streak = 0u32;
        guard.decoder = Some(decoder);

        info!("[{}] Decode loop started ({}Hz {}ch)", id, params.sample_rate, params.channels);

        loop {
            let pending = self.drain_commands();
            if pending.stop || self.state.is_stopped() {
                debug!("[{}] Decode loop stopped", id);
                break;
            }
            reload |= pending.reload;

            let Some(decoder) = guard.decoder.as_mut() else {
                break;
            };

            if self.state.filters_version() != filters_version {
                filters_version = self.state.filters_version();
                graph = self.graph_for(params);
                debug!("[{}] Filter graph rebuilt (active={})", id, graph.is_active());
            }

            if reload {
                reload = false;
                resampler = Resampler::new(params);
                graph = self.graph_for(params);
                debug!("[{}] Resampler rebuilt for {:?}", id, params);
            }

            if let Some(at) = pending.seek {
                match decoder.seek(at) {
                    Ok(actual) => {
                        self.state.ring.reset();
                        graph.reset();
                        resampler.reset();
                        self.state.set_decoded_position(actual);
                        self.state.loading.store(true, Ordering::Release);
                        debug!("[{}] Seeked to {:.2}s (asked {:.2}s)", id, actual, at);
                    }
                    Err(DecodeError::Transient(m)) => warn!("[{}] Seek failed: {}", id, m),
                    Err(DecodeError::Fatal(e)) => {
                        self.state.fail(e);
                        break;
                    }
                }
            }

            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("[{}] End of stream", id);
                    break;
                }
                Err(DecodeError::Transient(m)) => {
                    streak += 1;
                    if streak > MAX_TRANSIENT_STREAK {
                        self.state.fail(NodeError::DecodeFatal(format!(
                            "{} consecutive decode errors, last: {}",
                            streak, m
                        )));
                        break;
                    }
                    debug!("[{}] Skipping bad frame: {}", id, m);
                    continue;
                }
                Err(DecodeError::Fatal(e)) => {
                    warn!("[{}] Decode failed: {}", id, e);
                    self.state.fail(e);
                    break;
                }
            };
            streak = 0;

            if let Err(mismatch) = resampler.check(frame.params) {
                debug!("[{}] {}; dropping frame", id, mismatch);
                params = frame.params;
                reload = true;
                continue;
            }

            // Position follows the decoder, not the filtered output.
            let frame_end = frame.timestamp + frame.duration();
            let stereo = to_stereo(&frame.samples, frame.params.channels);
            let filtered = match graph.process(stereo) {
                FilterOutput::Frame(samples) => samples,
                FilterOutput::NeedsMore => {
                    self.state.set_decoded_position(frame_end);
                    continue;
                }
            };
            let output = resampler.process(&filtered);

            match self.push(&output) {
                PushOutcome::Written | PushOutcome::Interrupted => {
                    self.state.set_decoded_position(frame_end);
                    self.state.loading.store(false, Ordering::Release);
                }
                PushOutcome::Stopped => break,
            }
        }
    }
}
