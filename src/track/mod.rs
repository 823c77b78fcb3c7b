//! One playable item: a ring buffer fed by a lazily started decode thread.

pub mod descriptor;
pub(crate) mod loader;
pub(crate) mod state;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use flume::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub use descriptor::TrackDescriptor;
use loader::{DecodeLoader, LoaderCommand};
use state::TrackState;

use crate::{
    audio::{
        constants::{FRAME_SIZE_SAMPLES, MAX_APPLIED_GAIN, apply_gain},
        decoder::MediaOpener,
        filters::Filters,
    },
    common::{errors::NodeError, types::AtomicF32},
    configs::PlayerConfig,
};

/// Knobs a track needs from the player configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrackOptions {
    pub buffer_seconds: f64,
    pub loading_wait: Duration,
}

impl From<&PlayerConfig> for TrackOptions {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            buffer_seconds: config.buffer_seconds,
            loading_wait: Duration::from_millis(config.loading_wait_ms),
        }
    }
}

impl Default for TrackOptions {
    fn default() -> Self {
        (&PlayerConfig::default()).into()
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct LoaderHandle {
    commands: Sender<LoaderCommand>,
    thread: Option<JoinHandle<()>>,
}

pub struct Track {
    /// Process-unique, never reused.
    serial: u64,
    state: Arc<TrackState>,
    opener: Arc<dyn MediaOpener>,
    options: TrackOptions,
    loader: Mutex<Option<LoaderHandle>>,
    /// Seek requested before the decode thread existed.
    start_at: Mutex<Option<f64>>,
    gain: AtomicF32,
    skipped: AtomicBool,
    announced: AtomicBool,
    cleaned: AtomicBool,
}

/// Round to two decimals.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Track {
    pub fn new(descriptor: TrackDescriptor, opener: Arc<dyn MediaOpener>, options: TrackOptions) -> Self {
        let start_at = (descriptor.start_position > 0.0).then_some(descriptor.start_position);
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(TrackState::new(descriptor, options.buffer_seconds)),
            opener,
            options,
            loader: Mutex::new(None),
            start_at: Mutex::new(start_at),
            gain: AtomicF32::new(1.0),
            skipped: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.state.descriptor
    }

    pub fn id(&self) -> &str {
        &self.state.descriptor.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_live(&self) -> bool {
        self.state.descriptor.is_live
    }

    /// Start the decode thread if it is not running yet.
    fn ensure_loader(&self) {
        if self.cleaned.load(Ordering::Acquire) {
            return;
        }
        let mut loader = self.loader.lock();
        if loader.is_some() {
            return;
        }

        let (tx, rx) = flume::unbounded();
        let start_at = self.start_at.lock().take();
        match DecodeLoader::new(self.state.clone(), self.opener.clone(), rx, start_at).spawn() {
            Ok(thread) => {
                *loader = Some(LoaderHandle {
                    commands: tx,
                    thread: Some(thread),
                });
            }
            Err(e) => {
                warn!("[{}] Failed to spawn decode thread: {}", self.id(), e);
                self.state.fail(NodeError::Io(e));
                self.state.ended.store(true, Ordering::Release);
            }
        }
    }

    fn send(&self, command: LoaderCommand) -> bool {
        match self.loader.lock().as_ref() {
            Some(handle) => handle.commands.send(command).is_ok(),
            None => false,
        }
    }

    pub fn has_stream(&self) -> bool {
        self.loader.lock().is_some()
    }

    /// Begin decoding ahead of the first read.
    pub fn preload(&self) {
        self.ensure_loader();
    }

    /// One 20 ms stereo frame with track gain applied, or `None` when nothing
    /// is buffered. Waits (bounded) while the loader is still producing its
    /// first audio after a start or seek.
    pub fn read(&self) -> Option<Vec<i16>> {
        self.read_frame(true)
    }

    /// Like [`read`](Self::read) but never waits for the loader.
    pub fn try_read(&self) -> Option<Vec<i16>> {
        self.read_frame(false)
    }

    fn read_frame(&self, wait: bool) -> Option<Vec<i16>> {
        if self.state.is_stopped() || self.cleaned.load(Ordering::Acquire) {
            return None;
        }
        self.ensure_loader();

        let ring = &self.state.ring;
        let mut frame = ring.read(FRAME_SIZE_SAMPLES);
        if wait && frame.is_none() && self.state.is_loading() && !self.state.is_ended() {
            ring.wait_readable(self.options.loading_wait);
            frame = ring.read(FRAME_SIZE_SAMPLES);
        }

        let mut frame = frame?;
        frame.resize(FRAME_SIZE_SAMPLES, 0);
        apply_gain(&mut frame, self.gain());
        Some(frame)
    }

    /// Stored gain. May exceed the applied ceiling of 2.0.
    pub fn gain(&self) -> f32 {
        self.gain.load()
    }

    pub fn applied_gain(&self) -> f32 {
        self.gain().clamp(0.0, MAX_APPLIED_GAIN)
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.max(0.0));
    }

    pub fn duration(&self) -> Option<f64> {
        self.state.duration()
    }

    /// Seconds of audio actually handed out: decoded minus still buffered,
    /// both in source time.
    pub fn position(&self) -> f64 {
        (self.state.decoded_position() - self.state.buffered_source_seconds()).max(0.0)
    }

    /// `duration - position` rounded to two decimals; `None` for live tracks.
    pub fn remain(&self) -> Option<f64> {
        self.duration().map(|d| round2((d - self.position()).max(0.0)))
    }

    /// Clamp into `[1, duration - 1]` and reposition the decoder.
    /// Returns the target actually requested.
    pub fn seek(&self, offset_seconds: f64) -> Result<f64, NodeError> {
        let duration = match self.duration() {
            Some(d) if !self.is_live() => d,
            _ => return Err(NodeError::NotSeekable),
        };
        let upper = (duration - 1.0).max(0.0);
        let target = offset_seconds.clamp(1.0f64.min(upper), upper);

        if self.has_stream() {
            self.state.loading.store(true, Ordering::Release);
            self.send(LoaderCommand::Seek(target));
        } else {
            *self.start_at.lock() = Some(target);
            self.state.set_decoded_position(target);
        }
        debug!("[{}] Seek to {:.2}s", self.id(), target);
        Ok(target)
    }

    pub fn filters(&self) -> Filters {
        self.state.filters()
    }

    /// Replace the DSP settings. Once a stream exists this also seeks to the
    /// current position so already-buffered audio is replaced.
    pub fn set_filters(&self, filters: Filters) {
        self.state.set_filters(filters);
        if !self.has_stream() {
            return;
        }
        if self.duration().is_some() && !self.is_live() {
            let here = self.position();
            self.state.loading.store(true, Ordering::Release);
            self.send(LoaderCommand::Seek(here));
        } else {
            self.state.ring.reset();
        }
    }

    /// Ask the loader to rebuild its resampler, e.g. after an upstream
    /// format change was detected out of band.
    pub fn reload_format(&self) -> bool {
        self.send(LoaderCommand::ReloadFormat)
    }

    /// Cooperative stop: the decode loop and the scheduler both observe it.
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        self.send(LoaderCommand::Stop);
        self.state.ring.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Mark for a graceful fade-out and removal by the scheduler.
    pub fn skip(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    /// The decode thread is running and a read would not have to wait for it.
    pub fn has_audio(&self) -> bool {
        self.has_stream() && (!self.state.ring.is_empty() || !self.is_loading())
    }

    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    /// Decoding is over and every buffered sample has been read.
    pub fn is_exhausted(&self) -> bool {
        self.is_ended() && self.state.ring.is_empty()
    }

    /// Fatal error recorded by the loader, handed out once.
    pub fn take_error(&self) -> Option<NodeError> {
        self.state.take_error()
    }

    /// True exactly once: on the first call.
    pub fn mark_announced(&self) -> bool {
        !self.announced.swap(true, Ordering::AcqRel)
    }

    /// Stop the loader and free the buffer. Safe to call any number of times.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.stopped.store(true, Ordering::Release);
        if let Some(mut handle) = self.loader.lock().take() {
            let _ = handle.commands.send(LoaderCommand::Stop);
            // The thread exits on its own once it sees the flag; joining here
            // could stall the scheduler on a blocking read.
            drop(handle.thread.take());
        }
        self.state.ring.release();
        debug!("[{}] Track cleaned up", self.id());
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id())
            .field("gain", &self.gain())
            .field("loading", &self.is_loading())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Instant;

    use super::*;
    use crate::audio::decoder::testing::ToneOpener;

    pub(crate) fn tone_track(id: &str, seconds: Option<f64>, amplitude: i16) -> Track {
        let mut descriptor = TrackDescriptor::new(format!("tone://{}", id), id);
        match seconds {
            Some(s) => descriptor.duration = Some(s),
            None => descriptor = descriptor.live(),
        }
        Track::new(
            descriptor,
            Arc::new(ToneOpener::new(amplitude)),
            TrackOptions {
                buffer_seconds: 1.0,
                loading_wait: Duration::from_secs(2),
            },
        )
    }

    #[test]
    fn first_read_starts_loader_and_waits_for_audio() {
        let track = tone_track("a", Some(30.0), 1000);
        assert!(!track.has_stream());
        let frame = track.read().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE_SAMPLES);
        assert!(frame.iter().all(|&s| s == 1000));
    }

    #[test]
    fn stored_gain_above_two_applies_two() {
        let track = tone_track("a", Some(30.0), 1000);
        track.set_gain(2.5);
        assert_eq!(track.gain(), 2.5);
        assert_eq!(track.applied_gain(), 2.0);
        let frame = track.read().unwrap();
        assert!(frame.iter().all(|&s| s == 2000));
    }

    #[test]
    fn seek_clamps_into_track_bounds() {
        let track = tone_track("a", Some(120.0), 1);
        assert_eq!(track.seek(0.0).unwrap(), 1.0);
        assert_eq!(track.seek(200.0).unwrap(), 119.0);
        assert_eq!(track.seek(42.0).unwrap(), 42.0);
    }

    #[test]
    fn live_tracks_are_not_seekable() {
        let track = tone_track("radio", None, 1);
        assert!(matches!(track.seek(10.0), Err(NodeError::NotSeekable)));
        assert_eq!(track.remain(), None);
        assert_eq!(track.duration(), None);
    }

    #[test]
    fn seek_before_start_sets_start_position() {
        let track = tone_track("a", Some(120.0), 1);
        track.seek(60.0).unwrap();
        let _ = track.read().unwrap();
        assert!(track.position() >= 59.9);
        assert!(track.remain().unwrap() <= 60.1);
    }

    #[test]
    fn remain_is_rounded() {
        let track = tone_track("a", Some(10.0), 1);
        let remain = track.remain().unwrap();
        assert_eq!(remain, (remain * 100.0).round() / 100.0);
        assert_eq!(remain, 10.0);
    }

    #[test]
    fn reads_until_exhausted() {
        let track = tone_track("a", Some(0.1), 7);
        let mut frames = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !track.is_exhausted() && Instant::now() < deadline {
            if track.read().is_some() {
                frames += 1;
            }
        }
        assert_eq!(frames, 5);
        assert!(track.read().is_none());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let track = tone_track("a", Some(30.0), 1);
        track.preload();
        track.cleanup();
        track.cleanup();
        assert!(track.read().is_none());
        assert!(track.is_stopped());
    }

    #[test]
    fn filter_change_flushes_buffer_and_keeps_position() {
        let track = tone_track("a", Some(30.0), 1000);
        assert_eq!(track.read().unwrap()[0], 1000);
        let deadline = Instant::now() + Duration::from_secs(2);
        while track.state.ring.is_accepting() {
            assert!(Instant::now() < deadline, "buffer never filled");
            std::thread::sleep(Duration::from_millis(1));
        }
        let before = track.position();

        track.set_filters(Filters {
            volume: Some(0.5),
            ..Default::default()
        });
        assert_eq!(track.filters().volume, Some(0.5));
        std::thread::sleep(Duration::from_millis(300));

        // At most the frame that was about to play survives the flush.
        let frames: Vec<i16> = (0..2).filter_map(|_| track.read()).map(|f| f[0]).collect();
        assert_eq!(frames.last(), Some(&500));
        assert!((track.position() - before).abs() < 0.1);
    }

    #[test]
    fn has_audio_needs_a_running_loader() {
        let track = tone_track("a", Some(30.0), 1);
        assert!(!track.has_audio());
        track.preload();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !track.has_audio() {
            assert!(Instant::now() < deadline, "loader never produced audio");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(track.try_read().is_some());
    }

    #[test]
    fn serials_are_unique() {
        let a = tone_track("a", Some(30.0), 1);
        let b = tone_track("a", Some(30.0), 1);
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn announce_fires_once() {
        let track = tone_track("a", Some(30.0), 1);
        assert!(track.mark_announced());
        assert!(!track.mark_announced());
    }
}
