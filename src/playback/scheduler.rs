//! The per-connection pump thread: one mixer tick per period, paced against
//! an absolute timeline.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info_span, warn};

use crate::{
    audio::decoder::MediaOpener,
    common::{
        errors::NodeError,
        types::{AtomicF32, GuildId},
    },
    configs::PlayerConfig,
    playback::{mixer::TickMixer, queue::SharedQueue},
    protocol::EventEmitter,
};

/// Poll step while waiting for the transport to come back.
const TRANSPORT_POLL: Duration = Duration::from_millis(5);

/// Falling further behind than this many ticks restarts the timeline
/// instead of bursting to catch up.
const MAX_LATE_TICKS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Running = 0,
    Paused = 1,
    Stopped = 2,
}

impl SchedulerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// Where finished frames go. Implemented by the voice link.
pub trait FrameSink: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send_frame(&self, pcm: &[i16]) -> Result<(), NodeError>;
    fn set_speaking(&self, speaking: bool);
}

/// Deadlines at `origin + index * period`.
#[derive(Debug)]
pub struct Timeline {
    origin: Instant,
    index: u32,
    period: Duration,
}

impl Timeline {
    pub fn new(origin: Instant, period: Duration) -> Self {
        Self {
            origin,
            index: 0,
            period,
        }
    }

    pub fn reset(&mut self, origin: Instant) {
        self.origin = origin;
        self.index = 0;
    }

    /// Advance one tick and return how long to sleep until its deadline.
    pub fn advance(&mut self, now: Instant) -> Duration {
        self.index = self.index.saturating_add(1);
        let deadline = self.origin + self.period * self.index;
        if now > deadline + self.period * MAX_LATE_TICKS {
            self.reset(now);
            return Duration::ZERO;
        }
        deadline.saturating_duration_since(now)
    }
}

/// Control side of a running scheduler.
pub struct SchedulerHandle {
    state: Arc<AtomicU8>,
    master_target: Arc<AtomicF32>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, to: SchedulerState) -> bool {
        let from = self.state();
        if from == SchedulerState::Stopped {
            return false;
        }
        self.state.store(to as u8, Ordering::Release);
        from != to
    }

    pub fn pause(&self) -> bool {
        self.transition(SchedulerState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(SchedulerState::Running)
    }

    pub fn is_paused(&self) -> bool {
        self.state() == SchedulerState::Paused
    }

    /// Target for the master gain glide. Values above 2.0 are stored but the
    /// applied gain never exceeds 2.0.
    pub fn set_volume(&self, volume: f32) {
        self.master_target.store(volume.max(0.0));
    }

    pub fn volume(&self) -> f32 {
        self.master_target.load()
    }

    /// Clear the run flag. The thread exits within one tick.
    pub fn stop(&self) {
        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        drop(self.thread.lock().take());
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct PlaybackScheduler {
    guild_id: GuildId,
    mixer: TickMixer,
    queue: SharedQueue,
    sink: Arc<dyn FrameSink>,
    state: Arc<AtomicU8>,
    master_target: Arc<AtomicF32>,
    period: Duration,
    reconnect_wait: Duration,
    speaking: bool,
}

impl PlaybackScheduler {
    pub fn new(
        guild_id: GuildId,
        config: &PlayerConfig,
        queue: SharedQueue,
        sink: Arc<dyn FrameSink>,
        opener: Arc<dyn MediaOpener>,
        emitter: EventEmitter,
        master_target: Arc<AtomicF32>,
    ) -> Self {
        let mixer = TickMixer::new(
            guild_id.clone(),
            config.clone(),
            opener,
            emitter,
            master_target.clone(),
        );
        Self {
            guild_id,
            mixer,
            queue,
            sink,
            state: Arc::new(AtomicU8::new(SchedulerState::Running as u8)),
            master_target,
            period: Duration::from_millis(config.tick_ms),
            reconnect_wait: Duration::from_millis(config.reconnect_wait_ms),
            speaking: false,
        }
    }

    pub fn spawn(self) -> io::Result<SchedulerHandle> {
        let state = self.state.clone();
        let master_target = self.master_target.clone();
        let thread = thread::Builder::new()
            .name(format!("playback-{}", self.guild_id))
            .spawn(move || self.run())?;
        Ok(SchedulerHandle {
            state,
            master_target,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn run(mut self) {
        let span = info_span!("playback", guild = %self.guild_id);
        let _enter = span.enter();
        debug!("Scheduler started ({:?} ticks)", self.period);

        let mut timeline = Timeline::new(Instant::now(), self.period);
        while self.state() != SchedulerState::Stopped {
            if !self.sink.is_connected() {
                self.set_speaking(false);
                if !self.wait_for_transport() {
                    continue;
                }
                debug!("Transport connected, restarting timeline");
                timeline.reset(Instant::now());
            }

            match self.state() {
                SchedulerState::Running => self.run_tick(),
                SchedulerState::Paused => self.set_speaking(false),
                SchedulerState::Stopped => break,
            }

            let sleep = timeline.advance(Instant::now());
            if !sleep.is_zero() {
                thread::sleep(sleep);
            }
        }

        self.set_speaking(false);
        debug!("Scheduler stopped");
    }

    fn run_tick(&mut self) {
        match self.mixer.tick(&self.queue) {
            Some(frame) => {
                self.set_speaking(true);
                if let Err(e) = self.sink.send_frame(&frame) {
                    warn!("Failed to send frame: {}", e);
                }
            }
            None => self.set_speaking(false),
        }
    }

    /// Bounded busy-wait for the transport. True once it is connected.
    fn wait_for_transport(&self) -> bool {
        let started = Instant::now();
        while started.elapsed() < self.reconnect_wait {
            if self.sink.is_connected() {
                return true;
            }
            if self.state() == SchedulerState::Stopped {
                return false;
            }
            thread::sleep(TRANSPORT_POLL);
        }
        self.sink.is_connected()
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            self.sink.set_speaking(speaking);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::{
        audio::decoder::testing::ToneOpener,
        playback::queue::PlaybackQueue,
        track::TrackDescriptor,
    };

    /// In-memory transport.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub connected: AtomicBool,
        pub frames: Mutex<Vec<Vec<i16>>>,
        pub speaking: Mutex<Vec<bool>>,
    }

    impl MemorySink {
        pub(crate) fn connected() -> Arc<Self> {
            let sink = Self::default();
            sink.connected.store(true, Ordering::SeqCst);
            Arc::new(sink)
        }

        pub(crate) fn frame_count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl FrameSink for MemorySink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_frame(&self, pcm: &[i16]) -> Result<(), NodeError> {
            self.frames.lock().push(pcm.to_vec());
            Ok(())
        }

        fn set_speaking(&self, speaking: bool) {
            self.speaking.lock().push(speaking);
        }
    }

    fn config() -> PlayerConfig {
        PlayerConfig {
            tick_ms: 5,
            buffer_seconds: 1.0,
            preload_seconds: 0.0,
            reconnect_wait_ms: 50,
            ..Default::default()
        }
    }

    fn start(sink: Arc<MemorySink>, queue: SharedQueue) -> SchedulerHandle {
        let (emitter, _rx) = EventEmitter::channel();
        PlaybackScheduler::new(
            GuildId::from("1"),
            &config(),
            queue,
            sink,
            Arc::new(ToneOpener::new(10)),
            emitter,
            Arc::new(AtomicF32::new(1.0)),
        )
        .spawn()
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn queue_with(seconds: f64) -> SharedQueue {
        let queue = PlaybackQueue::shared();
        queue
            .lock()
            .push(TrackDescriptor::new("tone://a", "a").with_duration(seconds));
        queue
    }

    #[test]
    fn plays_single_track_then_goes_quiet() {
        let sink = MemorySink::connected();
        let queue = queue_with(0.2);
        let handle = start(sink.clone(), queue.clone());

        assert!(wait_until(|| queue.lock().is_empty()));
        assert!(wait_until(|| sink.speaking.lock().last() == Some(&false)));
        thread::sleep(Duration::from_millis(30));

        assert_eq!(sink.frame_count(), 10);
        assert_eq!(*sink.speaking.lock(), vec![true, false]);
        handle.stop();
    }

    #[test]
    fn paused_scheduler_sends_nothing() {
        let sink = MemorySink::connected();
        let queue = queue_with(30.0);
        let handle = start(sink.clone(), queue);
        handle.pause();
        let before = sink.frame_count();
        thread::sleep(Duration::from_millis(50));
        assert!(sink.frame_count() <= before + 1);
        assert!(handle.is_paused());

        handle.resume();
        assert!(wait_until(|| sink.frame_count() > before + 3));
        handle.stop();
    }

    #[test]
    fn waits_for_transport_before_playing() {
        let sink = Arc::new(MemorySink::default());
        let queue = queue_with(30.0);
        let handle = start(sink.clone(), queue);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(sink.frame_count(), 0);

        sink.connected.store(true, Ordering::SeqCst);
        assert!(wait_until(|| sink.frame_count() > 2));
        handle.stop();
    }

    #[test]
    fn stopped_handle_cannot_resume() {
        let sink = MemorySink::connected();
        let handle = start(sink, PlaybackQueue::shared());
        handle.stop();
        assert!(!handle.resume());
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn timeline_sleeps_until_next_deadline() {
        let origin = Instant::now();
        let mut timeline = Timeline::new(origin, Duration::from_millis(20));
        assert_eq!(
            timeline.advance(origin + Duration::from_millis(5)),
            Duration::from_millis(15)
        );
        assert_eq!(
            timeline.advance(origin + Duration::from_millis(45)),
            Duration::ZERO
        );
    }

    #[test]
    fn timeline_resets_when_far_behind() {
        let origin = Instant::now();
        let mut timeline = Timeline::new(origin, Duration::from_millis(20));
        let late = origin + Duration::from_millis(500);
        assert_eq!(timeline.advance(late), Duration::ZERO);
        assert_eq!(
            timeline.advance(late + Duration::from_millis(1)),
            Duration::from_millis(19)
        );
    }
}
