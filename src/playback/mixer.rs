//! Per-tick rendering of the queue head (and, while crossfading, the next
//! entry) into one output frame.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    audio::{constants::apply_gain, decoder::MediaOpener},
    common::types::{AtomicF32, GuildId},
    configs::PlayerConfig,
    playback::queue::SharedQueue,
    protocol::{EventEmitter, NodeEvent, TrackEndReason, TrackException, TrackRef},
    track::{Track, TrackOptions},
};

/// Finalized heads allowed within a single tick before giving up and
/// emitting silence.
const MAX_HEAD_CHANGES_PER_TICK: usize = 4;

/// Saturating sample-wise sum.
fn mix_into(acc: &mut [i16], other: &[i16]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a = a.saturating_add(*b);
    }
}

struct Snapshot {
    current: Arc<Track>,
    next: Option<Arc<Track>>,
    has_next: bool,
}

pub struct TickMixer {
    guild_id: GuildId,
    config: PlayerConfig,
    options: TrackOptions,
    opener: Arc<dyn MediaOpener>,
    emitter: EventEmitter,
    master_target: Arc<AtomicF32>,
    master_gain: f32,
    /// Serial of the head seen on the previous tick.
    head: Option<u64>,
    need_next_sent: bool,
    fade_ticks: u32,
    /// Serials of tracks whose gain this mixer lowered and may restore.
    ducked: HashSet<u64>,
}

impl TickMixer {
    pub fn new(
        guild_id: GuildId,
        config: PlayerConfig,
        opener: Arc<dyn MediaOpener>,
        emitter: EventEmitter,
        master_target: Arc<AtomicF32>,
    ) -> Self {
        let master_gain = master_target.load();
        Self {
            guild_id,
            options: TrackOptions::from(&config),
            config,
            opener,
            emitter,
            master_target,
            master_gain,
            head: None,
            need_next_sent: false,
            fade_ticks: 0,
            ducked: HashSet::new(),
        }
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    /// Render one frame. `None` means a silent tick: nothing is sent and the
    /// speaking flag should drop.
    pub fn tick(&mut self, queue: &SharedQueue) -> Option<Vec<i16>> {
        self.glide_master();

        for _ in 0..MAX_HEAD_CHANGES_PER_TICK {
            let Some(snapshot) = self.snapshot(queue) else {
                self.head = None;
                return None;
            };
            self.observe_head(&snapshot.current);

            if let Some(reason) = self.end_reason(&snapshot.current) {
                self.finalize(queue, &snapshot.current, reason);
                continue;
            }

            let mut frame = self.render(queue, snapshot);
            if let Some(frame) = frame.as_mut() {
                apply_gain(frame, self.master_gain);
            }
            return frame;
        }

        warn!("[{}] Queue head kept changing within one tick", self.guild_id);
        None
    }

    /// Resolve the head and clone out current/next so the lock is not held
    /// while reading audio.
    fn snapshot(&self, queue: &SharedQueue) -> Option<Snapshot> {
        let mut q = queue.lock();
        let current = q.get_mut(0)?.resolve(&self.opener, self.options);
        let next = q.get(1).and_then(|e| e.track().cloned());
        Some(Snapshot {
            current,
            next,
            has_next: q.len() > 1,
        })
    }

    fn observe_head(&mut self, current: &Arc<Track>) {
        let serial = current.serial();
        if self.head != Some(serial) {
            self.head = Some(serial);
            self.need_next_sent = false;
            self.fade_ticks = 0;
        }
    }

    fn end_reason(&self, current: &Arc<Track>) -> Option<TrackEndReason> {
        if current.is_skipped() && current.gain() <= 0.0 {
            return Some(TrackEndReason::Skipped);
        }
        if current.is_stopped() {
            return Some(TrackEndReason::Stopped);
        }
        if current.is_exhausted() {
            return Some(match current.take_error() {
                Some(err) => {
                    warn!("[{}] Track {} failed: {}", self.guild_id, current.id(), err);
                    self.emitter.emit(NodeEvent::TrackException {
                        guild_id: self.guild_id.clone(),
                        track: TrackRef::from(current.as_ref()),
                        exception: TrackException::from(&err),
                    });
                    TrackEndReason::LoadFailed
                }
                None => TrackEndReason::Finished,
            });
        }
        None
    }

    fn finalize(&mut self, queue: &SharedQueue, track: &Arc<Track>, reason: TrackEndReason) {
        track.cleanup();
        let popped = queue.lock().pop_current(track);
        if !popped {
            debug!("[{}] Head changed before {} was finalized", self.guild_id, track.id());
        }
        self.ducked.remove(&track.serial());
        self.head = None;

        info!("[{}] Track {} ended: {:?}", self.guild_id, track.id(), reason);
        self.emitter.emit(NodeEvent::TrackEnd {
            guild_id: self.guild_id.clone(),
            track: TrackRef::from(track.as_ref()),
            reason,
        });
    }

    fn render(&mut self, queue: &SharedQueue, snapshot: Snapshot) -> Option<Vec<i16>> {
        let Snapshot {
            current,
            mut next,
            has_next,
        } = snapshot;

        let crossfade_seconds = self.config.crossfade_seconds;
        let crossfading = crossfade_seconds > 0.0;
        let remain = current.remain();
        let near_end = current.is_skipped()
            || remain.is_some_and(|r| r <= self.config.preload_seconds + crossfade_seconds);

        if near_end {
            if next.is_none() && has_next {
                next = self.resolve_next(queue, crossfading);
            } else if !has_next && !self.need_next_sent {
                self.need_next_sent = true;
                self.emitter.emit(NodeEvent::NeedNextTrack {
                    guild_id: self.guild_id.clone(),
                    current: TrackRef::from(current.as_ref()),
                });
            }
        }
        self.forget_departed(&current, next.as_ref());

        // The incoming track joins only once a read would not block.
        let incoming = next
            .as_ref()
            .filter(|n| crossfading && n.has_audio())
            .cloned();
        let in_window = remain.is_some_and(|r| r <= crossfade_seconds);
        let mut pulled_next = None;

        if current.is_skipped() {
            let step = self.config.skip_fade_step();
            self.ramp(&current, -step);
            if crossfading {
                pulled_next = self.ramp_in(next.as_ref(), incoming, step);
            }
        } else if crossfading && in_window && next.is_some() {
            if incoming.is_some() {
                self.fade_ticks += 1;
                let step = self.config.crossfade_step();
                self.ramp(&current, -step);
                pulled_next = self.ramp_in(next.as_ref(), incoming, step);
            } else if let Some(n) = next.as_ref() {
                self.duck(n, 0.0);
            }
        } else {
            self.fade_ticks = 0;
            self.recover(&current);
            if let Some(n) = next.as_ref().filter(|_| crossfading) {
                self.duck(n, 0.0);
            }
        }

        let mut out = current.read();
        if out.is_some() {
            self.announce(&current);
        }

        if let Some(n) = pulled_next {
            if let Some(frame) = n.try_read() {
                self.announce(&n);
                match out.as_mut() {
                    Some(acc) => mix_into(acc, &frame),
                    None => out = Some(frame),
                }
            }
        }
        out
    }

    fn resolve_next(&mut self, queue: &SharedQueue, crossfading: bool) -> Option<Arc<Track>> {
        let track = queue
            .lock()
            .get_mut(1)
            .map(|e| e.resolve(&self.opener, self.options))?;
        debug!("[{}] Preloading {}", self.guild_id, track.id());
        if crossfading {
            self.duck(&track, 0.0);
        }
        track.preload();
        Some(track)
    }

    /// Raise the incoming track by `step` when it has audio, otherwise hold
    /// it silent. Returns the track to pull a frame from this tick.
    fn ramp_in(
        &mut self,
        next: Option<&Arc<Track>>,
        incoming: Option<Arc<Track>>,
        step: f32,
    ) -> Option<Arc<Track>> {
        match incoming {
            Some(n) => {
                self.ramp(&n, step);
                Some(n)
            }
            None => {
                if let Some(n) = next {
                    self.duck(n, 0.0);
                }
                None
            }
        }
    }

    /// Move a track's gain by `delta` from where it is now, within [0, 1].
    fn ramp(&mut self, track: &Arc<Track>, delta: f32) {
        let gain = track.gain().min(1.0) + delta;
        self.duck(track, gain);
    }

    fn duck(&mut self, track: &Arc<Track>, gain: f32) {
        track.set_gain(gain.clamp(0.0, 1.0));
        self.ducked.insert(track.serial());
    }

    /// Drop ducking state for tracks that are no longer current or next.
    fn forget_departed(&mut self, current: &Arc<Track>, next: Option<&Arc<Track>>) {
        let keep = [Some(current.serial()), next.map(|n| n.serial())];
        self.ducked.retain(|serial| keep.contains(&Some(*serial)));
    }

    /// Walk a gain this mixer lowered back up towards 1.0.
    fn recover(&mut self, track: &Arc<Track>) {
        let serial = track.serial();
        if !self.ducked.contains(&serial) {
            return;
        }
        let gain = (track.gain() + self.config.track_gain_recovery_step).min(1.0);
        track.set_gain(gain);
        if gain >= 1.0 {
            self.ducked.remove(&serial);
        }
    }

    fn announce(&self, track: &Arc<Track>) {
        if track.mark_announced() {
            info!("[{}] Track {} started", self.guild_id, track.id());
            self.emitter.emit(NodeEvent::TrackStart {
                guild_id: self.guild_id.clone(),
                track: TrackRef::from(track.as_ref()),
            });
        }
    }

    fn glide_master(&mut self) {
        let target = self.master_target.load();
        let step = self.config.master_gain_step;
        let delta = target - self.master_gain;
        self.master_gain = if delta.abs() <= step {
            target
        } else {
            self.master_gain + step.copysign(delta)
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        audio::decoder::testing::ToneOpener,
        common::errors::NodeError,
        playback::queue::PlaybackQueue,
        track::TrackDescriptor,
    };

    fn config() -> PlayerConfig {
        PlayerConfig {
            buffer_seconds: 1.0,
            preload_seconds: 0.0,
            ..Default::default()
        }
    }

    fn mixer(
        config: PlayerConfig,
        opener: ToneOpener,
    ) -> (TickMixer, Arc<AtomicF32>, UnboundedReceiver<NodeEvent>) {
        let (emitter, rx) = EventEmitter::channel();
        let master = Arc::new(AtomicF32::new(1.0));
        let mixer = TickMixer::new(
            GuildId::from("1"),
            config,
            Arc::new(opener),
            emitter,
            master.clone(),
        );
        (mixer, master, rx)
    }

    fn queue_of(tracks: &[(&str, f64)]) -> SharedQueue {
        let queue = PlaybackQueue::shared();
        for (id, seconds) in tracks {
            queue
                .lock()
                .push(TrackDescriptor::new(format!("tone://{}", id), *id).with_duration(*seconds));
        }
        queue
    }

    fn drain(rx: &mut UnboundedReceiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn head(queue: &SharedQueue) -> Option<Arc<Track>> {
        queue.lock().current().cloned()
    }

    fn run_until_empty(mixer: &mut TickMixer, queue: &SharedQueue) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = 0;
        while !queue.lock().is_empty() && Instant::now() < deadline {
            if mixer.tick(queue).is_some() {
                frames += 1;
            }
        }
        frames
    }

    #[test]
    fn single_track_plays_out_and_ends() {
        let (mut mixer, _, mut rx) = mixer(config(), ToneOpener::new(100));
        let queue = queue_of(&[("a", 0.2)]);

        assert_eq!(run_until_empty(&mut mixer, &queue), 10);
        assert!(mixer.tick(&queue).is_none());

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(NodeEvent::TrackStart { .. })));
        assert!(matches!(
            events.last(),
            Some(NodeEvent::TrackEnd {
                reason: TrackEndReason::Finished,
                ..
            })
        ));
    }

    #[test]
    fn crossfade_gains_sum_to_one() {
        let config = PlayerConfig {
            crossfade_seconds: 0.2,
            preload_seconds: 0.1,
            ..config()
        };
        let (mut mixer, _, mut rx) = mixer(config, ToneOpener::new(100));
        let queue = queue_of(&[("a", 1.0), ("b", 1.0)]);

        let first = {
            let mut q = queue.lock();
            q.get_mut(0).unwrap().resolve(&mixer.opener, mixer.options)
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut fading_ticks = 0;
        loop {
            assert!(Instant::now() < deadline, "first track never finished");
            mixer.tick(&queue);
            let q = queue.lock();
            let Some(current) = q.current().cloned() else { break };
            if !Arc::ptr_eq(&current, &first) {
                break;
            }
            let Some(next) = q.get(1).and_then(|e| e.track()).cloned() else {
                continue;
            };
            drop(q);
            if mixer.fade_ticks > 0 {
                fading_ticks += 1;
                assert!((current.gain() + next.gain() - 1.0).abs() < 1e-5);
            } else {
                assert_eq!(next.gain(), 0.0);
            }
            wait_for(|| next.has_audio());
        }

        assert!(fading_ticks >= 10);
        let second = head(&queue).unwrap();
        assert_eq!(second.id(), "b");
        assert_eq!(second.gain(), 1.0);

        let events = drain(&mut rx);
        let ended_a = events.iter().position(|e| {
            matches!(e, NodeEvent::TrackEnd { track, reason: TrackEndReason::Finished, .. } if track.id == "a")
        });
        let started_b = events.iter().position(
            |e| matches!(e, NodeEvent::TrackStart { track, .. } if track.id == "b"),
        );
        assert!(started_b.unwrap() < ended_a.unwrap());
    }

    #[test]
    fn loading_next_track_does_not_stall_ticks() {
        let config = PlayerConfig {
            crossfade_seconds: 0.2,
            ..config()
        };
        let opener = ToneOpener {
            open_delay: Some(("b".into(), Duration::from_millis(800))),
            ..ToneOpener::new(100)
        };
        let (mut mixer, _, _rx) = mixer(config, opener);
        let queue = queue_of(&[("a", 1.0), ("b", 1.0)]);

        mixer.tick(&queue);
        let first = head(&queue).unwrap();

        let mut worst = Duration::ZERO;
        while !first.is_exhausted() {
            let started = Instant::now();
            let frame = mixer.tick(&queue);
            worst = worst.max(started.elapsed());

            if let Some(next) = queue.lock().get(1).and_then(|e| e.track()) {
                assert!(!next.has_audio());
                assert_eq!(next.gain(), 0.0);
                assert_eq!(mixer.fade_ticks, 0);
                assert_eq!(first.gain(), 1.0);
                if let Some(frame) = frame {
                    assert_eq!(frame[0], 100);
                }
            }
        }
        assert!(worst < Duration::from_millis(100), "worst tick {:?}", worst);
    }

    #[test]
    fn crossfade_ramps_from_user_gain() {
        let config = PlayerConfig {
            crossfade_seconds: 0.2,
            preload_seconds: 0.1,
            ..config()
        };
        let (mut mixer, _, _rx) = mixer(config, ToneOpener::new(100));
        let queue = queue_of(&[("a", 1.0), ("b", 1.0)]);

        mixer.tick(&queue);
        let first = head(&queue).unwrap();
        first.set_gain(0.5);

        let mut gains = Vec::new();
        while head(&queue).is_some_and(|h| Arc::ptr_eq(&h, &first)) {
            mixer.tick(&queue);
            gains.push(first.gain());
            if let Some(next) = queue.lock().get(1).and_then(|e| e.track()).cloned() {
                wait_for(|| next.has_audio());
            }
        }

        assert!(gains.iter().all(|&g| g <= 0.5));
        assert!(gains.windows(2).all(|w| w[1] <= w[0]));
        assert!(gains.iter().any(|&g| g < 0.5));
    }

    #[test]
    fn removed_next_track_is_forgotten() {
        let config = PlayerConfig {
            crossfade_seconds: 0.2,
            preload_seconds: 60.0,
            ..config()
        };
        let (mut mixer, _, _rx) = mixer(config, ToneOpener::new(100));
        let queue = queue_of(&[("a", 30.0), ("b", 30.0)]);

        mixer.tick(&queue);
        let next = queue.lock().get(1).and_then(|e| e.track()).cloned().unwrap();
        assert!(mixer.ducked.contains(&next.serial()));

        queue.lock().remove(1).unwrap();
        mixer.tick(&queue);
        assert!(!mixer.ducked.contains(&next.serial()));
        assert!(mixer.ducked.is_empty());
    }

    #[test]
    fn skipped_track_fades_before_removal() {
        let config = PlayerConfig {
            skip_fade_ms: 100,
            ..config()
        };
        let (mut mixer, _, mut rx) = mixer(config, ToneOpener::new(100));
        let queue = queue_of(&[("a", 30.0)]);

        mixer.tick(&queue);
        let track = queue.lock().current().cloned().unwrap();
        track.skip();

        let mut gains = Vec::new();
        while queue.lock().current().is_some() {
            mixer.tick(&queue);
            gains.push(track.gain());
            assert!(gains.len() < 20);
        }
        assert!(gains.windows(2).all(|w| w[1] <= w[0]));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            NodeEvent::TrackEnd {
                reason: TrackEndReason::Skipped,
                ..
            }
        )));
    }

    #[test]
    fn stop_finalizes_immediately() {
        let (mut mixer, _, mut rx) = mixer(config(), ToneOpener::new(100));
        let queue = queue_of(&[("a", 30.0)]);
        mixer.tick(&queue);
        queue.lock().current().unwrap().stop();

        assert!(mixer.tick(&queue).is_none());
        assert!(queue.lock().is_empty());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            NodeEvent::TrackEnd {
                reason: TrackEndReason::Stopped,
                ..
            }
        )));
    }

    #[test]
    fn open_failure_reports_exception_then_end() {
        let opener = ToneOpener {
            fail_open: Some(NodeError::Forbidden("cdn".into())),
            ..ToneOpener::new(1)
        };
        let (mut mixer, _, mut rx) = mixer(config(), opener);
        let queue = queue_of(&[("a", 30.0)]);
        run_until_empty(&mut mixer, &queue);

        let events = drain(&mut rx);
        let kinds: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::TrackException { .. } => Some("exception"),
                NodeEvent::TrackEnd {
                    reason: TrackEndReason::LoadFailed,
                    ..
                } => Some("end"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, ["exception", "end"]);
    }

    #[test]
    fn need_next_track_fires_once() {
        let config = PlayerConfig {
            preload_seconds: 60.0,
            ..config()
        };
        let (mut mixer, _, mut rx) = mixer(config, ToneOpener::new(1));
        let queue = queue_of(&[("a", 30.0)]);
        for _ in 0..5 {
            mixer.tick(&queue);
        }
        let count = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, NodeEvent::NeedNextTrack { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn master_gain_glides_and_scales_output() {
        let config = PlayerConfig {
            master_gain_step: 0.25,
            ..config()
        };
        let (mut mixer, master, _rx) = mixer(config, ToneOpener::new(1000));
        let queue = queue_of(&[("a", 30.0)]);
        master.store(0.5);

        let frame = mixer.tick(&queue).unwrap();
        assert_eq!(mixer.master_gain(), 0.75);
        assert_eq!(frame[0], 750);

        let frame = mixer.tick(&queue).unwrap();
        assert_eq!(frame[0], 500);
    }

    #[test]
    fn empty_queue_is_silent() {
        let (mut mixer, _, mut rx) = mixer(config(), ToneOpener::new(1));
        let queue = PlaybackQueue::shared();
        assert!(mixer.tick(&queue).is_none());
        assert!(drain(&mut rx).is_empty());
    }
}
