//! One guild's voice connection: queue, transport link, pacing thread and
//! the signaling client currently feeding the link.

use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    audio::{decoder::MediaOpener, filters::Filters},
    common::{
        errors::NodeError,
        types::{AtomicF32, GuildId},
    },
    configs::{PlayerConfig, VoiceConfig},
    playback::{PlaybackQueue, PlaybackScheduler, QueueItem, SchedulerHandle, SharedQueue},
    protocol::{EventEmitter, NodeEvent, TrackEndReason, TrackRef},
    track::{Track, TrackDescriptor, TrackOptions},
    voice::{GatewayEvent, GatewayHandle, VoiceGatewayClient, VoiceLink, VoiceServerInfo},
};

/// Requests from connection tasks back to the node's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCommand {
    /// Remove and shut down connection `connection_id` of `guild_id`.
    Teardown { guild_id: GuildId, connection_id: u64 },
}

struct GatewayTasks {
    handle: GatewayHandle,
    monitor: JoinHandle<()>,
}

impl GatewayTasks {
    fn shutdown(self) {
        self.monitor.abort();
        self.handle.shutdown();
    }
}

pub struct VoiceConnection {
    id: u64,
    guild_id: GuildId,
    queue: SharedQueue,
    link: Arc<VoiceLink>,
    scheduler: SchedulerHandle,
    gateway: Mutex<Option<GatewayTasks>>,
    opener: Arc<dyn MediaOpener>,
    options: TrackOptions,
    voice: VoiceConfig,
    emitter: EventEmitter,
    loop_tx: UnboundedSender<LoopCommand>,
    lost: Arc<AtomicBool>,
}

impl VoiceConnection {
    pub fn new(
        id: u64,
        guild_id: GuildId,
        player: &PlayerConfig,
        voice: VoiceConfig,
        opener: Arc<dyn MediaOpener>,
        emitter: EventEmitter,
        loop_tx: UnboundedSender<LoopCommand>,
    ) -> Result<Self, NodeError> {
        let queue = PlaybackQueue::shared();
        let link = Arc::new(VoiceLink::new(guild_id.clone()));
        let scheduler = PlaybackScheduler::new(
            guild_id.clone(),
            player,
            queue.clone(),
            link.clone(),
            opener.clone(),
            emitter.clone(),
            Arc::new(AtomicF32::new(1.0)),
        )
        .spawn()?;

        Ok(Self {
            id,
            guild_id,
            queue,
            link,
            scheduler,
            gateway: Mutex::new(None),
            opener,
            options: TrackOptions::from(player),
            voice,
            emitter,
            loop_tx,
            lost: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn link(&self) -> &Arc<VoiceLink> {
        &self.link
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Tear down the current signaling client and session and start over
    /// against `info.endpoint`. Queue, RTP counters and the pacing thread
    /// carry over.
    pub fn voice_server_update(&self, info: VoiceServerInfo) {
        let mut gateway = self.gateway.lock();
        if let Some(old) = gateway.take() {
            debug!("[{}] Replacing voice gateway", self.guild_id);
            old.shutdown();
        }
        self.link.release();

        info!("[{}] Connecting voice to {}", self.guild_id, info.endpoint);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle =
            VoiceGatewayClient::new(info, self.voice.clone(), self.link.clone(), events_tx).spawn();
        let monitor = GraceMonitor {
            connection_id: self.id,
            guild_id: self.guild_id.clone(),
            grace: Duration::from_millis(self.voice.grace_period_ms),
            link: self.link.clone(),
            queue: self.queue.clone(),
            emitter: self.emitter.clone(),
            loop_tx: self.loop_tx.clone(),
            lost: self.lost.clone(),
        };
        let monitor = tokio::spawn(monitor.run(events_rx));
        *gateway = Some(GatewayTasks { handle, monitor });
    }

    pub fn latency(&self) -> Option<Duration> {
        self.gateway
            .lock()
            .as_ref()
            .and_then(|g| g.handle.latency())
    }

    pub fn enqueue(&self, descriptor: TrackDescriptor) -> usize {
        self.queue.lock().push(descriptor)
    }

    pub fn insert(&self, index: usize, descriptor: TrackDescriptor) -> usize {
        self.queue.lock().insert(index, descriptor)
    }

    pub fn remove(&self, index: usize) -> Result<TrackDescriptor, NodeError> {
        self.queue
            .lock()
            .remove(index)
            .ok_or_else(|| NodeError::NotFound(format!("no removable queue entry at {}", index)))
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.queue.lock().snapshot()
    }

    /// The head of the queue as a track, resolving a pending entry.
    fn current(&self) -> Result<Arc<Track>, NodeError> {
        let mut queue = self.queue.lock();
        let head = queue.get_mut(0).ok_or(NodeError::NotPlaying)?;
        Ok(head.resolve(&self.opener, self.options))
    }

    pub fn now_playing(&self) -> Option<(TrackRef, f64)> {
        let queue = self.queue.lock();
        let head = queue.get(0)?;
        let position = head.track().map(|t| t.position()).unwrap_or(0.0);
        Some((TrackRef::from(head.descriptor()), position))
    }

    pub fn skip(&self) -> Result<TrackRef, NodeError> {
        let track = self.current()?;
        track.skip();
        Ok(TrackRef::from(track.as_ref()))
    }

    /// Stop the current track and drop everything queued behind it.
    pub fn stop(&self) -> Result<(), NodeError> {
        let track = self.current()?;
        let dropped = self.queue.lock().truncate_upcoming();
        track.stop();
        debug!("[{}] Stopped, dropped {} queued", self.guild_id, dropped);
        Ok(())
    }

    pub fn seek(&self, seconds: f64) -> Result<f64, NodeError> {
        self.current()?.seek(seconds)
    }

    pub fn set_track_gain(&self, gain: f32) -> Result<(), NodeError> {
        self.current()?.set_gain(gain);
        Ok(())
    }

    pub fn set_filters(&self, filters: Filters) -> Result<(), NodeError> {
        self.current()?.set_filters(filters);
        Ok(())
    }

    /// Stop everything this connection owns. Remaining tracks are reported
    /// with `TrackEnd { reason: Cleanup }`.
    pub fn shutdown(&self) {
        if let Some(gateway) = self.gateway.lock().take() {
            gateway.shutdown();
        }
        self.scheduler.stop();
        self.link.release();
        release_queue(&self.guild_id, &self.queue, &self.emitter);
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.get_mut().take() {
            gateway.shutdown();
        }
    }
}

fn release_queue(guild_id: &GuildId, queue: &SharedQueue, emitter: &EventEmitter) {
    let head = queue.lock().clear();
    if let Some(head) = head {
        emitter.emit(NodeEvent::TrackEnd {
            guild_id: guild_id.clone(),
            track: TrackRef::from(head.descriptor()),
            reason: TrackEndReason::Cleanup,
        });
    }
}

/// Watches one signaling client. A disconnect opens the grace window; a new
/// session closes it. Running out of grace, or a terminal close, loses the
/// connection.
struct GraceMonitor {
    connection_id: u64,
    guild_id: GuildId,
    grace: Duration,
    link: Arc<VoiceLink>,
    queue: SharedQueue,
    emitter: EventEmitter,
    loop_tx: UnboundedSender<LoopCommand>,
    lost: Arc<AtomicBool>,
}

impl GraceMonitor {
    async fn run(self, mut events: UnboundedReceiver<GatewayEvent>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(GatewayEvent::Established { ssrc, mode }) => {
                        deadline = None;
                        self.emitter.emit(NodeEvent::VoiceConnectionReady {
                            guild_id: self.guild_id.clone(),
                            ssrc,
                            mode: mode.name().to_string(),
                        });
                    }
                    Some(GatewayEvent::Resumed) => {
                        if deadline.take().is_some() {
                            info!("[{}] Voice connection recovered within grace", self.guild_id);
                        }
                    }
                    Some(GatewayEvent::Disconnected { code, reason }) => {
                        if deadline.is_none() {
                            warn!(
                                "[{}] Voice signaling lost ({:?}: {}), grace {:?}",
                                self.guild_id, code, reason, self.grace
                            );
                            deadline = Some(Instant::now() + self.grace);
                        }
                    }
                    Some(GatewayEvent::Closed { code, reason }) => {
                        self.lose(code, reason);
                        break;
                    }
                    None => break,
                },
                _ = expiry => {
                    self.lose(None, "voice connection not recovered within grace period".into());
                    break;
                }
            }
        }
    }

    fn lose(&self, code: Option<u16>, reason: String) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("[{}] Voice connection lost: {}", self.guild_id, reason);
        self.link.release();
        self.emitter.emit(NodeEvent::VoiceConnectionLost {
            guild_id: self.guild_id.clone(),
            code,
            reason,
        });
        release_queue(&self.guild_id, &self.queue, &self.emitter);
        let _ = self.loop_tx.send(LoopCommand::Teardown {
            guild_id: self.guild_id.clone(),
            connection_id: self.connection_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::UdpSocket;

    use super::*;
    use crate::{
        audio::decoder::testing::ToneOpener,
        common::types::{SessionId, UserId},
        voice::{
            EncryptionMode, cipher,
            gateway::tests::{SECRET, accept, establish, listener},
        },
    };

    const GRACE: Duration = Duration::from_secs(10);

    fn monitor() -> (
        GraceMonitor,
        UnboundedReceiver<NodeEvent>,
        UnboundedReceiver<LoopCommand>,
    ) {
        let (emitter, events) = EventEmitter::channel();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let queue = PlaybackQueue::shared();
        queue.lock().push(TrackDescriptor::new("a.ogg", "a"));
        queue.lock().push(TrackDescriptor::new("b.ogg", "b"));
        let monitor = GraceMonitor {
            connection_id: 3,
            guild_id: GuildId::from("1"),
            grace: GRACE,
            link: Arc::new(VoiceLink::new(GuildId::from("1"))),
            queue,
            emitter,
            loop_tx,
            lost: Arc::new(AtomicBool::new(false)),
        };
        (monitor, events, loop_rx)
    }

    fn drain(rx: &mut UnboundedReceiver<NodeEvent>) -> Vec<NodeEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn disconnected() -> GatewayEvent {
        GatewayEvent::Disconnected {
            code: Some(4015),
            reason: "server crashed".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_once_after_grace_expires() {
        let (monitor, mut events, mut loop_rx) = monitor();
        let queue = monitor.queue.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(monitor.run(rx));

        tx.send(disconnected()).unwrap();
        tokio::time::sleep(GRACE / 2).await;
        // A second drop inside the window does not extend it.
        tx.send(disconnected()).unwrap();
        tokio::time::sleep(GRACE / 2 + Duration::from_millis(10)).await;

        let emitted = drain(&mut events);
        let lost = emitted
            .iter()
            .filter(|e| matches!(e, NodeEvent::VoiceConnectionLost { .. }))
            .count();
        assert_eq!(lost, 1);
        assert!(emitted.iter().any(|e| matches!(
            e,
            NodeEvent::TrackEnd { reason: TrackEndReason::Cleanup, track, .. } if track.id == "a"
        )));
        assert!(queue.lock().is_empty());
        assert_eq!(
            loop_rx.try_recv().unwrap(),
            LoopCommand::Teardown {
                guild_id: GuildId::from("1"),
                connection_id: 3
            }
        );

        let _ = tx.send(GatewayEvent::Closed {
            code: Some(4014),
            reason: "late".into(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_finished());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_just_before_expiry_emits_nothing() {
        let (monitor, mut events, mut loop_rx) = monitor();
        let queue = monitor.queue.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let _task = tokio::spawn(monitor.run(rx));

        tx.send(disconnected()).unwrap();
        tokio::time::sleep(GRACE - Duration::from_millis(50)).await;
        tx.send(GatewayEvent::Resumed).unwrap();
        tokio::time::sleep(GRACE).await;

        assert!(drain(&mut events).is_empty());
        assert!(loop_rx.try_recv().is_err());
        assert_eq!(queue.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_close_loses_immediately() {
        let (monitor, mut events, _loop_rx) = monitor();
        let (tx, rx) = mpsc::unbounded_channel();
        let _task = tokio::spawn(monitor.run(rx));

        tx.send(GatewayEvent::Established {
            ssrc: 4,
            mode: EncryptionMode::XSalsa20Poly1305Suffix,
        })
        .unwrap();
        tx.send(GatewayEvent::Closed {
            code: Some(4014),
            reason: "disconnected".into(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let emitted = drain(&mut events);
        assert!(matches!(
            &emitted[0],
            NodeEvent::VoiceConnectionReady { ssrc: 4, mode, .. } if mode == "xsalsa20_poly1305_suffix"
        ));
        assert!(matches!(
            &emitted[1],
            NodeEvent::VoiceConnectionLost { code: Some(4014), .. }
        ));
    }

    fn server_info(endpoint: String) -> VoiceServerInfo {
        VoiceServerInfo {
            guild_id: GuildId::from("42"),
            user_id: UserId(7),
            session_id: SessionId::from("session".to_string()),
            token: "token".into(),
            endpoint,
        }
    }

    async fn recv_rtp(udp: &UdpSocket) -> (u16, u32) {
        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(5), udp.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(cipher::decrypt(EncryptionMode::XSalsa20Poly1305, &SECRET, &buf[..n]).is_ok());
        (
            u16::from_be_bytes([buf[2], buf[3]]),
            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_change_keeps_queue_and_counters() {
        let (emitter, _events) = EventEmitter::channel();
        let (loop_tx, _loop_rx) = mpsc::unbounded_channel();
        let voice = VoiceConfig {
            preferred_modes: vec!["xsalsa20_poly1305".into()],
            ..Default::default()
        };
        let connection = VoiceConnection::new(
            1,
            GuildId::from("42"),
            &PlayerConfig::default(),
            voice,
            Arc::new(ToneOpener::new(1000)),
            emitter,
            loop_tx,
        )
        .unwrap();
        connection.enqueue(TrackDescriptor::new("tone://long", "long").with_duration(120.0));

        let (first, endpoint) = listener().await;
        connection.voice_server_update(server_info(endpoint));
        let mut ws = accept(&first).await;
        let udp = establish(&mut ws, 11).await;
        let (first_seq, ssrc) = recv_rtp(&udp).await;
        assert_eq!(ssrc, 11);
        let (seq, _) = recv_rtp(&udp).await;
        assert_eq!(seq, first_seq.wrapping_add(1));

        let (second, endpoint) = listener().await;
        connection.voice_server_update(server_info(endpoint));
        let mut ws = accept(&second).await;
        let udp = establish(&mut ws, 12).await;
        let (resumed_seq, ssrc) = recv_rtp(&udp).await;
        assert_eq!(ssrc, 12);
        assert!(resumed_seq > seq);

        assert_eq!(connection.snapshot().len(), 1);
        assert_eq!(connection.snapshot()[0].id, "long");
        connection.shutdown();
    }
}
