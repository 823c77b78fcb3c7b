//! Voice signaling client: identifies (or resumes), negotiates the UDP
//! transport and installs the resulting session into the connection's
//! [`VoiceLink`].

pub mod backoff;
pub mod heartbeat;
pub mod opcodes;
pub mod state;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::UdpSocket,
    sync::{
        Notify,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use self::{
    backoff::Backoff,
    heartbeat::{HeartbeatTracker, spawn_heartbeat},
    opcodes::{
        Hello, Identify, Ready, SelectProtocol, SelectProtocolData, SessionDescription, Speaking,
        VoiceGatewayMessage, VoiceOpcode,
    },
    state::{GatewayState, StateCell},
};
use crate::{
    common::{
        errors::NodeError,
        types::{GuildId, SessionId, UserId},
    },
    configs::VoiceConfig,
    voice::{
        cipher::{self, EncryptionMode},
        discovery::discover_ip,
        session::{VoiceLink, VoiceSession},
    },
};

/// Delay before a fresh IDENTIFY after the server invalidated the session.
const RECONNECT_DELAY_FRESH_MS: u64 = 500;

/// Grace for the writer task to flush on shutdown.
const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Everything needed to open signaling for one guild, as delivered by a
/// VOICE_SERVER_UPDATE plus the voice state's session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerInfo {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    pub endpoint: String,
}

#[derive(Debug)]
pub enum GatewayCommand {
    Speaking(bool),
    Close,
}

/// Lifecycle notifications for the connection supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Established { ssrc: u32, mode: EncryptionMode },
    Resumed,
    /// Signaling dropped; the client is retrying.
    Disconnected { code: Option<u16>, reason: String },
    /// Signaling is gone for good.
    Closed { code: Option<u16>, reason: String },
}

/// What the outer loop does after one websocket session ends.
#[derive(Debug, PartialEq)]
enum SessionOutcome {
    Resume,
    Identify,
    Fatal { code: Option<u16>, reason: String },
    Shutdown,
}

/// Close codes after which the session can be resumed.
pub fn is_resumable_close(code: u16) -> bool {
    matches!(code, 4009 | 4015)
}

/// Close codes that need a fresh IDENTIFY (and therefore new keys).
pub fn is_reidentify_close(code: u16) -> bool {
    matches!(code, 4006)
}

/// Close codes that end the connection.
///
/// - `4004`: authentication failed
/// - `4014`: disconnected from the channel (kicked, channel deleted)
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4014)
}

pub fn gateway_url(endpoint: &str, version: u8) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        format!("{}/?v={}", endpoint.trim_end_matches('/'), version)
    } else {
        format!("wss://{}/?v={}", endpoint, version)
    }
}

/// Control side of a spawned client.
pub struct GatewayHandle {
    commands: UnboundedSender<GatewayCommand>,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    heartbeat: Arc<Mutex<HeartbeatTracker>>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn state(&self) -> GatewayState {
        self.state.get()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.lock().average_latency()
    }

    pub fn send(&self, command: GatewayCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct VoiceGatewayClient {
    info: VoiceServerInfo,
    config: VoiceConfig,
    link: Arc<VoiceLink>,
    events: UnboundedSender<GatewayEvent>,
    state: Arc<StateCell>,
    heartbeat: Arc<Mutex<HeartbeatTracker>>,
    cancel: CancellationToken,
}

impl VoiceGatewayClient {
    pub fn new(
        info: VoiceServerInfo,
        config: VoiceConfig,
        link: Arc<VoiceLink>,
        events: UnboundedSender<GatewayEvent>,
    ) -> Self {
        let interval = Duration::from_millis(config.heartbeat_max_interval_ms);
        Self {
            info,
            config,
            link,
            events,
            state: Arc::new(StateCell::new(GatewayState::Connecting)),
            heartbeat: Arc::new(Mutex::new(HeartbeatTracker::new(interval))),
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn(self) -> GatewayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.attach_signaling(tx.clone());
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let heartbeat = self.heartbeat.clone();
        let task = tokio::spawn(self.run(tx.clone(), rx));
        GatewayHandle {
            commands: tx,
            cancel,
            state,
            heartbeat,
            task,
        }
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn disconnected(&self, code: Option<u16>, reason: impl Into<String>) {
        self.emit(GatewayEvent::Disconnected {
            code,
            reason: reason.into(),
        });
    }

    async fn run(
        self,
        own: UnboundedSender<GatewayCommand>,
        mut commands: UnboundedReceiver<GatewayCommand>,
    ) {
        let guild_id = self.info.guild_id.clone();
        let mut backoff = Backoff::new(self.config.max_reconnect_attempts);
        let mut resume = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let outcome = self.connect(resume, &mut commands, &mut backoff).await;
            let delay = match outcome {
                Ok(SessionOutcome::Shutdown) => {
                    debug!("[{}] Gateway shutting down cleanly", guild_id);
                    break;
                }
                Ok(SessionOutcome::Fatal { code, reason }) => {
                    warn!("[{}] Voice gateway closed for good: {}", guild_id, reason);
                    self.emit(GatewayEvent::Closed { code, reason });
                    break;
                }
                Ok(SessionOutcome::Resume) => {
                    resume = self.link.has_session();
                    backoff.next()
                }
                Ok(SessionOutcome::Identify) => {
                    // Full identify always issues new keys.
                    self.link.release();
                    resume = false;
                    backoff.next();
                    Duration::from_millis(RECONNECT_DELAY_FRESH_MS)
                }
                Err(e) => {
                    warn!("[{}] Voice gateway connection error: {}", guild_id, e);
                    self.disconnected(None, e.to_string());
                    resume = self.link.has_session();
                    backoff.next()
                }
            };

            if backoff.is_exhausted() {
                error!("[{}] Max voice reconnect attempts reached", guild_id);
                self.emit(GatewayEvent::Closed {
                    code: None,
                    reason: "reconnect attempts exhausted".into(),
                });
                break;
            }

            self.state.transition(GatewayState::Reconnecting);
            debug!(
                "[{}] Reconnecting in {:?} (resume={})",
                guild_id, delay, resume
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.transition(GatewayState::Closed);
        self.link.detach_signaling(&own);
    }

    async fn connect(
        &self,
        resume: bool,
        commands: &mut UnboundedReceiver<GatewayCommand>,
        backoff: &mut Backoff,
    ) -> Result<SessionOutcome, NodeError> {
        if self.state.get() != GatewayState::Connecting {
            self.state.transition(GatewayState::Connecting);
        }
        let url = gateway_url(&self.info.endpoint, self.config.gateway_version);
        debug!("[{}] Connecting to voice gateway: {}", self.info.guild_id, url);

        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
            res = tokio_tungstenite::connect_async(url.as_str()) => {
                res.map_err(|e| NodeError::Transport(format!("voice gateway connect: {}", e)))?.0
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let (opcode, next_state) = if resume {
            (VoiceOpcode::Resume, None)
        } else {
            (VoiceOpcode::Identify, Some(GatewayState::AwaitingReady))
        };
        let greeting = VoiceGatewayMessage::new(opcode, self.identify_payload())?.to_text()?;
        write
            .send(Message::Text(greeting.into()))
            .await
            .map_err(|e| NodeError::Transport(format!("voice gateway send: {}", e)))?;
        if let Some(state) = next_state {
            self.state.transition(state);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer_cancel = self.cancel.child_token();
        let guild_id = self.info.guild_id.clone();
        let cancel = writer_cancel.clone();
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(msg).await {
                            warn!("[{}] Voice gateway write error: {}", guild_id, e);
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        let overdue = Arc::new(Notify::new());
        let mut session = Session {
            client: self,
            tx,
            overdue: overdue.clone(),
            heartbeat_task: None,
            pending: None,
        };
        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionOutcome::Shutdown,
                _ = overdue.notified() => {
                    self.disconnected(None, "heartbeat ack overdue");
                    break SessionOutcome::Resume;
                }
                cmd = commands.recv() => match cmd {
                    Some(GatewayCommand::Speaking(speaking)) => session.send_speaking(speaking),
                    Some(GatewayCommand::Close) | None => break SessionOutcome::Shutdown,
                },
                msg = tokio::time::timeout(poll_timeout, read.next()) => match msg {
                    Err(_) => {
                        warn!("[{}] No signaling traffic for {:?}", self.info.guild_id, poll_timeout);
                        self.disconnected(None, "poll timeout");
                        break SessionOutcome::Resume;
                    }
                    Ok(None) => {
                        debug!("[{}] Voice gateway stream ended", self.info.guild_id);
                        self.disconnected(None, "stream ended");
                        break SessionOutcome::Resume;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("[{}] Voice gateway read error: {}", self.info.guild_id, e);
                        self.disconnected(None, e.to_string());
                        break SessionOutcome::Resume;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Some(outcome) = session.handle_text(&text, backoff).await {
                            break outcome;
                        }
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        let (code, reason) = frame
                            .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                            .unwrap_or((1000, "no reason".into()));
                        info!(
                            "[{}] Voice gateway closed: code={}, reason='{}'",
                            self.info.guild_id, code, reason
                        );
                        break self.classify_close(code, reason);
                    }
                    Ok(Some(Ok(_))) => {}
                },
            }
        };

        session.stop_heartbeat();
        drop(session);
        writer_cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(WRITE_TASK_SHUTDOWN_MS), write_task).await;

        Ok(outcome)
    }

    fn classify_close(&self, code: u16, reason: String) -> SessionOutcome {
        if is_fatal_close(code) {
            return SessionOutcome::Fatal {
                code: Some(code),
                reason,
            };
        }
        self.disconnected(Some(code), reason);
        if is_reidentify_close(code) {
            SessionOutcome::Identify
        } else {
            SessionOutcome::Resume
        }
    }

    fn identify_payload(&self) -> Identify {
        Identify {
            server_id: self.info.guild_id.to_string(),
            user_id: self.info.user_id.to_string(),
            session_id: self.info.session_id.to_string(),
            token: self.info.token.clone(),
        }
    }
}

/// UDP state between READY and SESSION_DESCRIPTION.
struct PendingSession {
    socket: UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    mode: EncryptionMode,
}

/// Per-websocket state.
struct Session<'a> {
    client: &'a VoiceGatewayClient,
    tx: UnboundedSender<Message>,
    overdue: Arc<Notify>,
    heartbeat_task: Option<JoinHandle<()>>,
    pending: Option<PendingSession>,
}

impl Session<'_> {
    fn guild(&self) -> &GuildId {
        &self.client.info.guild_id
    }

    async fn handle_text(&mut self, text: &str, backoff: &mut Backoff) -> Option<SessionOutcome> {
        let msg = match VoiceGatewayMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] {}: {}", self.guild(), e, text);
                return None;
            }
        };

        match msg.opcode() {
            Some(VoiceOpcode::Hello) => self.handle_hello(&msg),
            Some(VoiceOpcode::Ready) => self.handle_ready(&msg).await,
            Some(VoiceOpcode::SessionDescription) => self.handle_session_description(&msg, backoff),
            Some(VoiceOpcode::HeartbeatAck) => self.handle_heartbeat_ack(&msg),
            Some(VoiceOpcode::Resumed) => {
                info!("[{}] Voice session resumed", self.guild());
                self.client.state.transition(GatewayState::Established);
                backoff.reset();
                self.client.emit(GatewayEvent::Resumed);
                None
            }
            Some(VoiceOpcode::ClientDisconnect) => {
                debug!("[{}] Client disconnected: {}", self.guild(), msg.d);
                None
            }
            _ => {
                trace!("[{}] Ignoring voice op {}", self.guild(), msg.op);
                None
            }
        }
    }

    fn handle_hello(&mut self, msg: &VoiceGatewayMessage) -> Option<SessionOutcome> {
        let hello: Hello = match msg.decode() {
            Ok(h) => h,
            Err(e) => {
                warn!("[{}] {}", self.guild(), e);
                return None;
            }
        };
        let config = &self.client.config;
        let interval =
            HeartbeatTracker::clamp_interval(hello.heartbeat_interval, config.heartbeat_max_interval_ms);
        debug!("[{}] Heartbeat interval set to {:?}", self.guild(), interval);

        self.stop_heartbeat();
        self.client.heartbeat.lock().restart(interval);
        self.heartbeat_task = Some(spawn_heartbeat(
            self.tx.clone(),
            self.client.heartbeat.clone(),
            Duration::from_millis(config.heartbeat_ack_timeout_ms),
            self.overdue.clone(),
        ));
        None
    }

    async fn handle_ready(&mut self, msg: &VoiceGatewayMessage) -> Option<SessionOutcome> {
        let ready: Ready = match msg.decode() {
            Ok(r) => r,
            Err(e) => {
                error!("[{}] {}", self.guild(), e);
                return Some(SessionOutcome::Identify);
            }
        };
        self.client.state.transition(GatewayState::AwaitingSession);

        let Some(mode) = cipher::negotiate(&ready.modes, &self.client.config.preferred_modes) else {
            return Some(SessionOutcome::Fatal {
                code: None,
                reason: format!("no supported encryption mode in {:?}", ready.modes),
            });
        };

        let remote: SocketAddr = match format!("{}:{}", ready.ip, ready.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("[{}] Bad voice server address {}: {}", self.guild(), ready.ip, e);
                return Some(SessionOutcome::Identify);
            }
        };
        debug!(
            "[{}] Ready: remote={}, ssrc={}, mode={}",
            self.guild(),
            remote,
            ready.ssrc,
            mode
        );

        let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let discovered = async {
            let socket = UdpSocket::bind(bind).await?;
            let timeout = Duration::from_millis(self.client.config.ip_discovery_timeout_ms);
            let (address, port) = discover_ip(&socket, remote, ready.ssrc, timeout).await?;
            Ok::<_, NodeError>((socket, address, port))
        }
        .await;

        let (socket, address, port) = match discovered {
            Ok(found) => found,
            Err(e) => {
                error!("[{}] IP discovery failed: {}", self.guild(), e);
                self.client.disconnected(None, format!("ip discovery failed: {}", e));
                return Some(SessionOutcome::Identify);
            }
        };

        self.send(
            VoiceOpcode::SelectProtocol,
            SelectProtocol {
                protocol: "udp".into(),
                data: SelectProtocolData {
                    address,
                    port,
                    mode: mode.name().into(),
                },
            },
        );
        self.pending = Some(PendingSession {
            socket,
            remote,
            ssrc: ready.ssrc,
            mode,
        });
        None
    }

    fn handle_session_description(
        &mut self,
        msg: &VoiceGatewayMessage,
        backoff: &mut Backoff,
    ) -> Option<SessionOutcome> {
        let description: SessionDescription = match msg.decode() {
            Ok(d) => d,
            Err(e) => {
                error!("[{}] {}", self.guild(), e);
                return Some(SessionOutcome::Identify);
            }
        };
        let Ok(key) = <[u8; 32]>::try_from(description.secret_key.as_slice()) else {
            error!(
                "[{}] Secret key has {} bytes, expected 32",
                self.guild(),
                description.secret_key.len()
            );
            return Some(SessionOutcome::Identify);
        };
        let Some(pending) = self.pending.take() else {
            warn!("[{}] SESSION_DESCRIPTION without a pending transport", self.guild());
            return None;
        };
        let mode = EncryptionMode::from_name(&description.mode).unwrap_or(pending.mode);

        match VoiceSession::from_discovery_socket(pending.socket, pending.remote, pending.ssrc, mode, key) {
            Ok(session) => self.client.link.install(session),
            Err(e) => {
                error!("[{}] Failed to build voice session: {}", self.guild(), e);
                return Some(SessionOutcome::Identify);
            }
        }

        self.client.state.transition(GatewayState::Established);
        backoff.reset();
        self.client.emit(GatewayEvent::Established {
            ssrc: pending.ssrc,
            mode,
        });
        None
    }

    fn handle_heartbeat_ack(&self, msg: &VoiceGatewayMessage) -> Option<SessionOutcome> {
        let nonce = msg.d.as_u64().or_else(|| msg.d["t"].as_u64()).unwrap_or(0);
        if let Some(rtt) = self
            .client
            .heartbeat
            .lock()
            .on_ack(nonce, tokio::time::Instant::now())
        {
            trace!("[{}] Heartbeat ack in {:?}", self.guild(), rtt);
        }
        None
    }

    fn send_speaking(&self, speaking: bool) {
        let Some(ssrc) = self.client.link.ssrc() else {
            return;
        };
        self.send(
            VoiceOpcode::Speaking,
            Speaking {
                speaking: u8::from(speaking),
                delay: 0,
                ssrc,
            },
        );
    }

    fn send(&self, op: VoiceOpcode, payload: impl serde::Serialize) {
        match VoiceGatewayMessage::new(op, payload).and_then(|m| m.to_text()) {
            Ok(text) => {
                let _ = self.tx.send(Message::Text(text.into()));
            }
            Err(e) => warn!("[{}] {}", self.guild(), e),
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
