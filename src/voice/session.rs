//! UDP voice transport for one established session, and the long-lived link
//! that survives session rebuilds.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::{
    audio::{constants::SAMPLES_PER_FRAME, encoder::Encoder},
    common::{errors::NodeError, types::GuildId},
    playback::FrameSink,
    voice::{
        cipher::{self, EncryptionMode},
        gateway::GatewayCommand,
    },
};

/// RTP sequence and timestamp. Owned by the link so they carry over when
/// the session underneath is rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpCounters {
    pub sequence: u16,
    pub timestamp: u32,
}

impl RtpCounters {
    /// Sequence number for the next packet. Incremented before use.
    pub fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn advance_timestamp(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
    }
}

pub enum Payload<'a> {
    /// One 20 ms frame of 48 kHz stereo PCM, encoded before sending.
    Pcm(&'a [i16]),
    /// Already encoded Opus.
    Opus(&'a [u8]),
}

pub struct VoiceSession {
    socket: UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    mode: EncryptionMode,
    key: [u8; 32],
    encoder: Encoder,
}

impl VoiceSession {
    pub fn new(
        socket: UdpSocket,
        remote: SocketAddr,
        ssrc: u32,
        mode: EncryptionMode,
        key: [u8; 32],
    ) -> Result<Self, NodeError> {
        socket.set_nonblocking(false)?;
        Ok(Self {
            socket,
            remote,
            ssrc,
            mode,
            key,
            encoder: Encoder::new()?,
        })
    }

    /// Take over the socket that performed IP discovery.
    pub fn from_discovery_socket(
        socket: tokio::net::UdpSocket,
        remote: SocketAddr,
        ssrc: u32,
        mode: EncryptionMode,
        key: [u8; 32],
    ) -> Result<Self, NodeError> {
        Self::new(socket.into_std()?, remote, ssrc, mode, key)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Build, encrypt and transmit one packet. The timestamp advances by one
    /// frame whether or not this succeeds.
    pub fn send(&mut self, counters: &mut RtpCounters, payload: Payload<'_>) -> Result<usize, NodeError> {
        let sequence = counters.next_sequence();
        let result = self.transmit(sequence, counters.timestamp, payload);
        counters.advance_timestamp();
        result
    }

    fn transmit(&mut self, sequence: u16, timestamp: u32, payload: Payload<'_>) -> Result<usize, NodeError> {
        let header = cipher::rtp_header(sequence, timestamp, self.ssrc);
        let packet = match payload {
            Payload::Pcm(pcm) => {
                let opus = self.encoder.encode(pcm)?;
                cipher::encrypt(self.mode, &self.key, &header, opus)?
            }
            Payload::Opus(opus) => cipher::encrypt(self.mode, &self.key, &header, opus)?,
        };
        Ok(self.socket.send_to(&packet, self.remote)?)
    }
}

struct LinkInner {
    session: Option<VoiceSession>,
    counters: RtpCounters,
}

/// Per-connection transport slot the scheduler writes into. Sessions come
/// and go as signaling rebuilds them; counters stay.
pub struct VoiceLink {
    guild_id: GuildId,
    inner: Mutex<LinkInner>,
    connected: AtomicBool,
    signaling: Mutex<Option<UnboundedSender<GatewayCommand>>>,
}

impl VoiceLink {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            inner: Mutex::new(LinkInner {
                session: None,
                counters: RtpCounters::default(),
            }),
            connected: AtomicBool::new(false),
            signaling: Mutex::new(None),
        }
    }

    pub fn install(&self, session: VoiceSession) {
        info!(
            "[{}] Voice session ready: ssrc={} remote={} mode={}",
            self.guild_id,
            session.ssrc(),
            session.remote(),
            session.mode()
        );
        self.inner.lock().session = Some(session);
        self.connected.store(true, Ordering::Release);
    }

    pub fn release(&self) -> bool {
        self.connected.store(false, Ordering::Release);
        let released = self.inner.lock().session.take().is_some();
        if released {
            debug!("[{}] Voice session released", self.guild_id);
        }
        released
    }

    pub fn has_session(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.inner.lock().session.as_ref().map(VoiceSession::ssrc)
    }

    pub fn counters(&self) -> RtpCounters {
        self.inner.lock().counters
    }

    pub fn attach_signaling(&self, commands: UnboundedSender<GatewayCommand>) {
        *self.signaling.lock() = Some(commands);
    }

    /// Drop the signaling channel if it still is `commands`. A replaced
    /// client must not detach its successor.
    pub fn detach_signaling(&self, commands: &UnboundedSender<GatewayCommand>) {
        let mut signaling = self.signaling.lock();
        if signaling.as_ref().is_some_and(|tx| tx.same_channel(commands)) {
            *signaling = None;
        }
    }

    pub fn send(&self, payload: Payload<'_>) -> Result<usize, NodeError> {
        let mut inner = self.inner.lock();
        let LinkInner { session, counters } = &mut *inner;
        match session {
            Some(session) => session.send(counters, payload),
            None => Err(NodeError::NotConnected),
        }
    }
}

impl FrameSink for VoiceLink {
    fn is_connected(&self) -> bool {
        self.has_session()
    }

    fn send_frame(&self, pcm: &[i16]) -> Result<(), NodeError> {
        self.send(Payload::Pcm(pcm)).map(|_| ())
    }

    fn set_speaking(&self, speaking: bool) {
        if let Some(tx) = self.signaling.lock().as_ref() {
            let _ = tx.send(GatewayCommand::Speaking(speaking));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::constants::FRAME_SIZE_SAMPLES;

    const KEY: [u8; 32] = [3u8; 32];

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn session_to(remote: SocketAddr, ssrc: u32) -> VoiceSession {
        VoiceSession::new(
            UdpSocket::bind("127.0.0.1:0").unwrap(),
            remote,
            ssrc,
            EncryptionMode::XSalsa20Poly1305,
            KEY,
        )
        .unwrap()
    }

    fn recv_header(socket: &UdpSocket) -> (u16, u32, u32, Vec<u8>) {
        let mut buf = [0u8; 2048];
        let n = socket.recv(&mut buf).unwrap();
        let packet = &buf[..n];
        let payload = cipher::decrypt(EncryptionMode::XSalsa20Poly1305, &KEY, packet).unwrap();
        (
            u16::from_be_bytes([packet[2], packet[3]]),
            u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            payload,
        )
    }

    #[test]
    fn counters_wrap() {
        let mut counters = RtpCounters {
            sequence: u16::MAX,
            timestamp: u32::MAX - (SAMPLES_PER_FRAME as u32 - 1),
        };
        assert_eq!(counters.next_sequence(), 0);
        counters.advance_timestamp();
        assert_eq!(counters.timestamp, 0);
    }

    #[test]
    fn packets_carry_incrementing_counters() {
        let rx = receiver();
        let mut session = session_to(rx.local_addr().unwrap(), 99);
        let mut counters = RtpCounters::default();

        session
            .send(&mut counters, Payload::Pcm(&[0; FRAME_SIZE_SAMPLES]))
            .unwrap();
        session.send(&mut counters, Payload::Opus(b"raw")).unwrap();

        let (seq, ts, ssrc, payload) = recv_header(&rx);
        assert_eq!((seq, ts, ssrc), (1, 0, 99));
        assert!(!payload.is_empty());

        let (seq, ts, _, payload) = recv_header(&rx);
        assert_eq!((seq, ts), (2, 960));
        assert_eq!(payload, b"raw");
    }

    #[test]
    fn timestamp_advances_when_send_fails() {
        // An IPv4 socket cannot reach an IPv6 peer.
        let mut session = session_to("[::1]:9".parse().unwrap(), 1);
        let mut counters = RtpCounters::default();
        assert!(session.send(&mut counters, Payload::Opus(b"x")).is_err());
        assert_eq!(counters, RtpCounters { sequence: 1, timestamp: 960 });
    }

    #[test]
    fn link_keeps_counters_across_rebuilds() {
        let link = VoiceLink::new(GuildId::from("1"));
        assert!(matches!(
            link.send_frame(&[0; FRAME_SIZE_SAMPLES]),
            Err(NodeError::NotConnected)
        ));

        let first = receiver();
        link.install(session_to(first.local_addr().unwrap(), 1));
        assert!(link.is_connected());
        link.send(Payload::Opus(b"a")).unwrap();
        link.send(Payload::Opus(b"b")).unwrap();

        assert!(link.release());
        assert!(!link.is_connected());

        let second = receiver();
        link.install(session_to(second.local_addr().unwrap(), 2));
        link.send(Payload::Opus(b"c")).unwrap();

        let (seq, ts, ssrc, _) = recv_header(&second);
        assert_eq!((seq, ts, ssrc), (3, 1920, 2));
    }

    #[test]
    fn speaking_is_forwarded_to_signaling() {
        let link = VoiceLink::new(GuildId::from("1"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        link.attach_signaling(tx.clone());
        link.set_speaking(true);
        assert!(matches!(rx.try_recv(), Ok(GatewayCommand::Speaking(true))));

        let (stale, _) = tokio::sync::mpsc::unbounded_channel();
        link.detach_signaling(&stale);
        link.set_speaking(true);
        assert!(matches!(rx.try_recv(), Ok(GatewayCommand::Speaking(true))));

        link.detach_signaling(&tx);
        link.set_speaking(false);
        assert!(rx.try_recv().is_err());
    }
}
