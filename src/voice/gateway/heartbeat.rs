use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc::UnboundedSender},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{trace, warn};

use super::opcodes::{VoiceGatewayMessage, VoiceOpcode};
use crate::common::types::now_ms;

pub const MAX_LATENCY_SAMPLES: usize = 20;

/// Heartbeat bookkeeping for one signaling connection.
#[derive(Debug)]
pub struct HeartbeatTracker {
    interval: Duration,
    last_send: Option<Instant>,
    last_ack: Option<Instant>,
    pending: Option<(u64, Instant)>,
    samples: VecDeque<Duration>,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
            last_ack: None,
            pending: None,
            samples: VecDeque::with_capacity(MAX_LATENCY_SAMPLES),
        }
    }

    /// Server hint in milliseconds, capped at `max_ms`.
    pub fn clamp_interval(server_ms: f64, max_ms: u64) -> Duration {
        let ms = if server_ms.is_finite() && server_ms > 0.0 {
            (server_ms as u64).min(max_ms)
        } else {
            max_ms
        };
        Duration::from_millis(ms.max(1))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// New interval from HELLO. Latency history is kept.
    pub fn restart(&mut self, interval: Duration) {
        self.interval = interval;
        self.pending = None;
        self.last_send = None;
    }

    pub fn on_send(&mut self, nonce: u64, now: Instant) {
        self.last_send = Some(now);
        if self.pending.is_none() {
            self.pending = Some((nonce, now));
        }
    }

    /// Round trip of the oldest unacknowledged heartbeat, if `nonce` matches
    /// one we sent.
    pub fn on_ack(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        self.last_ack = Some(now);
        let (sent_nonce, sent_at) = self.pending?;
        if sent_nonce != nonce {
            // Acks for later beats still prove liveness.
            self.pending = None;
            return None;
        }
        self.pending = None;
        let rtt = now.saturating_duration_since(sent_at);
        if self.samples.len() == MAX_LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        Some(rtt)
    }

    /// An unacknowledged heartbeat has been outstanding for longer than
    /// `ack_timeout`.
    pub fn is_overdue(&self, now: Instant, ack_timeout: Duration) -> bool {
        self.pending
            .is_some_and(|(_, sent)| now.saturating_duration_since(sent) > ack_timeout)
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn latency(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Heartbeat on the tracker's interval until the channel closes or an ack
/// goes overdue, in which case `overdue` is notified and the task ends.
pub fn spawn_heartbeat(
    tx: UnboundedSender<Message>,
    tracker: Arc<Mutex<HeartbeatTracker>>,
    ack_timeout: Duration,
    overdue: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = tracker.lock().interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now = Instant::now();
            let nonce = now_ms();
            {
                let mut t = tracker.lock();
                if t.is_overdue(now, ack_timeout) {
                    warn!("Heartbeat ack overdue (>{:?}), dropping connection", ack_timeout);
                    overdue.notify_one();
                    break;
                }
                t.on_send(nonce, now);
            }

            let text = match VoiceGatewayMessage::new(VoiceOpcode::Heartbeat, nonce)
                .and_then(|m| m.to_text())
            {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode heartbeat: {}", e);
                    continue;
                }
            };
            trace!("Heartbeat {}", nonce);
            if tx.send(Message::Text(text.into())).is_err() {
                break;
            }
        }
    })
}
