use std::sync::atomic::{AtomicU8, Ordering};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayState {
    Connecting = 0,
    AwaitingReady = 1,
    AwaitingSession = 2,
    Established = 3,
    Reconnecting = 4,
    Closed = 5,
}

impl GatewayState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::AwaitingReady,
            2 => Self::AwaitingSession,
            3 => Self::Established,
            4 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }

    pub fn can_transition_to(self, next: GatewayState) -> bool {
        use GatewayState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Reconnecting) => true,
            (Connecting, AwaitingReady) => true,
            // RESUMED skips straight back to established.
            (Connecting, Established) => true,
            (AwaitingReady, AwaitingSession) => true,
            (AwaitingSession, Established) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }
}

/// Gateway state readable from outside the signaling task.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: GatewayState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> GatewayState {
        GatewayState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn transition(&self, next: GatewayState) -> bool {
        let current = self.get();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!("Ignoring gateway transition {:?} -> {:?}", current, next);
            return false;
        }
        self.0.store(next as u8, Ordering::Release);
        true
    }
}
