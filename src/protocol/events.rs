use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    common::{
        errors::{ErrorKind, NodeError, Severity},
        types::GuildId,
    },
    track::{Track, TrackDescriptor},
};

/// Compact track identity carried on events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRef {
    pub id: String,
    pub title: String,
    pub locator: String,
}

impl From<&TrackDescriptor> for TrackRef {
    fn from(d: &TrackDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            title: d.title.clone(),
            locator: d.locator.clone(),
        }
    }
}

impl From<&Track> for TrackRef {
    fn from(t: &Track) -> Self {
        t.descriptor().into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Skipped,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: String,
    pub severity: Severity,
    pub kind: ErrorKind,
}

impl From<&NodeError> for TrackException {
    fn from(e: &NodeError) -> Self {
        Self {
            message: e.to_string(),
            severity: e.severity(),
            kind: e.kind(),
        }
    }
}

/// Everything the node reports outward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: GuildId, track: TrackRef },

    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: GuildId,
        track: TrackRef,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: GuildId,
        track: TrackRef,
        exception: TrackException,
    },

    /// The queue has nothing after the current track; the control plane
    /// should supply one.
    #[serde(rename = "NeedNextTrackEvent", rename_all = "camelCase")]
    NeedNextTrack { guild_id: GuildId, current: TrackRef },

    #[serde(rename = "VoiceConnectionReadyEvent", rename_all = "camelCase")]
    VoiceConnectionReady {
        guild_id: GuildId,
        ssrc: u32,
        mode: String,
    },

    #[serde(rename = "VoiceConnectionLostEvent", rename_all = "camelCase")]
    VoiceConnectionLost {
        guild_id: GuildId,
        code: Option<u16>,
        reason: String,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> &GuildId {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::NeedNextTrack { guild_id, .. }
            | Self::VoiceConnectionReady { guild_id, .. }
            | Self::VoiceConnectionLost { guild_id, .. } => guild_id,
        }
    }
}

/// Cloneable, non-blocking event sink. Usable from decode and pump threads
/// as well as from tasks.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: NodeEvent) {
        trace!("emit {:?}", event);
        // A closed receiver means the node is shutting down.
        let _ = self.tx.send(event);
    }
}
