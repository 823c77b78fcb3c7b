use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exception severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// Every failure the node can report to a caller or a track event.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no voice connection for this guild")]
    NotConnected,

    #[error("track is a live stream and cannot be seeked")]
    NotSeekable,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("stream host refused the request (403): {0}")]
    Forbidden(String),

    #[error("stream host is rate limiting (429): {0}")]
    RateLimited(String),

    #[error("transient decode error: {0}")]
    DecodeTransient(String),

    #[error("decode failed: {0}")]
    DecodeFatal(String),

    #[error("voice signaling timed out")]
    SignalingTimeout,

    #[error("voice signaling closed (code {code}): {reason}")]
    SignalingClosed { code: u16, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire name of a [`NodeError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotConnected,
    NotSeekable,
    NotPlaying,
    Forbidden,
    RateLimited,
    DecodeTransient,
    DecodeFatal,
    SignalingTimeout,
    SignalingClosed,
    NotFound,
    Transport,
    Config,
    Io,
}

/// Structured error handed back to control-plane callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected => ErrorKind::NotConnected,
            Self::NotSeekable => ErrorKind::NotSeekable,
            Self::NotPlaying => ErrorKind::NotPlaying,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::DecodeTransient(_) => ErrorKind::DecodeTransient,
            Self::DecodeFatal(_) => ErrorKind::DecodeFatal,
            Self::SignalingTimeout => ErrorKind::SignalingTimeout,
            Self::SignalingClosed { .. } => ErrorKind::SignalingClosed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Synchronous request-validation failures. These are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::NotConnected | Self::NotSeekable | Self::NotPlaying)
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Forbidden(_) | Self::RateLimited(_) | Self::NotFound(_) => Severity::Common,
            Self::DecodeFatal(_) | Self::Io(_) => Severity::Suspicious,
            _ => Severity::Fault,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            timestamp: crate::common::types::now_ms(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl Clone for NodeError {
    fn clone(&self) -> Self {
        match self {
            Self::NotConnected => Self::NotConnected,
            Self::NotSeekable => Self::NotSeekable,
            Self::NotPlaying => Self::NotPlaying,
            Self::Forbidden(m) => Self::Forbidden(m.clone()),
            Self::RateLimited(m) => Self::RateLimited(m.clone()),
            Self::DecodeTransient(m) => Self::DecodeTransient(m.clone()),
            Self::DecodeFatal(m) => Self::DecodeFatal(m.clone()),
            Self::SignalingTimeout => Self::SignalingTimeout,
            Self::SignalingClosed { code, reason } => Self::SignalingClosed {
                code: *code,
                reason: reason.clone(),
            },
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_carries_kind_and_message() {
        let resp = NodeError::NotSeekable.to_response();
        assert_eq!(resp.kind, ErrorKind::NotSeekable);
        assert!(resp.message.contains("cannot be seeked"));

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["kind"], "NotSeekable");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn validation_errors_are_flagged() {
        assert!(NodeError::NotConnected.is_validation());
        assert!(NodeError::NotPlaying.is_validation());
        assert!(!NodeError::Forbidden("x".into()).is_validation());
    }

    #[test]
    fn clone_preserves_io_kind() {
        let err = NodeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        match err.clone() {
            NodeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }
}
