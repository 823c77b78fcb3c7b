//! Voice signaling opcodes and their payloads.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::common::errors::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceOpcode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
    ClientDisconnect = 13,
}

impl VoiceOpcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Identify,
            1 => Self::SelectProtocol,
            2 => Self::Ready,
            3 => Self::Heartbeat,
            4 => Self::SessionDescription,
            5 => Self::Speaking,
            6 => Self::HeartbeatAck,
            7 => Self::Resume,
            8 => Self::Hello,
            9 => Self::Resumed,
            13 => Self::ClientDisconnect,
            _ => return None,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl VoiceGatewayMessage {
    pub fn new(op: VoiceOpcode, payload: impl Serialize) -> Result<Self, NodeError> {
        let d = serde_json::to_value(payload)
            .map_err(|e| NodeError::Transport(format!("encode op {:?}: {}", op, e)))?;
        Ok(Self { op: op as u8, d })
    }

    pub fn parse(text: &str) -> Result<Self, NodeError> {
        serde_json::from_str(text)
            .map_err(|e| NodeError::Transport(format!("bad voice gateway message: {}", e)))
    }

    pub fn opcode(&self) -> Option<VoiceOpcode> {
        VoiceOpcode::from_u8(self.op)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(self.d.clone())
            .map_err(|e| NodeError::Transport(format!("bad payload for op {}: {}", self.op, e)))
    }

    pub fn to_text(&self) -> Result<String, NodeError> {
        serde_json::to_string(self)
            .map_err(|e| NodeError::Transport(format!("encode op {}: {}", self.op, e)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

/// Same fields as [`Identify`]; sent on op 7 to pick a session back up.
pub type Resume = Identify;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hello {
    pub heartbeat_interval: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}
