use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_gateway_version")]
    pub gateway_version: u8,
    /// Ceiling applied to the server's heartbeat interval hint.
    #[serde(default = "default_heartbeat_max_interval_ms")]
    pub heartbeat_max_interval_ms: u64,
    #[serde(default = "default_heartbeat_ack_timeout_ms")]
    pub heartbeat_ack_timeout_ms: u64,
    /// Silence on the signaling socket longer than this counts as a drop.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_ip_discovery_timeout_ms")]
    pub ip_discovery_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Cipher modes in order of preference.
    #[serde(default = "default_preferred_modes")]
    pub preferred_modes: Vec<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            gateway_version: default_gateway_version(),
            heartbeat_max_interval_ms: default_heartbeat_max_interval_ms(),
            heartbeat_ack_timeout_ms: default_heartbeat_ack_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            ip_discovery_timeout_ms: default_ip_discovery_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            preferred_modes: default_preferred_modes(),
        }
    }
}

fn default_gateway_version() -> u8 {
    4
}

fn default_heartbeat_max_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_ack_timeout_ms() -> u64 {
    15000
}

fn default_poll_timeout_ms() -> u64 {
    30000
}

fn default_ip_discovery_timeout_ms() -> u64 {
    2000
}

fn default_grace_period_ms() -> u64 {
    10000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_preferred_modes() -> Vec<String> {
    vec![
        "xsalsa20_poly1305_suffix".to_string(),
        "xsalsa20_poly1305".to_string(),
    ]
}
