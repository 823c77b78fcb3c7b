use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoutePlannerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cidrs: Vec<String>,
    #[serde(default)]
    pub excluded_ips: Vec<String>,
    /// How long a rate-limited address sits out before it is handed out again.
    #[serde(default = "default_fail_cooldown_ms")]
    pub fail_cooldown_ms: u64,
}

impl Default for RoutePlannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cidrs: Vec::new(),
            excluded_ips: Vec::new(),
            fail_cooldown_ms: default_fail_cooldown_ms(),
        }
    }
}

fn default_fail_cooldown_ms() -> u64 {
    60 * 60 * 1000
}
