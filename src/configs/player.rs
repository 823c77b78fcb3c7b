use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlayerConfig {
    /// Decoded audio held ahead of the scheduler, per track.
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: f64,
    #[serde(default)]
    pub crossfade_seconds: f64,
    /// Remaining time at which the next entry gets resolved and warmed up.
    #[serde(default = "default_preload_seconds")]
    pub preload_seconds: f64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_master_gain_step")]
    pub master_gain_step: f32,
    #[serde(default = "default_track_gain_recovery_step")]
    pub track_gain_recovery_step: f32,
    /// Skip fade length used when crossfading is disabled.
    #[serde(default = "default_skip_fade_ms")]
    pub skip_fade_ms: u64,
    /// Upper bound for a read waiting on a track that is still loading.
    #[serde(default = "default_loading_wait_ms")]
    pub loading_wait_ms: u64,
    /// Upper bound for the scheduler's wait on a disconnected transport.
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: default_buffer_seconds(),
            crossfade_seconds: 0.0,
            preload_seconds: default_preload_seconds(),
            tick_ms: default_tick_ms(),
            master_gain_step: default_master_gain_step(),
            track_gain_recovery_step: default_track_gain_recovery_step(),
            skip_fade_ms: default_skip_fade_ms(),
            loading_wait_ms: default_loading_wait_ms(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
        }
    }
}

impl PlayerConfig {
    pub fn tick_seconds(&self) -> f64 {
        self.tick_ms as f64 / 1000.0
    }

    /// Per-tick gain delta for a linear ramp lasting `seconds`.
    pub fn ramp_step(&self, seconds: f64) -> f32 {
        if seconds <= 0.0 {
            return 1.0;
        }
        (1.0 / (seconds / self.tick_seconds())) as f32
    }

    pub fn crossfade_step(&self) -> f32 {
        self.ramp_step(self.crossfade_seconds)
    }

    pub fn skip_fade_step(&self) -> f32 {
        if self.crossfade_seconds > 0.0 {
            self.crossfade_step()
        } else {
            self.ramp_step(self.skip_fade_ms as f64 / 1000.0)
        }
    }
}

fn default_buffer_seconds() -> f64 {
    10.0
}

fn default_preload_seconds() -> f64 {
    10.0
}

fn default_tick_ms() -> u64 {
    20
}

fn default_master_gain_step() -> f32 {
    0.05
}

fn default_track_gain_recovery_step() -> f32 {
    0.01
}

fn default_skip_fade_ms() -> u64 {
    200
}

fn default_loading_wait_ms() -> u64 {
    2000
}

fn default_reconnect_wait_ms() -> u64 {
    5000
}
