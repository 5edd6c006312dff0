//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so partial JSON files are accepted; missing fields keep their compiled
//! default.

mod stream;

pub use stream::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the oppi client.
///
/// Loaded from `~/.oppi/settings.json` with env var overrides. Example:
///
/// ```json
/// {
///   "server": { "baseUrl": "https://mac-mini.tailnet:7749" },
///   "stream": { "sendTimeoutMs": 8000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OppiSettings {
    /// Remote host location.
    pub server: ServerSettings,
    /// Transport timings and reconnect policy.
    pub stream: StreamSettings,
    /// Command correlation timeouts and retry policy.
    pub commands: CommandSettings,
    /// Resubscription after reconnect.
    pub resubscribe: ResubscribeSettings,
    /// Zombie-connection detection.
    pub watchdog: WatchdogSettings,
    /// REST control plane.
    pub rest: RestSettings,
    /// Logging output.
    pub logging: LoggingSettings,
}

impl OppiSettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.stream.jitter_min > self.stream.jitter_max {
            return Err(SettingsError::InvalidValue(format!(
                "stream.jitterMin ({}) exceeds stream.jitterMax ({})",
                self.stream.jitter_min, self.stream.jitter_max
            )));
        }
        if self.stream.jitter_min < 0.0 {
            return Err(SettingsError::InvalidValue(
                "stream.jitterMin must not be negative".into(),
            ));
        }
        if self.commands.turn_max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "commands.turnMaxAttempts must be at least 1".into(),
            ));
        }
        if self.resubscribe.focused_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "resubscribe.focusedAttempts must be at least 1".into(),
            ));
        }
        if self.stream.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.rest.degraded_poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "rest.degradedPollIntervalMs must be positive".into(),
            ));
        }
        if self.watchdog.probe_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "watchdog.probeIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Remote host location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// HTTP(S) origin shared by REST and the stream endpoint.
    pub base_url: String,
    /// Path of the multiplexed stream endpoint.
    pub stream_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7749".to_string(),
            stream_path: "/stream".to_string(),
        }
    }
}

/// REST control plane settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestSettings {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Session refresh interval while the stream is down.
    pub degraded_poll_interval_ms: u64,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            degraded_poll_interval_ms: 10_000,
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
