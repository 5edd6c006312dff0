//! Engine settings: transport, correlation, resubscription, watchdog.

use std::time::Duration;

use oppi_core::protocol::TurnStage;
use oppi_core::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Transport timings and reconnect policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Hard timeout on a single socket write.
    pub send_timeout_ms: u64,
    /// Interval between protocol pings.
    pub heartbeat_interval_ms: u64,
    /// Consecutive ping failures that force a reconnect.
    pub heartbeat_max_failures: u32,
    /// Consecutive reconnect failures before giving up.
    pub reconnect_max_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub reconnect_base_delay_ms: u64,
    /// Ceiling on a single reconnect delay (before jitter).
    pub reconnect_max_delay_ms: u64,
    /// Lower jitter multiplier.
    pub jitter_min: f64,
    /// Upper jitter multiplier.
    pub jitter_max: f64,
    /// Window in which identical receive errors are logged once.
    pub receive_error_cooldown_ms: u64,
    /// Timeout for opening the socket.
    pub connect_timeout_ms: u64,
    /// Capacity of each per-session inbound channel.
    pub session_buffer_size: usize,
    /// Maximum sequence entries tracked per session.
    pub sequence_queue_limit: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_max_failures: 2,
            reconnect_max_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            jitter_min: 0.75,
            jitter_max: 1.25,
            receive_error_cooldown_ms: 5_000,
            connect_timeout_ms: 10_000,
            session_buffer_size: 512,
            sequence_queue_limit: 256,
        }
    }
}

impl StreamSettings {
    /// Reconnect backoff derived from these settings.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.reconnect_max_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            jitter_min: self.jitter_min,
            jitter_max: self.jitter_max,
        }
    }
}

/// Command correlation timeouts and retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSettings {
    /// Wait for a turn acknowledgement.
    pub turn_timeout_ms: u64,
    /// Wait for a one-shot command result.
    pub command_timeout_ms: u64,
    /// Total attempts for a turn send.
    pub turn_max_attempts: u32,
    /// Pause between turn send attempts.
    pub turn_retry_delay_ms: u64,
    /// Stage a turn must reach to count as acknowledged.
    pub required_stage: String,
    /// Wait for a subscribe result.
    pub subscribe_timeout_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            turn_timeout_ms: 4_000,
            command_timeout_ms: 8_000,
            turn_max_attempts: 2,
            turn_retry_delay_ms: 250,
            required_stage: "dispatched".to_string(),
            subscribe_timeout_ms: 8_000,
        }
    }
}

impl CommandSettings {
    /// Parsed acknowledgement threshold.
    pub fn required_stage(&self) -> TurnStage {
        TurnStage::from(self.required_stage.clone())
    }
}

/// Resubscription after the stream reconnects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResubscribeSettings {
    /// Attempts for the focused session.
    pub focused_attempts: u32,
    /// Linear backoff step: attempt N waits `N * step`.
    pub backoff_step_ms: u64,
}

impl Default for ResubscribeSettings {
    fn default() -> Self {
        Self {
            focused_attempts: 3,
            backoff_step_ms: 500,
        }
    }
}

/// Zombie-connection detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogSettings {
    /// Tick interval; also the silence before a probe.
    pub probe_interval_ms: u64,
    /// Silence after which a reconnect is requested.
    pub reconnect_timeout_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 15_000,
            reconnect_timeout_ms: 45_000,
        }
    }
}
