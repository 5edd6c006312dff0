//! Component configuration derived from [`OppiSettings`].
//!
//! Each engine component takes its own small config struct so tests can
//! build one directly without going through the settings loader.

use std::time::Duration;

use oppi_core::protocol::TurnStage;
use oppi_core::retry::BackoffPolicy;
use oppi_settings::OppiSettings;

/// Stream transport timings.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Path of the multiplexed endpoint, joined onto the credential origin.
    pub stream_path: String,
    /// Hard timeout on a single socket write.
    pub send_timeout: Duration,
    /// Interval between protocol pings.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures that force a reconnect.
    pub heartbeat_max_failures: u32,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Identical receive errors inside this window are logged once.
    pub receive_error_cooldown: Duration,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Capacity of the inbound event sequence.
    pub inbound_buffer: usize,
}

impl From<&OppiSettings> for TransportConfig {
    fn from(settings: &OppiSettings) -> Self {
        let stream = &settings.stream;
        Self {
            stream_path: settings.server.stream_path.clone(),
            send_timeout: Duration::from_millis(stream.send_timeout_ms),
            heartbeat_interval: Duration::from_millis(stream.heartbeat_interval_ms.max(1)),
            heartbeat_max_failures: stream.heartbeat_max_failures.max(1),
            backoff: stream.backoff_policy(),
            receive_error_cooldown: Duration::from_millis(stream.receive_error_cooldown_ms),
            connect_timeout: Duration::from_millis(stream.connect_timeout_ms),
            inbound_buffer: stream.session_buffer_size.max(1),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&OppiSettings::default())
    }
}

/// Command correlation timeouts and retry policy.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Wait for a turn acknowledgement, per attempt.
    pub turn_timeout: Duration,
    /// Wait for a one-shot command result.
    pub command_timeout: Duration,
    /// Total attempts for a turn send.
    pub turn_max_attempts: u32,
    /// Pause between turn send attempts.
    pub turn_retry_delay: Duration,
    /// Stage a turn must reach to count as acknowledged.
    pub required_stage: TurnStage,
}

impl From<&OppiSettings> for RegistryConfig {
    fn from(settings: &OppiSettings) -> Self {
        let commands = &settings.commands;
        Self {
            turn_timeout: Duration::from_millis(commands.turn_timeout_ms),
            command_timeout: Duration::from_millis(commands.command_timeout_ms),
            turn_max_attempts: commands.turn_max_attempts.max(1),
            turn_retry_delay: Duration::from_millis(commands.turn_retry_delay_ms),
            required_stage: commands.required_stage(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&OppiSettings::default())
    }
}

/// Subscription routing and resubscription.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Capacity of each per-session channel.
    pub session_buffer_size: usize,
    /// Maximum unconsumed sequence entries tracked per session.
    pub sequence_queue_limit: usize,
    /// Wait for a subscribe result (and for the transport to come up).
    pub subscribe_timeout: Duration,
    /// Attempts for the focused session after a reconnect.
    pub resubscribe_attempts: u32,
    /// Linear backoff step between focused resubscribe attempts.
    pub resubscribe_backoff_step: Duration,
}

impl From<&OppiSettings> for RouterConfig {
    fn from(settings: &OppiSettings) -> Self {
        Self {
            session_buffer_size: settings.stream.session_buffer_size.max(1),
            sequence_queue_limit: settings.stream.sequence_queue_limit.max(1),
            subscribe_timeout: Duration::from_millis(settings.commands.subscribe_timeout_ms),
            resubscribe_attempts: settings.resubscribe.focused_attempts.max(1),
            resubscribe_backoff_step: Duration::from_millis(settings.resubscribe.backoff_step_ms),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&OppiSettings::default())
    }
}

/// Zombie-connection detection.
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// Tick interval, and the silence that triggers a probe.
    pub probe_interval: Duration,
    /// Silence that triggers a reconnect request.
    pub reconnect_timeout: Duration,
}

impl From<&OppiSettings> for WatchdogConfig {
    fn from(settings: &OppiSettings) -> Self {
        Self {
            probe_interval: Duration::from_millis(settings.watchdog.probe_interval_ms.max(1)),
            reconnect_timeout: Duration::from_millis(settings.watchdog.reconnect_timeout_ms),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::from(&OppiSettings::default())
    }
}

/// Everything the coordinator needs.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Transport timings.
    pub transport: TransportConfig,
    /// Correlation timeouts.
    pub registry: RegistryConfig,
    /// Routing and resubscription.
    pub router: RouterConfig,
    /// Liveness detection.
    pub watchdog: WatchdogConfig,
    /// REST refresh interval while the stream is down.
    pub degraded_poll_interval: Duration,
}

impl From<&OppiSettings> for CoordinatorConfig {
    fn from(settings: &OppiSettings) -> Self {
        Self {
            transport: settings.into(),
            registry: settings.into(),
            router: settings.into(),
            watchdog: settings.into(),
            degraded_poll_interval: Duration::from_millis(
                settings.rest.degraded_poll_interval_ms.max(1),
            ),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&OppiSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let config = CoordinatorConfig::from(&OppiSettings::default());
        assert_eq!(config.transport.send_timeout, Duration::from_secs(5));
        assert_eq!(config.transport.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.transport.backoff.max_attempts, 10);
        assert_eq!(config.registry.turn_timeout, Duration::from_secs(4));
        assert_eq!(config.registry.command_timeout, Duration::from_secs(8));
        assert_eq!(config.registry.required_stage, TurnStage::Dispatched);
        assert_eq!(config.router.resubscribe_attempts, 3);
        assert_eq!(config.watchdog.probe_interval, Duration::from_secs(15));
        assert_eq!(config.watchdog.reconnect_timeout, Duration::from_secs(45));
        assert_eq!(config.degraded_poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn default_config_matches_default_settings() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.degraded_poll_interval, Duration::from_secs(10));
        assert_eq!(config.transport.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.watchdog.probe_interval, Duration::from_secs(15));
    }

    #[test]
    fn zero_counts_are_clamped() {
        let mut settings = OppiSettings::default();
        settings.stream.heartbeat_max_failures = 0;
        settings.stream.session_buffer_size = 0;
        settings.stream.heartbeat_interval_ms = 0;
        settings.rest.degraded_poll_interval_ms = 0;
        let transport = TransportConfig::from(&settings);
        assert_eq!(transport.heartbeat_max_failures, 1);
        assert_eq!(transport.inbound_buffer, 1);
        assert_eq!(transport.heartbeat_interval, Duration::from_millis(1));
        let config = CoordinatorConfig::from(&settings);
        assert_eq!(config.degraded_poll_interval, Duration::from_millis(1));
    }
}
