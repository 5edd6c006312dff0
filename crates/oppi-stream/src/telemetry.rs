//! Metric names recorded by the engine.
//!
//! Recorded through the `metrics` facade; the embedding application decides
//! whether a recorder is installed.

/// Reconnect attempts scheduled (counter).
pub const STREAM_RECONNECT_ATTEMPTS_TOTAL: &str = "stream_reconnect_attempts_total";
/// Inbound frames decoded (counter).
pub const STREAM_FRAMES_DECODED_TOTAL: &str = "stream_frames_decoded_total";
/// Inbound frames dropped (counter, labels: reason).
pub const STREAM_FRAMES_DROPPED_TOTAL: &str = "stream_frames_dropped_total";
/// Socket writes that lost the timeout race (counter).
pub const STREAM_SEND_TIMEOUTS_TOTAL: &str = "stream_send_timeouts_total";
/// Commands that received no reply in time (counter, labels: command).
pub const COMMAND_TIMEOUTS_TOTAL: &str = "command_timeouts_total";
