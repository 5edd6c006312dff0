//! Error taxonomy surfaced by the streaming engine.
//!
//! Three families share one enum so every caller gets exactly one outcome
//! through the same return path:
//!
//! - **Transport-level**: [`StreamError::NotConnected`],
//!   [`StreamError::SendTimeout`]. Reconnect-eligible.
//! - **Correlation-level**: [`StreamError::Timeout`],
//!   [`StreamError::Rejected`]. Timeouts get a limited retry for turn
//!   sends; rejections are final and carry the server's reason verbatim.
//! - **Local**: [`StreamError::Transport`] (socket I/O that is not a plain
//!   disconnect) and [`StreamError::Encode`].

use std::time::Duration;

use thiserror::Error;

/// Failure of a stream operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The transport is not in the `connected` state.
    #[error("not connected")]
    NotConnected,

    /// The socket write did not complete within the send timeout.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// No reply arrived for a command within its timeout.
    #[error("{command} timed out")]
    Timeout {
        /// Command name.
        command: String,
    },

    /// The server answered with a failure.
    #[error("{command} rejected{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Rejected {
        /// Command name.
        command: String,
        /// Server-provided reason, when present.
        reason: Option<String>,
    },

    /// Socket-level failure other than a disconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// An outbound command could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl StreamError {
    /// Build a `Timeout` for a command name.
    pub fn timeout(command: impl Into<String>) -> Self {
        Self::Timeout {
            command: command.into(),
        }
    }

    /// Build a `Rejected` for a command name.
    pub fn rejected(command: impl Into<String>, reason: Option<String>) -> Self {
        Self::Rejected {
            command: command.into(),
            reason,
        }
    }

    /// Whether a caller may retry after the transport recovers.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(self, Self::NotConnected | Self::SendTimeout(_))
    }

    /// Whether a staged turn send may be re-issued.
    ///
    /// Turn sends carry an idempotency token, so a reply timeout is safe to
    /// retry as well. Rejections never are.
    pub fn is_retryable_turn_failure(&self) -> bool {
        self.is_reconnect_eligible() || matches!(self, Self::Timeout { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::SendTimeout(_) => "send_timeout",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
