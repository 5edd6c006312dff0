//! REST client error types.

use thiserror::Error;

/// Failure talking to the control plane.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// No usable credentials were available.
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl ApiError {
    /// Whether the server reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }

    /// Whether the failure is worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Credentials(_) => false,
        }
    }
}

/// Result alias for control-plane calls.
pub type Result<T> = std::result::Result<T, ApiError>;
