//! Connection-level notifications published by the coordinator.

use oppi_api::SessionSummary;
use oppi_core::errors::StreamError;
use oppi_core::protocol::ServerFrame;
use oppi_core::SessionId;

use crate::transport::ConnectionStatus;

/// Something the application layer may want to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// The transport status changed.
    StatusChanged(ConnectionStatus),
    /// The server signalled a fresh stream; resubscription has started.
    StreamConnected,
    /// The live socket was lost.
    ConnectionLost {
        /// Human-readable cause.
        reason: String,
    },
    /// The focused session could not be resubscribed. The connection stays
    /// usable; the session view should show a notice.
    ResubscribeFailed {
        /// Session that lost its subscription.
        session_id: SessionId,
        /// Last failure.
        error: StreamError,
    },
    /// A frame for a session other than the focused one.
    CrossSession(ServerFrame),
    /// REST refresh of the focused session while the stream is degraded.
    SessionSnapshot(SessionSummary),
    /// The liveness watchdog gave up on a silent session.
    ReconnectNeeded {
        /// Session that went silent.
        session_id: SessionId,
    },
}
