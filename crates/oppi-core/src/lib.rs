//! # oppi-core
//!
//! Shared vocabulary for the oppi client crates:
//!
//! - **Branded IDs**: `SessionId`, `RequestId`, `TurnId` newtypes
//! - **Protocol**: inbound `ServerFrame`, outbound `ClientCommand`, turn stages
//! - **Errors**: the `StreamError` taxonomy
//! - **Retry**: reconnect backoff with jitter
//! - **Logging**: tracing subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;

pub use errors::{StreamError, StreamResult};
pub use ids::{RequestId, SessionId, TurnId, WorkspaceId};
