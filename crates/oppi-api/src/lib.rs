//! # oppi-api
//!
//! REST control-plane client and the credential provider seam.
//!
//! - [`ControlPlane`]: read-only session/workspace operations
//! - [`RestClient`]: `reqwest` implementation with bearer auth
//! - [`CredentialProvider`]: endpoint and token source shared with the
//!   stream transport

#![deny(unsafe_code)]

pub mod client;
pub mod credentials;
pub mod error;
pub mod types;

pub use client::{ControlPlane, RestClient};
pub use credentials::{CredentialProvider, Credentials, StaticCredentials};
pub use error::{ApiError, Result};
pub use types::{SessionSummary, Workspace};
