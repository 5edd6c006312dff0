//! Credential provider seam.
//!
//! The stream transport and the REST client both ask a
//! [`CredentialProvider`] for the endpoint and bearer token right before
//! opening a connection, so a rotated token or a switched server is picked
//! up on the next attempt.

use async_trait::async_trait;

use crate::error::{ApiError, Result};

/// Endpoint plus bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// HTTP(S) origin, without a trailing slash.
    pub base_url: String,
    /// Bearer token.
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("token", &"[redacted]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials, normalizing the origin.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            base_url,
            token: token.into(),
        }
    }

    /// Join a path onto the origin.
    pub fn endpoint(&self, path: &str) -> String {
        let path = path.trim();
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// Stream URL for `path`: `http` becomes `ws`, `https` becomes `wss`.
    pub fn stream_url(&self, path: &str) -> String {
        let http = self.endpoint(path);
        if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            http
        }
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Source of endpoint and token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credentials.
    async fn credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials.
#[derive(Clone, Debug)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    /// Wrap fixed credentials.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self(Credentials::new(base_url, token))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        if self.0.base_url.is_empty() {
            return Err(ApiError::Credentials("base URL is empty".into()));
        }
        Ok(self.0.clone())
    }
}
