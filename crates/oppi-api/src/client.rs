//! Control-plane REST client.
//!
//! The engine only reads: session list, single session, workspace list.
//! It calls these while the stream is degraded so the UI keeps a fresh
//! view of session status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oppi_core::SessionId;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::credentials::CredentialProvider;
use crate::error::{ApiError, Result};
use crate::types::{
    SessionListResponse, SessionResponse, SessionSummary, Workspace, WorkspaceListResponse,
};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only control-plane operations consumed by the engine.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// All sessions visible to the caller.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;
    /// One session by id.
    async fn get_session(&self, id: &SessionId) -> Result<SessionSummary>;
    /// All workspaces visible to the caller.
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;
}

/// `reqwest`-backed [`ControlPlane`].
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl RestClient {
    /// Build a client that resolves credentials per request.
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let creds = self.credentials.credentials().await?;
        let url = creds.endpoint(path);
        debug!(%url, "control-plane GET");

        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, creds.bearer())
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ControlPlane for RestClient {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let resp: SessionListResponse = self.get_json("/sessions").await?;
        Ok(resp.sessions)
    }

    async fn get_session(&self, id: &SessionId) -> Result<SessionSummary> {
        let resp: SessionResponse = self.get_json(&format!("/sessions/{id}")).await?;
        Ok(resp.session)
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let resp: WorkspaceListResponse = self.get_json("/workspaces").await?;
        Ok(resp.workspaces)
    }
}
