//! Control-plane payload types.

use chrono::{DateTime, Utc};
use oppi_core::{SessionId, WorkspaceId};
use serde::{Deserialize, Serialize};

/// One session as reported by the control plane.
///
/// Timestamps are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Lifecycle status (`ready`, `busy`, `stopped`, ...).
    pub status: String,
    /// Model in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Owning workspace's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_name: Option<String>,
    /// Execution runtime (`host`, `container`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: i64,
    /// Time of the last activity.
    #[serde(default)]
    pub last_activity: i64,
    /// Messages exchanged so far.
    #[serde(default)]
    pub message_count: u64,
    /// Accumulated cost in USD.
    #[serde(default)]
    pub cost: f64,
    /// Preview of the latest message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl SessionSummary {
    /// `created_at` as a UTC timestamp.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.created_at)
    }

    /// `last_activity` as a UTC timestamp.
    pub fn last_activity_utc(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.last_activity)
    }

    /// Whether the session is currently running a turn.
    pub fn is_busy(&self) -> bool {
        self.status == "busy"
    }
}

/// A workspace on the remote host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Workspace identifier.
    pub id: WorkspaceId,
    /// Display name.
    pub name: String,
    /// Execution runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Working directory on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_mount: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionResponse {
    pub session: SessionSummary,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkspaceListResponse {
    pub workspaces: Vec<Workspace>,
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tolerates_missing_optionals() {
        let summary: SessionSummary =
            serde_json::from_str(r#"{"id":"a1","status":"ready"}"#).unwrap();
        assert_eq!(summary.id.as_str(), "a1");
        assert_eq!(summary.message_count, 0);
        assert!(summary.model.is_none());
        assert!(summary.last_activity_utc().is_none());
    }

    #[test]
    fn summary_reads_camel_case() {
        let summary: SessionSummary = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "status": "busy",
            "workspaceName": "oppi",
            "lastActivity": 1_700_000_000_000i64,
            "messageCount": 12,
            "cost": 0.25,
            "lastMessage": "done"
        }))
        .unwrap();
        assert!(summary.is_busy());
        assert_eq!(summary.workspace_name.as_deref(), Some("oppi"));
        assert_eq!(
            summary.last_activity_utc().map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }
}
