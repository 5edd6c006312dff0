//! Wire shapes for the multiplexed session stream.
//!
//! Inbound frames are decoded into one loose [`ServerFrame`] shape: the
//! engine only needs the correlation fields (`type`, `sessionId`,
//! `requestId`, `seq`, `currentSeq`) and leaves the rest of the payload to
//! the consumer. [`ServerFrame::signal`] picks out the handful of frame
//! types the engine itself acts on.
//!
//! Outbound traffic is the closed [`ClientCommand`] catalog plus a generic
//! escape hatch for one-shot commands.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::ids::{RequestId, SessionId, TurnId};

/// Inbound frame type names the engine interprets.
pub mod frame_types {
    /// Stream-level (re)connection signal. Triggers resubscription.
    pub const STREAM_CONNECTED: &str = "stream_connected";
    /// Flat command reply.
    pub const COMMAND_RESULT: &str = "command_result";
    /// Staged turn acknowledgement.
    pub const TURN_ACK: &str = "turn_ack";
    /// The agent started working on a turn.
    pub const AGENT_START: &str = "agent_start";
    /// The agent finished a turn.
    pub const AGENT_END: &str = "agent_end";
    /// The session terminated on the host.
    pub const SESSION_ENDED: &str = "session_ended";
    /// A tool wants the user's approval.
    pub const PERMISSION_REQUEST: &str = "permission_request";
}

/// Outbound command names.
pub mod command_names {
    /// Subscribe to a session.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Drop a session subscription.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Answer a permission request.
    pub const PERMISSION_RESPONSE: &str = "permission_response";
    /// Start a new turn.
    pub const PROMPT: &str = "prompt";
    /// Redirect the running turn.
    pub const STEER: &str = "steer";
    /// Queue a message after the running turn.
    pub const FOLLOW_UP: &str = "follow_up";
    /// Ask for a state snapshot (also used as a liveness probe).
    pub const GET_STATE: &str = "get_state";
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription level & stages
// ─────────────────────────────────────────────────────────────────────────────

/// How much of a session's traffic a subscription delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionLevel {
    /// Every event. Held by at most one session: the focused one.
    Full,
    /// Cross-cutting events only (permission requests, session end).
    Notifications,
}

impl SubscriptionLevel {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Notifications => "notifications",
        }
    }
}

/// Server-reported checkpoint in the processing of a turn.
///
/// Known stages rank `queued < dispatched < accepted`. Names the client
/// does not know are preserved in [`TurnStage::Other`] and never satisfy a
/// threshold.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TurnStage {
    /// Accepted into the session's input queue.
    Queued,
    /// Handed to the agent runtime.
    Dispatched,
    /// The agent acknowledged the turn.
    Accepted,
    /// A stage this client does not understand.
    Other(String),
}

impl TurnStage {
    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Accepted => "accepted",
            Self::Other(s) => s,
        }
    }

    /// Position in the stage order; `None` for unknown stages.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Dispatched => Some(1),
            Self::Accepted => Some(2),
            Self::Other(_) => None,
        }
    }

    /// Whether this stage reaches or exceeds `required`.
    pub fn reaches(&self, required: &TurnStage) -> bool {
        match (self.rank(), required.rank()) {
            (Some(have), Some(need)) => have >= need,
            _ => false,
        }
    }
}

impl From<String> for TurnStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "dispatched" => Self::Dispatched,
            "accepted" => Self::Accepted,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for TurnStage {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<TurnStage> for String {
    fn from(stage: TurnStage) -> Self {
        match stage {
            TurnStage::Other(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Sequence metadata attached to session events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqMeta {
    /// Sequence number of this event.
    pub seq: u64,
    /// Server's current head sequence, when reported.
    pub current_seq: Option<u64>,
}

/// One decoded inbound frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Owning session; absent for stream-level frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Correlation ID for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Per-session sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Server head sequence at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_seq: Option<u64>,
    /// Type-specific fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Flat reply to a command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    /// Command name the reply is for.
    pub command: String,
    /// Correlation ID.
    pub request_id: Option<RequestId>,
    /// Whether the command succeeded.
    pub success: bool,
    /// Result payload.
    pub data: Option<Value>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Staged acknowledgement of a turn send.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnAck {
    /// Command name (`prompt`, `steer`, `follow_up`).
    pub command: String,
    /// Correlation ID of the send that produced the stage.
    pub request_id: Option<RequestId>,
    /// Idempotency token of the turn.
    pub turn_id: Option<TurnId>,
    /// Reported stage.
    pub stage: TurnStage,
}

/// What the engine should do with a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundSignal {
    /// The stream was (re)established.
    StreamConnected,
    /// A flat command reply.
    CommandResult(CommandResult),
    /// A staged turn acknowledgement.
    TurnAck(TurnAck),
    /// Anything else: an opaque event for consumers.
    Event,
}

impl ServerFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Frames without a session are stream-level.
    pub fn is_stream_level(&self) -> bool {
        self.session_id.is_none()
    }

    /// Sequence metadata, if the frame carries a `seq`.
    pub fn seq_meta(&self) -> Option<SeqMeta> {
        self.seq.map(|seq| SeqMeta {
            seq,
            current_seq: self.current_seq,
        })
    }

    /// String field from the body.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Classify the frame for the engine.
    pub fn signal(&self) -> InboundSignal {
        match self.kind.as_str() {
            frame_types::STREAM_CONNECTED if self.is_stream_level() => {
                InboundSignal::StreamConnected
            }
            frame_types::COMMAND_RESULT => InboundSignal::CommandResult(CommandResult {
                command: self.str_field("command").unwrap_or_default().to_owned(),
                request_id: self.request_id.clone(),
                success: self
                    .body
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                data: self.body.get("data").filter(|v| !v.is_null()).cloned(),
                error: self.str_field("error").map(str::to_owned),
            }),
            frame_types::TURN_ACK => match self.str_field("stage") {
                Some(stage) => InboundSignal::TurnAck(TurnAck {
                    command: self.str_field("command").unwrap_or_default().to_owned(),
                    request_id: self.request_id.clone(),
                    turn_id: self.str_field("turnId").map(TurnId::from_raw),
                    stage: TurnStage::from(stage),
                }),
                None => InboundSignal::Event,
            },
            _ => InboundSignal::Event,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Image attached to a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// Base64 payload.
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
}

/// Message body shared by prompt, steer, and follow-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnPayload {
    /// User text.
    pub message: String,
    /// Attached images.
    pub images: Vec<ImageAttachment>,
    /// Correlation ID for this send attempt.
    pub request_id: RequestId,
    /// Idempotency token for the turn.
    pub turn_id: TurnId,
}

/// The three flavours of user turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TurnKind {
    /// A new turn.
    Prompt,
    /// Redirect the running turn.
    Steer,
    /// Queue after the running turn.
    FollowUp,
}

impl TurnKind {
    /// Wire command name.
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Prompt => command_names::PROMPT,
            Self::Steer => command_names::STEER,
            Self::FollowUp => command_names::FOLLOW_UP,
        }
    }

    /// Wrap a payload into the matching command.
    pub fn into_command(self, payload: TurnPayload) -> ClientCommand {
        match self {
            Self::Prompt => ClientCommand::Prompt(payload),
            Self::Steer => ClientCommand::Steer(payload),
            Self::FollowUp => ClientCommand::FollowUp(payload),
        }
    }
}

/// Answer to a permission request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    /// Let the tool run.
    Allow,
    /// Refuse the tool call.
    Deny,
}

/// Outbound command catalog.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCommand {
    /// Subscribe to a session at a level.
    Subscribe {
        /// Target session.
        session_id: SessionId,
        /// Delivery level.
        level: SubscriptionLevel,
        /// Correlation ID.
        request_id: RequestId,
        /// Replay events after this sequence number.
        since_seq: Option<u64>,
    },
    /// Drop a subscription.
    Unsubscribe {
        /// Target session.
        session_id: SessionId,
        /// Correlation ID.
        request_id: RequestId,
    },
    /// Answer a permission request.
    PermissionResponse {
        /// Session the request belongs to.
        session_id: SessionId,
        /// Permission request ID.
        permission_id: String,
        /// Decision.
        action: PermissionAction,
        /// Correlation ID.
        request_id: RequestId,
    },
    /// New turn.
    Prompt(TurnPayload),
    /// Steer the running turn.
    Steer(TurnPayload),
    /// Follow-up after the running turn.
    FollowUp(TurnPayload),
    /// State snapshot request.
    GetState {
        /// Correlation ID.
        request_id: RequestId,
    },
    /// Any other one-shot command.
    Generic {
        /// Command name, sent as `type`.
        name: String,
        /// Correlation ID.
        request_id: RequestId,
        /// Extra fields merged into the frame.
        params: Map<String, Value>,
    },
}

impl ClientCommand {
    /// Wire command name.
    pub fn name(&self) -> &str {
        match self {
            Self::Subscribe { .. } => command_names::SUBSCRIBE,
            Self::Unsubscribe { .. } => command_names::UNSUBSCRIBE,
            Self::PermissionResponse { .. } => command_names::PERMISSION_RESPONSE,
            Self::Prompt(_) => command_names::PROMPT,
            Self::Steer(_) => command_names::STEER,
            Self::FollowUp(_) => command_names::FOLLOW_UP,
            Self::GetState { .. } => command_names::GET_STATE,
            Self::Generic { name, .. } => name,
        }
    }

    /// Correlation ID carried by the command.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Subscribe { request_id, .. }
            | Self::Unsubscribe { request_id, .. }
            | Self::PermissionResponse { request_id, .. }
            | Self::GetState { request_id }
            | Self::Generic { request_id, .. } => request_id,
            Self::Prompt(p) | Self::Steer(p) | Self::FollowUp(p) => &p.request_id,
        }
    }

    /// Commands that name their own session are sent without an envelope.
    pub fn carries_own_session(&self) -> bool {
        matches!(
            self,
            Self::Subscribe { .. } | Self::Unsubscribe { .. } | Self::PermissionResponse { .. }
        )
    }

    /// Build the JSON frame. Session-scoped commands get `sessionId` added
    /// alongside their payload.
    pub fn to_frame(&self, session_id: Option<&SessionId>) -> Value {
        let mut frame = match self {
            Self::Subscribe {
                session_id,
                level,
                request_id,
                since_seq,
            } => {
                let mut v = json!({
                    "type": self.name(),
                    "sessionId": session_id,
                    "level": level,
                    "requestId": request_id,
                });
                if let Some(seq) = since_seq {
                    v["sinceSeq"] = json!(seq);
                }
                v
            }
            Self::Unsubscribe {
                session_id,
                request_id,
            } => json!({
                "type": self.name(),
                "sessionId": session_id,
                "requestId": request_id,
            }),
            Self::PermissionResponse {
                session_id,
                permission_id,
                action,
                request_id,
            } => json!({
                "type": self.name(),
                "sessionId": session_id,
                "id": permission_id,
                "action": action,
                "requestId": request_id,
            }),
            Self::Prompt(p) | Self::Steer(p) | Self::FollowUp(p) => {
                let mut v = json!({
                    "type": self.name(),
                    "message": p.message,
                    "requestId": p.request_id,
                    "turnId": p.turn_id,
                });
                if !p.images.is_empty() {
                    v["images"] = json!(p.images);
                }
                v
            }
            Self::GetState { request_id } => json!({
                "type": self.name(),
                "requestId": request_id,
            }),
            Self::Generic {
                name,
                request_id,
                params,
            } => {
                let mut map = params.clone();
                let _ = map.insert("type".into(), Value::String(name.clone()));
                let _ = map.insert("requestId".into(), json!(request_id));
                Value::Object(map)
            }
        };

        if !self.carries_own_session() {
            if let (Some(sid), Some(obj)) = (session_id, frame.as_object_mut()) {
                let _ = obj.insert("sessionId".into(), json!(sid));
            }
        }
        frame
    }

    /// Serialize to the text sent on the socket.
    pub fn encode(&self, session_id: Option<&SessionId>) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(msg: &str) -> TurnPayload {
        TurnPayload {
            message: msg.into(),
            images: vec![],
            request_id: RequestId::from_raw("r1"),
            turn_id: TurnId::from_raw("t1"),
        }
    }

    #[test]
    fn decode_session_event_keeps_body() {
        let frame = ServerFrame::decode(
            r#"{"type":"text_delta","sessionId":"s1","seq":7,"currentSeq":9,"delta":"hi"}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, "text_delta");
        assert_eq!(frame.session_id, Some(SessionId::from_raw("s1")));
        assert_eq!(
            frame.seq_meta(),
            Some(SeqMeta {
                seq: 7,
                current_seq: Some(9)
            })
        );
        assert_eq!(frame.str_field("delta"), Some("hi"));
        assert_eq!(frame.signal(), InboundSignal::Event);
    }

    #[test]
    fn stream_connected_is_stream_level() {
        let frame = ServerFrame::decode(r#"{"type":"stream_connected"}"#).unwrap();
        assert!(frame.is_stream_level());
        assert_eq!(frame.signal(), InboundSignal::StreamConnected);
    }

    #[test]
    fn command_result_signal() {
        let frame = ServerFrame::decode(
            r#"{"type":"command_result","command":"subscribe","requestId":"r9","success":false,"error":"no such session"}"#,
        )
        .unwrap();
        let InboundSignal::CommandResult(result) = frame.signal() else {
            panic!("expected command result");
        };
        assert_eq!(result.command, "subscribe");
        assert_eq!(result.request_id, Some(RequestId::from_raw("r9")));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no such session"));
        assert!(result.data.is_none());
    }

    #[test]
    fn turn_ack_signal() {
        let frame = ServerFrame::decode(
            r#"{"type":"turn_ack","sessionId":"s1","command":"prompt","requestId":"r1","turnId":"t1","stage":"dispatched"}"#,
        )
        .unwrap();
        let InboundSignal::TurnAck(ack) = frame.signal() else {
            panic!("expected turn ack");
        };
        assert_eq!(ack.stage, TurnStage::Dispatched);
        assert_eq!(ack.turn_id, Some(TurnId::from_raw("t1")));
    }

    #[test]
    fn stage_ordering() {
        assert!(TurnStage::Dispatched.reaches(&TurnStage::Dispatched));
        assert!(TurnStage::Accepted.reaches(&TurnStage::Dispatched));
        assert!(!TurnStage::Queued.reaches(&TurnStage::Dispatched));
        assert!(!TurnStage::Other("mystery".into()).reaches(&TurnStage::Queued));
        assert_eq!(TurnStage::from("started"), TurnStage::Other("started".into()));
    }

    #[test]
    fn subscribe_is_sent_unwrapped() {
        let cmd = ClientCommand::Subscribe {
            session_id: SessionId::from_raw("s1"),
            level: SubscriptionLevel::Full,
            request_id: RequestId::from_raw("r1"),
            since_seq: Some(41),
        };
        let frame = cmd.to_frame(Some(&SessionId::from_raw("other")));
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["sessionId"], "s1");
        assert_eq!(frame["level"], "full");
        assert_eq!(frame["sinceSeq"], 41);
    }

    #[test]
    fn prompt_is_wrapped_with_session() {
        let cmd = TurnKind::Prompt.into_command(payload("hi"));
        let frame = cmd.to_frame(Some(&SessionId::from_raw("s1")));
        assert_eq!(frame["type"], "prompt");
        assert_eq!(frame["sessionId"], "s1");
        assert_eq!(frame["message"], "hi");
        assert_eq!(frame["turnId"], "t1");
        assert!(frame.get("images").is_none());
    }

    #[test]
    fn generic_command_merges_params() {
        let mut params = Map::new();
        let _ = params.insert("entryId".into(), json!("e4"));
        let cmd = ClientCommand::Generic {
            name: "get_fork_messages".into(),
            request_id: RequestId::from_raw("r2"),
            params,
        };
        assert_eq!(cmd.name(), "get_fork_messages");
        let frame = cmd.to_frame(Some(&SessionId::from_raw("s2")));
        assert_eq!(frame["entryId"], "e4");
        assert_eq!(frame["requestId"], "r2");
        assert_eq!(frame["sessionId"], "s2");
    }
}
