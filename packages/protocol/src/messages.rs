use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::{AgentResult, DoneReason};
use crate::transcript::SessionMeta;

/// Messages a client may send over the control-plane socket.
///
/// Unauthenticated clients are limited to `Auth` and `Ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        channel: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "agent.request", rename_all = "camelCase")]
    AgentRequest {
        #[serde(default)]
        session_id: Option<String>,
        message: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        thinking: Option<String>,
    },
    #[serde(rename = "agent.cancel", rename_all = "camelCase")]
    AgentCancel { session_id: String },
    #[serde(rename = "session.list")]
    SessionList,
    #[serde(rename = "session.resume", rename_all = "camelCase")]
    SessionResume { session_id: String },
    #[serde(rename = "status")]
    Status,
}

impl ClientMessage {
    /// Message types permitted before authentication succeeds.
    pub fn allowed_unauthenticated(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Ping)
    }
}

/// One connected client as reported by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub port: u16,
    pub bind: String,
    /// Seconds since the control plane started.
    pub uptime: u64,
    pub clients: Vec<ClientInfo>,
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub pid: u32,
}

/// Messages the server pushes to clients. The wire form carries a `ts`
/// field added by [`ServerMessage::to_wire`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth.ok", rename_all = "camelCase")]
    AuthOk { client_id: String },
    #[serde(rename = "auth.fail")]
    AuthFail { reason: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "agent.stream", rename_all = "camelCase")]
    AgentStream { session_id: String, text: String },
    #[serde(rename = "agent.tool_use", rename_all = "camelCase")]
    AgentToolUse {
        session_id: String,
        tool: String,
        input: Value,
    },
    #[serde(rename = "agent.tool_result", rename_all = "camelCase")]
    AgentToolResult {
        session_id: String,
        tool: String,
        output: Value,
    },
    #[serde(rename = "agent.done", rename_all = "camelCase")]
    AgentDone {
        session_id: String,
        reason: DoneReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<AgentResult>,
    },
    #[serde(rename = "agent.error", rename_all = "camelCase")]
    AgentError { session_id: String, message: String },
    #[serde(rename = "security.violation", rename_all = "camelCase")]
    SecurityViolation {
        session_id: String,
        tool: String,
        path: String,
    },
    #[serde(rename = "agent.escalation", rename_all = "camelCase")]
    AgentEscalation {
        session_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "session.data")]
    SessionData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sessions: Option<Vec<SessionMeta>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionMeta>,
    },
    #[serde(rename = "status.data")]
    StatusData {
        #[serde(flatten)]
        status: StatusSnapshot,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Serialize with the outbound `ts` timestamp stamped in.
    pub fn to_wire(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|err| {
            json!({ "type": "error", "message": format!("serialization failure: {err}") })
        });
        if let Some(map) = value.as_object_mut() {
            map.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        }
        value
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_parses_wire_names() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"agent.request","message":"echo hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::AgentRequest {
                session_id: None,
                message: "echo hi".into(),
                model: None,
                thinking: None,
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"session.resume","sessionId":"sess_3"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SessionResume {
                session_id: "sess_3".into()
            }
        );
    }

    #[test]
    fn unauthenticated_gate() {
        assert!(ClientMessage::Ping.allowed_unauthenticated());
        assert!(ClientMessage::Auth {
            secret: None,
            channel: None
        }
        .allowed_unauthenticated());
        assert!(!ClientMessage::SessionList.allowed_unauthenticated());
    }

    #[test]
    fn wire_form_carries_ts() {
        let wire = ServerMessage::Pong.to_wire();
        assert_eq!(wire["type"], "pong");
        assert!(wire["ts"].is_string());
    }

    #[test]
    fn done_message_shape() {
        let wire = ServerMessage::AgentDone {
            session_id: "sess_1".into(),
            reason: DoneReason::Cancelled,
            result: None,
        }
        .to_wire();
        assert_eq!(wire["type"], "agent.done");
        assert_eq!(wire["reason"], "cancelled");
        assert_eq!(wire["sessionId"], "sess_1");
        assert!(wire.get("result").is_none());
    }
}
