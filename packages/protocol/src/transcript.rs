use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One line of a session's append-only transcript file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Message {
        role: Role,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        ts: DateTime<Utc>,
    },
    Event {
        name: String,
        data: Value,
        ts: DateTime<Utc>,
    },
}

impl TranscriptEntry {
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self::Message {
            role,
            content: content.into(),
            meta: None,
            ts: Utc::now(),
        }
    }

    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            name: name.into(),
            data,
            ts: Utc::now(),
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::Message { ts, .. } | Self::Event { ts, .. } => *ts,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Active,
}

/// Session metadata derived from transcript files, returned by
/// `session.list` / `session.resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: SessionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_roundtrip() {
        let entry = TranscriptEntry::message(Role::User, "hello");
        let line = serde_json::to_string(&entry).unwrap();
        let back: TranscriptEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn event_wire_shape() {
        let entry = TranscriptEntry::event("security.violation", json!({"path": "/etc"}));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["name"], "security.violation");
        assert!(value["ts"].is_string());
    }
}
