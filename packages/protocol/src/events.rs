use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token/usage accounting reported by a backend when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Final payload of a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub text: String,
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Normalized event stream every execution backend produces.
///
/// Exactly one terminal variant (`Completed` or `Failed`) is emitted per
/// execution, after which the stream closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Text { text: String },
    ToolUse { tool: String, input: Value },
    ToolResult { tool: String, output: Value },
    Completed { result: AgentResult },
    Failed { message: String },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// An agent-proposed action parked until someone explicitly approves or
/// rejects it. `approved` stays `None` while the action is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub description: String,
    pub approved: Option<bool>,
}

impl PendingAction {
    pub fn is_pending(&self) -> bool {
        self.approved.is_none()
    }
}

/// Why a supervised execution reached its terminal `agent.done` event.
///
/// Timeouts and spawn failures are not here: they surface as terminal
/// `agent.error` events instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The backend finished on its own.
    Completed,
    /// A client cancel was accepted.
    Cancelled,
    /// The turn limit was reached.
    MaxTurns,
    /// The evaluator declared the goal met before the backend exited.
    Decision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_detection() {
        assert!(AgentEvent::Failed {
            message: "x".into()
        }
        .is_terminal());
        assert!(!AgentEvent::Text { text: "x".into() }.is_terminal());
    }

    #[test]
    fn done_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(DoneReason::MaxTurns).unwrap(),
            json!("max_turns")
        );
        assert_eq!(
            serde_json::to_value(DoneReason::Cancelled).unwrap(),
            json!("cancelled")
        );
    }
}
