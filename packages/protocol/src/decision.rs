use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The five verdicts an evaluator may return about an in-flight execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Continue,
    Reply,
    Complete,
    Redirect,
    Escalate,
}

impl DecisionKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "reply" => Some(Self::Reply),
            "complete" => Some(Self::Complete),
            "redirect" => Some(Self::Redirect),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }

    /// Whether this decision carries a message for the agent's input channel.
    pub fn delivers_message(&self) -> bool {
        matches!(self, Self::Reply | Self::Redirect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub kind: DecisionKind,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub confidence: f32,
}

impl Decision {
    /// The fallback used whenever the evaluator is unreachable or returns
    /// output we cannot interpret. Evaluator failures never abort execution.
    pub fn default_continue(reasoning: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Continue,
            reasoning: reasoning.into(),
            message: None,
            confidence: 0.0,
        }
    }
}

/// One entry in the supervisor's ordered decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub ts: DateTime<Utc>,
    pub turn_count: u64,
    pub decision: Decision,
}

/// Extract a [`Decision`] from evaluator model output.
///
/// Models wrap their JSON in prose or code fences often enough that this
/// scans for the outermost object instead of parsing the whole response.
/// Returns `None` for anything unusable; the caller substitutes
/// [`Decision::default_continue`].
pub fn parse_decision(text: &str) -> Option<Decision> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let kind = DecisionKind::parse(value.get("decision").and_then(Value::as_str)?)?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(|m| m.to_string());
    if kind.delivers_message() && message.is_none() {
        return None;
    }
    Some(Decision {
        kind,
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        message,
        confidence: value
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| c as f32)
            .unwrap_or(0.5),
    })
}

/// Best-effort completion sniffing over agent output text.
///
/// This is a secondary signal only: the structured `complete` decision is
/// the real completion mechanism. Used by the rule-based evaluator when no
/// model is configured.
pub fn text_signals_completion(text: &str) -> bool {
    let tail: String = text
        .chars()
        .rev()
        .take(600)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let tail = tail.to_ascii_lowercase();
    ["goal complete", "task complete", "all done", "finished the task"]
        .iter()
        .any(|phrase| tail.contains(phrase))
}
