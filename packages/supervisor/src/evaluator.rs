//! Secondary evaluation of an in-flight execution.
//!
//! The supervisor periodically hands the goal, an output tail, and recent
//! tool calls to an [`Evaluator`]. A model-backed evaluator is used when an
//! API key is configured; otherwise a rule set stands in. Either way, an
//! evaluator failure always degrades to `continue` — it must never take the
//! supervised execution down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use valet_protocol::{parse_decision, text_signals_completion, Decision, DecisionKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const EVALUATOR_MAX_TOKENS: u32 = 1024;

/// One tool invocation as recorded for evaluator context and audit.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub tool: String,
    pub input: Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EvalContext {
    pub goal: String,
    pub output_tail: String,
    pub recent_tools: Vec<ToolCallRecord>,
    pub turn_count: u64,
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),
    #[error("evaluator returned unusable output")]
    Unparseable,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, ctx: &EvalContext) -> Result<Decision, EvaluatorError>;
}

/// Model-backed evaluator: one Messages API call per evaluation cycle.
pub struct ModelEvaluator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl ModelEvaluator {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn prompt(ctx: &EvalContext) -> String {
        let tools = if ctx.recent_tools.is_empty() {
            "none".to_string()
        } else {
            ctx.recent_tools
                .iter()
                .map(|record| format!("- {} {}", record.tool, record.input))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You are supervising another AI agent working on this goal:\n\
             {goal}\n\n\
             Turn {turn}. Recent tool calls:\n{tools}\n\n\
             Latest output:\n---\n{tail}\n---\n\n\
             Judge the progress and answer with a single JSON object:\n\
             {{\"decision\": \"continue|reply|complete|redirect|escalate\", \
             \"reasoning\": \"...\", \"message\": \"text to send to the agent, \
             required for reply/redirect\", \"confidence\": 0.0}}",
            goal = ctx.goal,
            turn = ctx.turn_count,
            tools = tools,
            tail = ctx.output_tail,
        )
    }
}

#[async_trait]
impl Evaluator for ModelEvaluator {
    async fn evaluate(&self, ctx: &EvalContext) -> Result<Decision, EvaluatorError> {
        let body = json!({
            "model": self.model,
            "max_tokens": EVALUATOR_MAX_TOKENS,
            "messages": [{ "role": "user", "content": Self::prompt(ctx) }],
        });
        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| EvaluatorError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvaluatorError::Unavailable(format!(
                "evaluator request failed with {status}"
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|err| EvaluatorError::Unavailable(err.to_string()))?;
        let text = value
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        parse_decision(&text).ok_or(EvaluatorError::Unparseable)
    }
}

/// Rule-based stand-in used when no evaluator model is configured.
///
/// Continues unless the output tail carries a completion phrase — and that
/// phrase scan is explicitly a best-effort secondary signal.
pub struct RuleEvaluator;

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn evaluate(&self, ctx: &EvalContext) -> Result<Decision, EvaluatorError> {
        if text_signals_completion(&ctx.output_tail) {
            return Ok(Decision {
                kind: DecisionKind::Complete,
                reasoning: "output text announces completion".to_string(),
                message: None,
                confidence: 0.3,
            });
        }
        Ok(Decision::default_continue("no completion signal in output"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tail: &str) -> EvalContext {
        EvalContext {
            goal: "echo hi".into(),
            output_tail: tail.into(),
            recent_tools: Vec::new(),
            turn_count: 1,
        }
    }

    #[tokio::test]
    async fn rule_evaluator_defaults_to_continue() {
        let decision = RuleEvaluator.evaluate(&ctx("still working")).await.unwrap();
        assert_eq!(decision.kind, DecisionKind::Continue);
    }

    #[tokio::test]
    async fn rule_evaluator_spots_completion_phrases() {
        let decision = RuleEvaluator
            .evaluate(&ctx("wrote the file. Task complete."))
            .await
            .unwrap();
        assert_eq!(decision.kind, DecisionKind::Complete);
        assert!(decision.confidence < 0.5);
    }

    #[test]
    fn model_prompt_includes_context() {
        let mut context = ctx("tail text");
        context.recent_tools.push(ToolCallRecord {
            tool: "bash".into(),
            input: json!({"command": "ls"}),
            ts: Utc::now(),
        });
        let prompt = ModelEvaluator::prompt(&context);
        assert!(prompt.contains("echo hi"));
        assert!(prompt.contains("tail text"));
        assert!(prompt.contains("- bash"));
    }
}
