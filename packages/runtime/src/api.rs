//! In-process execution backend: a direct Anthropic Messages API call.
//!
//! Selected when an API key is configured. This path has no tool loop and
//! no input channel; it turns the prompt into streamed text plus a terminal
//! event with usage accounting.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use valet_protocol::{AgentEvent, AgentResult, Usage};

use crate::{ExecRequest, RuntimeConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

enum CallError {
    RateLimited,
    Cancelled,
    Transport(String),
}

pub(crate) async fn run(
    config: Arc<RuntimeConfig>,
    request: ExecRequest,
    events: mpsc::UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
) {
    let mut model = request
        .model
        .clone()
        .unwrap_or_else(|| config.default_model.clone());
    let mut thinking = request.thinking.clone();
    let mut fallback_used = false;

    let terminal = loop {
        match call(&config, &model, thinking.as_deref(), &request.prompt, &cancel).await {
            Ok((text, usage)) => {
                if !text.is_empty() {
                    let _ = events.send(AgentEvent::Text { text: text.clone() });
                }
                break AgentEvent::Completed {
                    result: AgentResult {
                        text,
                        tools_used: Vec::new(),
                        usage,
                    },
                };
            }
            Err(CallError::RateLimited) if !fallback_used => {
                tracing::warn!(
                    session_id = %request.session_id,
                    model = %model,
                    "api backend rate limited; retrying with relaxed profile"
                );
                fallback_used = true;
                model = config.default_model.clone();
                thinking = None;
            }
            Err(CallError::RateLimited) => {
                break AgentEvent::Failed {
                    message: "provider rate limit persisted after fallback".to_string(),
                };
            }
            Err(CallError::Cancelled) => {
                break AgentEvent::Failed {
                    message: "execution cancelled".to_string(),
                };
            }
            Err(CallError::Transport(message)) => break AgentEvent::Failed { message },
        }
    };
    let _ = events.send(terminal);
}

async fn call(
    config: &RuntimeConfig,
    model: &str,
    thinking: Option<&str>,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<(String, Option<Usage>), CallError> {
    let client = reqwest::Client::new();
    let mut body = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": [{ "role": "user", "content": prompt }],
    });
    if let Some(budget) = thinking_budget(thinking) {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }

    let request = client
        .post(format!("{}/v1/messages", config.api_base))
        .header("x-api-key", config.api_key.as_deref().unwrap_or_default())
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(CallError::Cancelled),
        response = request => response.map_err(|err| CallError::Transport(err.to_string()))?,
    };

    let status = response.status();
    if status.as_u16() == 429 || status.as_u16() == 529 {
        return Err(CallError::RateLimited);
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(CallError::Transport(format!(
            "messages request failed {status}: {detail}"
        )));
    }

    let value: Value = response
        .json()
        .await
        .map_err(|err| CallError::Transport(err.to_string()))?;
    let text = value
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let usage = value.get("usage").map(|usage| Usage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
    });
    Ok((text, usage))
}

fn thinking_budget(thinking: Option<&str>) -> Option<u32> {
    match thinking.map(|level| level.to_ascii_lowercase()) {
        Some(level) if level == "low" => Some(1024),
        Some(level) if level == "medium" => Some(4096),
        Some(level) if level == "high" => Some(16384),
        _ => None,
    }
}
