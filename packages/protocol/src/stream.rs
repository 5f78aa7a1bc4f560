//! Tagged model of the agent CLI's stdout.
//!
//! The subprocess emits one JSON object per line. Each known `type` tag has
//! its own parser; anything else — including lines that are not JSON at all —
//! lands in [`StreamLine::Raw`] and is still forwarded downstream as text.

use serde_json::Value;

use crate::events::Usage;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// `{"type":"system","subtype":"init",...}` — handshake metadata.
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// `{"type":"text","text":...}` — a streamed text chunk.
    Text { text: String },
    /// `{"type":"assistant","message":{"content":[...]}}` — an assistant
    /// envelope whose content blocks mix text and tool invocations.
    Assistant {
        text: String,
        tool_uses: Vec<ToolInvocation>,
    },
    /// `{"type":"tool_use","tool":...,"input":...}`
    ToolUse { tool: String, input: Value },
    /// `{"type":"tool_result","tool":...,"output":...}`
    ToolResult { tool: String, output: Value },
    /// `{"type":"result",...}` — the run summary the CLI prints last.
    Result {
        text: Option<String>,
        usage: Option<Usage>,
        is_error: bool,
    },
    /// `{"type":"error","message":...}`
    Error { message: String },
    /// Not JSON, or an unrecognized tag. Never dropped.
    Raw(String),
}

pub fn parse_stream_line(line: &str) -> StreamLine {
    let trimmed = line.trim();
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return StreamLine::Raw(trimmed.to_string()),
    };
    let tag = value.get("type").and_then(Value::as_str).unwrap_or("");
    match tag {
        "system" => init_line(&value),
        "text" => text_line(&value, trimmed),
        "assistant" => assistant_line(&value),
        "tool_use" => tool_use_line(&value, trimmed),
        "tool_result" => tool_result_line(&value),
        "result" => result_line(&value),
        "error" => error_line(&value),
        _ => StreamLine::Raw(trimmed.to_string()),
    }
}

fn init_line(value: &Value) -> StreamLine {
    StreamLine::Init {
        session_id: string_field(value, &["session_id", "sessionId"]),
        model: string_field(value, &["model"]),
    }
}

fn text_line(value: &Value, raw: &str) -> StreamLine {
    match value.get("text").and_then(Value::as_str) {
        Some(text) => StreamLine::Text {
            text: text.to_string(),
        },
        None => StreamLine::Raw(raw.to_string()),
    }
}

fn assistant_line(value: &Value) -> StreamLine {
    let blocks = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_uses = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                    text.push_str(chunk);
                }
            }
            "tool_use" => {
                if let Some(name) = block.get("name").and_then(Value::as_str) {
                    tool_uses.push(ToolInvocation {
                        tool: name.to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
            }
            _ => {}
        }
    }
    StreamLine::Assistant { text, tool_uses }
}

fn tool_use_line(value: &Value, raw: &str) -> StreamLine {
    let tool = string_field(value, &["tool", "name"]);
    match tool {
        Some(tool) => StreamLine::ToolUse {
            tool,
            input: value.get("input").cloned().unwrap_or(Value::Null),
        },
        None => StreamLine::Raw(raw.to_string()),
    }
}

fn tool_result_line(value: &Value) -> StreamLine {
    StreamLine::ToolResult {
        tool: string_field(value, &["tool", "name"]).unwrap_or_default(),
        output: value
            .get("output")
            .or_else(|| value.get("content"))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn result_line(value: &Value) -> StreamLine {
    let usage = value.get("usage").map(|usage| Usage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
    });
    StreamLine::Result {
        text: string_field(value, &["result", "text"]),
        usage,
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn error_line(value: &Value) -> StreamLine {
    StreamLine::Error {
        message: string_field(value, &["message", "error"])
            .unwrap_or_else(|| "unknown agent error".to_string()),
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn junk_becomes_raw() {
        assert_eq!(
            parse_stream_line("not json at all"),
            StreamLine::Raw("not json at all".into())
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"mystery","x":1}"#),
            StreamLine::Raw(r#"{"type":"mystery","x":1}"#.into())
        );
    }

    #[test]
    fn text_and_tool_lines() {
        assert_eq!(
            parse_stream_line(r#"{"type":"text","text":"hi"}"#),
            StreamLine::Text { text: "hi".into() }
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"tool_use","tool":"bash","input":{"command":"ls"}}"#),
            StreamLine::ToolUse {
                tool: "bash".into(),
                input: json!({"command": "ls"}),
            }
        );
    }

    #[test]
    fn assistant_envelope_flattens_blocks() {
        let line = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "running "},
                    {"type": "tool_use", "name": "bash", "input": {"command": "echo hi"}},
                    {"type": "text", "text": "now"},
                ]
            }
        })
        .to_string();
        match parse_stream_line(&line) {
            StreamLine::Assistant { text, tool_uses } => {
                assert_eq!(text, "running now");
                assert_eq!(tool_uses.len(), 1);
                assert_eq!(tool_uses[0].tool, "bash");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn result_line_extracts_usage() {
        let line = parse_stream_line(
            r#"{"type":"result","result":"done","usage":{"input_tokens":10,"output_tokens":42}}"#,
        );
        assert_eq!(
            line,
            StreamLine::Result {
                text: Some("done".into()),
                usage: Some(Usage {
                    input_tokens: Some(10),
                    output_tokens: Some(42),
                }),
                is_error: false,
            }
        );
    }

    #[test]
    fn tagged_line_missing_fields_degrades_to_raw() {
        assert_eq!(
            parse_stream_line(r#"{"type":"tool_use"}"#),
            StreamLine::Raw(r#"{"type":"tool_use"}"#.into())
        );
    }
}
