//! Subprocess execution backend.
//!
//! Spawns the external agent CLI, delivers the prompt over stdin as a
//! JSON user-message line (never argv), and consumes newline-delimited JSON
//! from stdout via [`parse_stream_line`]. Lines that are not valid JSON are
//! forwarded as text, never dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use valet_error::{ErrorKind, ValetError};
use valet_protocol::{parse_stream_line, AgentEvent, AgentResult, StreamLine, Usage};

use crate::rate_limit;
use crate::{ExecRequest, RuntimeConfig};

pub const DEFAULT_AGENT_BIN: &str = "claude";

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Collector {
    text: String,
    tools: Vec<String>,
    usage: Option<Usage>,
    result_text: Option<String>,
    error_message: Option<String>,
    rate_limited: bool,
}

impl Collector {
    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
        if rate_limit::detect(text) {
            self.rate_limited = true;
        }
    }

    fn push_tool(&mut self, tool: &str) {
        if !self.tools.iter().any(|seen| seen == tool) {
            self.tools.push(tool.to_string());
        }
    }

    fn into_result(self) -> AgentResult {
        let text = match self.result_text {
            Some(result_text) if !result_text.is_empty() => result_text,
            _ => self.text,
        };
        AgentResult {
            text,
            tools_used: self.tools,
            usage: self.usage,
        }
    }
}

enum RunStatus {
    Exited(std::process::ExitStatus),
    SpawnFailed(String),
    Cancelled,
    WaitFailed(String),
}

pub(crate) async fn run(
    config: Arc<RuntimeConfig>,
    program: PathBuf,
    request: ExecRequest,
    events: mpsc::UnboundedSender<AgentEvent>,
    mut input_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut collector = Collector::default();
    let mut model = request.model.clone();
    let mut thinking = request.thinking.clone();
    let mut fallback_used = false;

    let status = loop {
        let status = run_once(
            &config,
            &program,
            &request.prompt,
            model.as_deref(),
            thinking.as_deref(),
            &events,
            &mut input_rx,
            &cancel,
            &mut collector,
        )
        .await;

        // One transparent retry with the relaxed profile before a rate
        // limit surfaces to the caller.
        if collector.rate_limited && !fallback_used && !cancel.is_cancelled() {
            tracing::warn!(
                session_id = %request.session_id,
                code = ErrorKind::RateLimited.as_code(),
                "rate limit phrasing detected; retrying with relaxed profile"
            );
            fallback_used = true;
            model = None;
            thinking = None;
            collector.rate_limited = false;
            collector.error_message = None;
            continue;
        }
        break status;
    };

    let terminal = match status {
        RunStatus::SpawnFailed(message) => AgentEvent::Failed { message },
        RunStatus::Cancelled => AgentEvent::Failed {
            message: "execution cancelled".to_string(),
        },
        RunStatus::WaitFailed(message) => AgentEvent::Failed { message },
        RunStatus::Exited(exit) if exit.success() => AgentEvent::Completed {
            result: collector.into_result(),
        },
        RunStatus::Exited(exit) => AgentEvent::Failed {
            message: collector.error_message.unwrap_or_else(|| {
                format!("agent exited with status {exit}")
            }),
        },
    };
    let _ = events.send(terminal);
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    config: &RuntimeConfig,
    program: &PathBuf,
    prompt: &str,
    model: Option<&str>,
    thinking: Option<&str>,
    events: &mpsc::UnboundedSender<AgentEvent>,
    input_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    collector: &mut Collector,
) -> RunStatus {
    let mut command = build_command(config, program, model, thinking);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let failure = ValetError::SpawnFailure {
                command: program.display().to_string(),
                message: err.to_string(),
            };
            return RunStatus::SpawnFailed(failure.to_string());
        }
    };

    let mut stdin = child.stdin.take();
    if let Some(writer) = stdin.as_mut() {
        if let Err(err) = write_line(writer, &user_message_line(prompt)).await {
            tracing::warn!(error = %err, "failed to deliver prompt to agent stdin");
        }
    }

    let rate_limited_on_stderr = Arc::new(AtomicBool::new(false));
    if let Some(stderr) = child.stderr.take() {
        let flag = rate_limited_on_stderr.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if rate_limit::detect(&line) {
                    flag.store(true, Ordering::Relaxed);
                }
                tracing::debug!(target: "valet_runtime::agent_stderr", "{line}");
            }
        });
    }

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill().await;
            return RunStatus::SpawnFailed("agent stdout unavailable".to_string());
        }
    };
    let mut lines = BufReader::new(stdout).lines();

    let mut cancelled = false;
    let mut input_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                stdin = None;
                terminate(&mut child).await;
            }
            message = input_rx.recv(), if input_open && !cancelled => {
                match message {
                    Some(text) => {
                        let line = user_message_line(&text);
                        let write_failed = match stdin.as_mut() {
                            Some(writer) => match write_line(writer, &line).await {
                                Ok(()) => false,
                                Err(err) => {
                                    tracing::warn!(error = %err, "agent stdin write failed");
                                    true
                                }
                            },
                            None => {
                                tracing::warn!("dropping reply: agent input channel already closed");
                                false
                            }
                        };
                        if write_failed {
                            stdin = None;
                        }
                    }
                    None => input_open = false,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if handle_line(&line, events, collector) {
                            // Run summary seen: close stdin so the agent exits.
                            stdin = None;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
    drop(stdin);

    if rate_limited_on_stderr.load(Ordering::Relaxed) {
        collector.rate_limited = true;
    }

    let status = match tokio::time::timeout(KILL_GRACE.saturating_mul(4), child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return RunStatus::WaitFailed(format!("failed to wait for agent: {err}")),
        Err(_) => {
            let _ = child.kill().await;
            return RunStatus::WaitFailed("agent did not exit after stdout closed".to_string());
        }
    };

    if cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Exited(status)
    }
}

/// Feed one stdout line into the event stream. Returns `true` when the line
/// was the run summary.
fn handle_line(
    line: &str,
    events: &mpsc::UnboundedSender<AgentEvent>,
    collector: &mut Collector,
) -> bool {
    match parse_stream_line(line) {
        StreamLine::Init { model, .. } => {
            tracing::debug!(model = model.as_deref().unwrap_or("unknown"), "agent handshake");
            false
        }
        StreamLine::Text { text } => {
            collector.push_text(&text);
            let _ = events.send(AgentEvent::Text { text });
            false
        }
        StreamLine::Assistant { text, tool_uses } => {
            if !text.is_empty() {
                collector.push_text(&text);
                let _ = events.send(AgentEvent::Text { text });
            }
            for invocation in tool_uses {
                collector.push_tool(&invocation.tool);
                let _ = events.send(AgentEvent::ToolUse {
                    tool: invocation.tool,
                    input: invocation.input,
                });
            }
            false
        }
        StreamLine::ToolUse { tool, input } => {
            collector.push_tool(&tool);
            let _ = events.send(AgentEvent::ToolUse { tool, input });
            false
        }
        StreamLine::ToolResult { tool, output } => {
            let _ = events.send(AgentEvent::ToolResult { tool, output });
            false
        }
        StreamLine::Result { text, usage, is_error } => {
            collector.result_text = text;
            collector.usage = usage;
            if is_error {
                collector
                    .error_message
                    .get_or_insert_with(|| "agent reported an error result".to_string());
            }
            true
        }
        StreamLine::Error { message } => {
            if rate_limit::detect(&message) {
                collector.rate_limited = true;
            }
            collector.error_message = Some(message);
            false
        }
        // Unparseable line: still text, still forwarded.
        StreamLine::Raw(raw) => {
            tracing::debug!(
                code = ErrorKind::StreamParseAnomaly.as_code(),
                bytes = raw.len(),
                "agent stdout line was not structured JSON"
            );
            collector.push_text(&raw);
            let _ = events.send(AgentEvent::Text { text: raw });
            false
        }
    }
}

fn build_command(
    config: &RuntimeConfig,
    program: &PathBuf,
    model: Option<&str>,
    thinking: Option<&str>,
) -> Command {
    let mut command = Command::new(program);
    command
        .args([
            "--print",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ])
        .current_dir(&config.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(model) = model {
        command.arg("--model").arg(model);
    }
    if let Some(budget) = thinking_budget(thinking) {
        command.env("MAX_THINKING_TOKENS", budget.to_string());
    }
    command
}

fn thinking_budget(thinking: Option<&str>) -> Option<u32> {
    match thinking.map(|level| level.to_ascii_lowercase()) {
        Some(level) if level == "low" => Some(1024),
        Some(level) if level == "medium" => Some(4096),
        Some(level) if level == "high" => Some(16384),
        _ => None,
    }
}

fn user_message_line(text: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    })
    .to_string()
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}
