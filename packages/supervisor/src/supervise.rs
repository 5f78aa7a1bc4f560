//! The supervision loop: one task per execution that owns the runtime event
//! stream, enforces the path policy, runs the evaluation timer, and
//! guarantees exactly one terminal outcome regardless of which branch ends
//! the execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use valet_error::{ErrorKind, ValetError};
use valet_protocol::{AgentEvent, AgentResult, Decision, DecisionKind, DecisionRecord, DoneReason};
use valet_runtime::{ExecRequest, Runtime};

use crate::evaluator::{EvalContext, Evaluator, ToolCallRecord};
use crate::policy::{PathPolicy, ToolVerdict};
use crate::state::{Phase, PhaseTracker};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Cadence of the evaluation timer, independent of event arrival.
    pub eval_interval: Duration,
    /// Evaluation cycles before the execution is forcibly ended.
    pub max_turns: u64,
    /// Wall-clock bound on the whole execution.
    pub timeout: Duration,
    /// How much accumulated output the evaluator sees.
    pub output_tail_chars: usize,
    /// How many recent tool calls the evaluator sees.
    pub recent_tool_window: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(30),
            max_turns: 50,
            timeout: Duration::from_secs(600),
            output_tail_chars: 4000,
            recent_tool_window: 10,
        }
    }
}

/// Terminal outcome of a supervised execution. Exactly one is reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done {
        reason: DoneReason,
        result: AgentResult,
    },
    Error {
        message: String,
    },
}

/// Events the supervisor surfaces to the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Stream { text: String },
    ToolUse { tool: String, input: Value },
    ToolResult { tool: String, output: Value },
    SecurityViolation { tool: String, path: String },
    Escalation { reason: String, message: Option<String> },
    Decision { record: DecisionRecord },
    Finished { outcome: Outcome },
}

/// Cancel surface for one supervised execution. Idempotent.
#[derive(Debug, Clone)]
pub struct SupervisedHandle {
    cancel: CancellationToken,
}

impl SupervisedHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct SupervisedExecution {
    pub events: mpsc::UnboundedReceiver<SupervisorEvent>,
    pub handle: SupervisedHandle,
}

/// Wraps a [`Runtime`] with policy enforcement and periodic evaluation.
///
/// Explicitly constructed and passed by reference; no process-global
/// instance exists.
pub struct Supervisor {
    runtime: Runtime,
    evaluator: Arc<dyn Evaluator>,
    policy: PathPolicy,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        runtime: Runtime,
        evaluator: Arc<dyn Evaluator>,
        policy: PathPolicy,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            runtime,
            evaluator,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Start one supervised execution.
    pub fn supervise(&self, request: ExecRequest) -> SupervisedExecution {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = SupervisedHandle {
            cancel: cancel.clone(),
        };
        tokio::spawn(run_supervised(
            self.runtime.clone(),
            self.evaluator.clone(),
            self.policy.clone(),
            self.config.clone(),
            request,
            tx,
            cancel,
        ));
        SupervisedExecution { events: rx, handle }
    }
}

async fn run_supervised(
    runtime: Runtime,
    evaluator: Arc<dyn Evaluator>,
    policy: PathPolicy,
    config: SupervisorConfig,
    request: ExecRequest,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    cancel: CancellationToken,
) {
    let mut phases = PhaseTracker::new();
    phases.advance(Phase::Starting);

    let session_id = request.session_id.clone();
    let goal = request.prompt.clone();
    let execution = match runtime.execute(request) {
        Ok(execution) => execution,
        Err(err) => {
            phases.advance(Phase::Error);
            let _ = tx.send(SupervisorEvent::Finished {
                outcome: Outcome::Error {
                    message: err.to_string(),
                },
            });
            return;
        }
    };
    phases.advance(Phase::Running);
    let mut events = execution.events;
    let handle = execution.handle;

    let mut output = String::new();
    let mut tools_used: Vec<String> = Vec::new();
    let mut tool_log: Vec<ToolCallRecord> = Vec::new();
    // Tool names whose invocation was blocked; their results are swallowed
    // so the agent sees the call fail by absence.
    let mut pending_blocked: Vec<String> = Vec::new();
    let mut new_output = false;
    let mut turn_count: u64 = 0;
    let mut cancel_requested = false;

    let mut ticker = tokio::time::interval(config.eval_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // An interval's first tick is immediate; consume it so evaluation
    // starts one full interval in.
    ticker.tick().await;
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AgentEvent::Text { text }) => {
                    output.push_str(&text);
                    output.push('\n');
                    new_output = true;
                    let _ = tx.send(SupervisorEvent::Stream { text });
                }
                Some(AgentEvent::ToolUse { tool, input }) => {
                    match policy.evaluate_tool(&tool, &input) {
                        ToolVerdict::Allow => {
                            record_tool(&mut tool_log, &mut tools_used, &tool, &input);
                            let _ = tx.send(SupervisorEvent::ToolUse { tool, input });
                        }
                        ToolVerdict::Warn { fragment } => {
                            tracing::warn!(
                                %session_id,
                                %tool,
                                %fragment,
                                "shell command references a restricted path fragment"
                            );
                            record_tool(&mut tool_log, &mut tools_used, &tool, &input);
                            let _ = tx.send(SupervisorEvent::ToolUse { tool, input });
                        }
                        ToolVerdict::Block { path } => {
                            tracing::warn!(
                                %session_id,
                                %tool,
                                %path,
                                code = ErrorKind::SecurityViolation.as_code(),
                                "blocked file tool outside allow-list"
                            );
                            pending_blocked.push(tool.clone());
                            let _ = tx.send(SupervisorEvent::SecurityViolation { tool, path });
                        }
                    }
                }
                Some(AgentEvent::ToolResult { tool, output: result }) => {
                    if let Some(index) = pending_blocked.iter().position(|blocked| *blocked == tool) {
                        pending_blocked.remove(index);
                        // No result reaches the agent's subscribers for a
                        // blocked call.
                    } else {
                        let _ = tx.send(SupervisorEvent::ToolResult { tool, output: result });
                    }
                }
                Some(AgentEvent::Completed { result }) => {
                    let reason = if cancel_requested {
                        DoneReason::Cancelled
                    } else {
                        DoneReason::Completed
                    };
                    break Outcome::Done { reason, result };
                }
                Some(AgentEvent::Failed { message }) => {
                    if cancel_requested {
                        break Outcome::Done {
                            reason: DoneReason::Cancelled,
                            result: partial_result(&output, &tools_used),
                        };
                    }
                    break Outcome::Error { message };
                }
                None => {
                    break Outcome::Error {
                        message: "runtime stream closed without a terminal event".to_string(),
                    };
                }
            },
            _ = cancel.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                handle.cancel();
                // Keep draining events until the runtime's terminal arrives.
            }
            _ = ticker.tick() => {
                if cancel_requested || !new_output {
                    continue;
                }
                turn_count += 1;
                phases.advance(Phase::Evaluating);
                let context = EvalContext {
                    goal: goal.clone(),
                    output_tail: tail_chars(&output, config.output_tail_chars),
                    recent_tools: recent(&tool_log, config.recent_tool_window),
                    turn_count,
                };
                let decision = match evaluator.evaluate(&context).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        // Evaluator failures never abort the execution.
                        tracing::debug!(
                            %session_id,
                            error = %err,
                            code = ErrorKind::EvaluatorUnavailable.as_code(),
                            "evaluator failure; continuing"
                        );
                        Decision::default_continue(format!("evaluator unavailable: {err}"))
                    }
                };
                new_output = false;
                let record = DecisionRecord {
                    ts: Utc::now(),
                    turn_count,
                    decision: decision.clone(),
                };
                let _ = tx.send(SupervisorEvent::Decision { record });

                match decision.kind {
                    DecisionKind::Continue => {
                        phases.advance(Phase::Running);
                    }
                    DecisionKind::Reply | DecisionKind::Redirect => {
                        phases.advance(Phase::Responding);
                        let delivered = decision
                            .message
                            .as_deref()
                            .map(|message| handle.reply(message))
                            .unwrap_or(false);
                        if !delivered {
                            tracing::warn!(
                                %session_id,
                                "agent input channel unavailable; decision degraded to continue"
                            );
                        }
                        phases.advance(Phase::Running);
                    }
                    DecisionKind::Complete => {
                        // The evaluator declared the goal met: stop the
                        // runtime and report success with what we have.
                        phases.advance(Phase::Completing);
                        handle.cancel();
                        break Outcome::Done {
                            reason: DoneReason::Decision,
                            result: partial_result(&output, &tools_used),
                        };
                    }
                    DecisionKind::Escalate => {
                        let _ = tx.send(SupervisorEvent::Escalation {
                            reason: decision.reasoning.clone(),
                            message: decision.message.clone(),
                        });
                        phases.advance(Phase::Running);
                    }
                }

                if turn_count >= config.max_turns {
                    handle.cancel();
                    break Outcome::Done {
                        reason: DoneReason::MaxTurns,
                        result: partial_result(&output, &tools_used),
                    };
                }
            }
            _ = &mut deadline => {
                handle.cancel();
                break Outcome::Error {
                    message: ValetError::ExecutionTimeout {
                        limit_secs: config.timeout.as_secs(),
                    }
                    .to_string(),
                };
            }
        }
    };

    match outcome {
        Outcome::Error { .. } => {
            phases.advance(Phase::Error);
        }
        Outcome::Done { .. } => {
            phases.advance(Phase::Stopped);
        }
    }
    // Single resolution path: the one and only terminal emission.
    let _ = tx.send(SupervisorEvent::Finished { outcome });
}

fn record_tool(
    tool_log: &mut Vec<ToolCallRecord>,
    tools_used: &mut Vec<String>,
    tool: &str,
    input: &Value,
) {
    tool_log.push(ToolCallRecord {
        tool: tool.to_string(),
        input: input.clone(),
        ts: Utc::now(),
    });
    if !tools_used.iter().any(|seen| seen == tool) {
        tools_used.push(tool.to_string());
    }
}

fn partial_result(output: &str, tools_used: &[String]) -> AgentResult {
    AgentResult {
        text: output.to_string(),
        tools_used: tools_used.to_vec(),
        usage: None,
    }
}

fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}

fn recent(tool_log: &[ToolCallRecord], window: usize) -> Vec<ToolCallRecord> {
    let start = tool_log.len().saturating_sub(window);
    tool_log[start..].to_vec()
}
