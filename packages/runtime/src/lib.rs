//! Agent execution backends.
//!
//! A request is served by the in-process API backend when an Anthropic API
//! key is configured, otherwise by spawning the external agent CLI. Both
//! normalize to the same [`AgentEvent`] stream and emit exactly one terminal
//! event per execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use valet_protocol::AgentEvent;

mod api;
mod cli;
pub mod rate_limit;

pub use cli::DEFAULT_AGENT_BIN;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Neither execution backend can run: no API key and no agent binary.
    /// This is the distinct "dependency unavailable" class, not an error
    /// from a running agent.
    #[error("no execution backend available: {message}")]
    BackendUnavailable { message: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runtime-level configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Explicit agent CLI path; falls back to a `PATH` lookup.
    pub agent_bin: Option<PathBuf>,
    /// Anthropic API key; presence selects the in-process backend.
    pub api_key: Option<String>,
    pub api_base: String,
    pub default_model: String,
    /// Working directory agent subprocesses run in.
    pub workdir: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env(workdir: PathBuf) -> Self {
        Self {
            agent_bin: std::env::var("VALET_AGENT_BIN").ok().map(PathBuf::from),
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            api_base: std::env::var("VALET_API_BASE")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            default_model: std::env::var("VALET_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
            workdir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub session_id: String,
    pub prompt: String,
    pub model: Option<String>,
    /// Reasoning-effort hint passed through to the backend.
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Api,
    Cli,
}

/// Shared control surface for one execution.
///
/// `cancel` is idempotent: the token latches, and calling it after the
/// execution finished is a no-op.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
    input: Option<mpsc::UnboundedSender<String>>,
    backend: BackendKind,
}

impl ExecutionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Write a message into the running agent's input channel.
    ///
    /// Returns `false` when no channel exists (API backend) or the agent
    /// already exited; the caller downgrades its decision accordingly.
    pub fn reply(&self, message: &str) -> bool {
        match &self.input {
            Some(sender) => sender.send(message.to_string()).is_ok(),
            None => false,
        }
    }
}

/// One in-flight execution: the normalized event stream plus its handle.
#[derive(Debug)]
pub struct Execution {
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
    pub handle: ExecutionHandle,
}

#[derive(Debug, Clone)]
pub struct Runtime {
    config: Arc<RuntimeConfig>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start an execution, preferring the in-process API backend.
    ///
    /// Returns [`RuntimeError::BackendUnavailable`] only when neither
    /// backend can run at all; failures after a backend starts arrive as a
    /// terminal `Failed` event on the stream instead.
    pub fn execute(&self, request: ExecRequest) -> Result<Execution, RuntimeError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        if self.config.api_key.is_some() {
            tracing::debug!(session_id = %request.session_id, "executing via api backend");
            let handle = ExecutionHandle {
                cancel: cancel.clone(),
                input: None,
                backend: BackendKind::Api,
            };
            tokio::spawn(api::run(
                self.config.clone(),
                request,
                events_tx,
                cancel,
            ));
            return Ok(Execution {
                events: events_rx,
                handle,
            });
        }

        let program = self.resolve_agent_bin()?;
        tracing::debug!(
            session_id = %request.session_id,
            program = %program.display(),
            "executing via cli backend"
        );
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let handle = ExecutionHandle {
            cancel: cancel.clone(),
            input: Some(input_tx),
            backend: BackendKind::Cli,
        };
        tokio::spawn(cli::run(
            self.config.clone(),
            program,
            request,
            events_tx,
            input_rx,
            cancel,
        ));
        Ok(Execution {
            events: events_rx,
            handle,
        })
    }

    fn resolve_agent_bin(&self) -> Result<PathBuf, RuntimeError> {
        if let Some(bin) = &self.config.agent_bin {
            if bin.exists() {
                return Ok(bin.clone());
            }
            return Err(RuntimeError::BackendUnavailable {
                message: format!("configured agent binary not found: {}", bin.display()),
            });
        }
        find_in_path(DEFAULT_AGENT_BIN).ok_or_else(|| RuntimeError::BackendUnavailable {
            message: format!(
                "no API key configured and `{DEFAULT_AGENT_BIN}` not found in PATH"
            ),
        })
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_backends() -> RuntimeConfig {
        RuntimeConfig {
            agent_bin: Some(PathBuf::from("/nonexistent/agent-bin")),
            api_key: None,
            api_base: "https://api.anthropic.com".into(),
            default_model: "claude-sonnet-4-5".into(),
            workdir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn missing_backends_are_a_distinct_failure_class() {
        let runtime = Runtime::new(config_without_backends());
        let err = runtime
            .execute(ExecRequest {
                session_id: "sess_1".into(),
                prompt: "hi".into(),
                model: None,
                thinking: None,
            })
            .expect_err("no backend should be available");
        assert!(matches!(err, RuntimeError::BackendUnavailable { .. }));
    }

    #[test]
    fn handle_without_input_channel_rejects_reply() {
        let handle = ExecutionHandle {
            cancel: CancellationToken::new(),
            input: None,
            backend: BackendKind::Api,
        };
        assert!(!handle.reply("anything"));
    }

    #[test]
    fn cancel_is_idempotent() {
        let handle = ExecutionHandle {
            cancel: CancellationToken::new(),
            input: None,
            backend: BackendKind::Api,
        };
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
