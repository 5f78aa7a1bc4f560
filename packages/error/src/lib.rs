use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifiers for every failure class the control plane can log,
/// record in transcripts, or report to clients.
///
/// Recovered classes (`StreamParseAnomaly`, `EvaluatorUnavailable`,
/// `RateLimited`) and the side-channel `SecurityViolation` never become
/// error responses; their codes show up in logs and transcript events
/// instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailure,
    InvalidRequest,
    SessionNotFound,
    SessionBusy,
    SpawnFailure,
    StreamParseAnomaly,
    ExecutionTimeout,
    SecurityViolation,
    EvaluatorUnavailable,
    RateLimited,
    Io,
}

impl ErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failure",
            Self::InvalidRequest => "invalid_request",
            Self::SessionNotFound => "session_not_found",
            Self::SessionBusy => "session_busy",
            Self::SpawnFailure => "spawn_failure",
            Self::StreamParseAnomaly => "stream_parse_anomaly",
            Self::ExecutionTimeout => "execution_timeout",
            Self::SecurityViolation => "security_violation",
            Self::EvaluatorUnavailable => "evaluator_unavailable",
            Self::RateLimited => "rate_limited",
            Self::Io => "io",
        }
    }

    /// Whether this failure class is ever surfaced to a client directly.
    pub fn client_visible(&self) -> bool {
        !matches!(
            self,
            Self::StreamParseAnomaly | Self::EvaluatorUnavailable | Self::SecurityViolation
        )
    }
}

/// Errors the control plane hands back to callers.
#[derive(Debug, Error)]
pub enum ValetError {
    #[error("authentication failed: {reason}")]
    AuthFailure { reason: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} already has an active execution")]
    SessionBusy { session_id: String },

    #[error("failed to spawn agent process `{command}`: {message}")]
    SpawnFailure { command: String, message: String },

    #[error("execution exceeded {limit_secs}s wall-clock limit")]
    ExecutionTimeout { limit_secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ValetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthFailure { .. } => ErrorKind::AuthFailure,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            Self::SessionBusy { .. } => ErrorKind::SessionBusy,
            Self::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}
