//! Wire schema shared by the valet control plane, runtime, and supervisor.
//!
//! Everything that crosses a process or component boundary is defined here:
//! the client/server control-plane messages, the normalized agent event
//! stream, the tagged representation of agent-CLI stdout lines, evaluator
//! decisions, and transcript entries.

mod decision;
mod events;
mod messages;
mod stream;
mod transcript;

pub use decision::{
    parse_decision, text_signals_completion, Decision, DecisionKind, DecisionRecord,
};
pub use events::{AgentEvent, AgentResult, DoneReason, PendingAction, Usage};
pub use messages::{ClientInfo, ClientMessage, ServerMessage, StatusSnapshot};
pub use stream::{parse_stream_line, StreamLine, ToolInvocation};
pub use transcript::{Role, SessionMeta, SessionStatus, TranscriptEntry};
