//! Session service: the bridge between the control-plane server and the
//! supervised runtime.
//!
//! Owns the transcript store and the session-id → active-execution map.
//! The map is the one structure touched by several actors (new requests,
//! cancels, evaluator decisions, natural completion); all mutation goes
//! through its mutex, so two actors can never start or finish the same
//! session's execution concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, Mutex};

use valet_error::ValetError;
use valet_protocol::{
    DoneReason, PendingAction, Role, ServerMessage, SessionMeta, SessionStatus, TranscriptEntry,
};
use valet_runtime::ExecRequest;
use valet_supervisor::{Outcome, SupervisedHandle, Supervisor, SupervisorEvent};
use valet_transcript::{TranscriptError, TranscriptStore};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One session-scoped message destined for that session's subscribers.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub message: ServerMessage,
}

pub struct SessionService {
    store: TranscriptStore,
    supervisor: Supervisor,
    active: Mutex<HashMap<String, SupervisedHandle>>,
    /// Escalations parked for explicit approval, keyed by session id.
    pending_actions: Mutex<HashMap<String, Vec<PendingAction>>>,
    session_counter: AtomicU64,
    action_counter: AtomicU64,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionService {
    pub fn new(store: TranscriptStore, supervisor: Supervisor) -> Arc<Self> {
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let existing = store.list().map(|sessions| sessions.len()).unwrap_or(0);
        Arc::new(Self {
            store,
            supervisor,
            active: Mutex::new(HashMap::new()),
            pending_actions: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(existing as u64),
            action_counter: AtomicU64::new(0),
            events_tx,
        })
    }

    /// Subscribe to the stream of session-scoped server messages.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Mint a session id no transcript uses yet.
    pub fn mint_session_id(&self) -> String {
        loop {
            let id = format!(
                "sess_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            if !self.store.exists(&id) {
                return id;
            }
        }
    }

    /// Start a supervised execution for `session_id`.
    ///
    /// At most one execution may be in flight per session; a busy session
    /// is rejected rather than silently doubling up.
    pub async fn request(
        self: &Arc<Self>,
        session_id: String,
        message: String,
        model: Option<String>,
        thinking: Option<String>,
    ) -> Result<(), ValetError> {
        let mut active = self.active.lock().await;
        if active.contains_key(&session_id) {
            return Err(ValetError::SessionBusy { session_id });
        }

        let mut entry_meta = serde_json::Map::new();
        if let Some(model) = &model {
            entry_meta.insert("model".to_string(), json!(model));
        }
        let entry = TranscriptEntry::Message {
            role: Role::User,
            content: message.clone(),
            meta: (!entry_meta.is_empty()).then(|| serde_json::Value::Object(entry_meta)),
            ts: chrono::Utc::now(),
        };
        self.store
            .append(&session_id, &entry)
            .map_err(|err| match err {
                TranscriptError::InvalidSessionId { session_id } => ValetError::InvalidRequest {
                    message: format!("invalid session id: {session_id}"),
                },
                TranscriptError::Io(err) => ValetError::Io(err),
                other => ValetError::InvalidRequest {
                    message: format!("transcript write failed: {other}"),
                },
            })?;

        let supervised = self.supervisor.supervise(ExecRequest {
            session_id: session_id.clone(),
            prompt: message,
            model,
            thinking,
        });
        active.insert(session_id.clone(), supervised.handle.clone());
        drop(active);

        let service = self.clone();
        tokio::spawn(service.pump(session_id, supervised.events));
        Ok(())
    }

    /// Cancel a session's active execution. A session with nothing in
    /// flight is a no-op and reports `false`; no event is emitted for it.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(session_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight; used on control-plane shutdown.
    pub async fn cancel_all(&self) {
        let active = self.active.lock().await;
        for handle in active.values() {
            handle.cancel();
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn list(&self) -> Vec<SessionMeta> {
        let mut sessions = self.store.list().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "session listing failed");
            Vec::new()
        });
        let active = self.active.lock().await;
        for session in &mut sessions {
            if active.contains_key(&session.id) {
                session.status = SessionStatus::Active;
            }
        }
        sessions
    }

    pub async fn meta(&self, session_id: &str) -> Option<SessionMeta> {
        let mut meta = self.store.meta(session_id).ok().flatten()?;
        if self.active.lock().await.contains_key(session_id) {
            meta.status = SessionStatus::Active;
        }
        Some(meta)
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    /// Actions awaiting approval for a session.
    pub async fn pending_actions(&self, session_id: &str) -> Vec<PendingAction> {
        self.pending_actions
            .lock()
            .await
            .get(session_id)
            .map(|actions| {
                actions
                    .iter()
                    .filter(|action| action.is_pending())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Approve or reject a parked action. Resolution is recorded in the
    /// transcript; resolving an unknown or already-settled action reports
    /// `false`.
    pub async fn resolve_action(
        &self,
        session_id: &str,
        action_id: &str,
        approved: bool,
    ) -> bool {
        let mut pending = self.pending_actions.lock().await;
        let Some(actions) = pending.get_mut(session_id) else {
            return false;
        };
        let Some(action) = actions
            .iter_mut()
            .find(|action| action.id == action_id && action.is_pending())
        else {
            return false;
        };
        action.approved = Some(approved);
        let resolved = action.clone();
        drop(pending);
        self.record(
            session_id,
            &TranscriptEntry::event(
                "action.resolved",
                serde_json::to_value(&resolved).unwrap_or_default(),
            ),
        );
        true
    }

    async fn park_action(&self, session_id: &str, description: &str) -> PendingAction {
        let action = PendingAction {
            id: format!(
                "act_{}",
                self.action_counter.fetch_add(1, Ordering::SeqCst) + 1
            ),
            action_type: "escalation".to_string(),
            description: description.to_string(),
            approved: None,
        };
        self.pending_actions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(action.clone());
        action
    }

    fn publish(&self, session_id: &str, message: ServerMessage) {
        let _ = self.events_tx.send(SessionEvent {
            session_id: session_id.to_string(),
            message,
        });
    }

    /// A transcript append that must not take the event pump down: the
    /// failure is surfaced in the log and the stream keeps flowing.
    fn record(&self, session_id: &str, entry: &TranscriptEntry) {
        if let Err(err) = self.store.append(session_id, entry) {
            tracing::error!(session_id, error = %err, "transcript append failed");
        }
    }

    /// Consume one supervised execution's events: transcript first, then
    /// fan-out, preserving per-session order end to end.
    async fn pump(
        self: Arc<Self>,
        session_id: String,
        mut events: tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SupervisorEvent::Stream { text } => {
                    self.publish(
                        &session_id,
                        ServerMessage::AgentStream {
                            session_id: session_id.clone(),
                            text,
                        },
                    );
                }
                SupervisorEvent::ToolUse { tool, input } => {
                    self.record(
                        &session_id,
                        &TranscriptEntry::event(
                            "agent.tool_use",
                            json!({ "tool": &tool, "input": &input }),
                        ),
                    );
                    self.publish(
                        &session_id,
                        ServerMessage::AgentToolUse {
                            session_id: session_id.clone(),
                            tool,
                            input,
                        },
                    );
                }
                SupervisorEvent::ToolResult { tool, output } => {
                    self.record(
                        &session_id,
                        &TranscriptEntry::event(
                            "agent.tool_result",
                            json!({ "tool": &tool, "output": &output }),
                        ),
                    );
                    self.publish(
                        &session_id,
                        ServerMessage::AgentToolResult {
                            session_id: session_id.clone(),
                            tool,
                            output,
                        },
                    );
                }
                SupervisorEvent::SecurityViolation { tool, path } => {
                    self.record(
                        &session_id,
                        &TranscriptEntry::event(
                            "security.violation",
                            json!({ "tool": &tool, "path": &path }),
                        ),
                    );
                    self.publish(
                        &session_id,
                        ServerMessage::SecurityViolation {
                            session_id: session_id.clone(),
                            tool,
                            path,
                        },
                    );
                }
                SupervisorEvent::Escalation { reason, message } => {
                    let action = self.park_action(&session_id, &reason).await;
                    self.record(
                        &session_id,
                        &TranscriptEntry::event(
                            "agent.escalation",
                            json!({ "reason": &reason, "message": &message, "actionId": action.id }),
                        ),
                    );
                    self.publish(
                        &session_id,
                        ServerMessage::AgentEscalation {
                            session_id: session_id.clone(),
                            reason,
                            message,
                        },
                    );
                }
                SupervisorEvent::Decision { record } => {
                    // Audit-only: decisions go to the transcript, not to
                    // clients.
                    self.record(
                        &session_id,
                        &TranscriptEntry::event(
                            "supervisor.decision",
                            serde_json::to_value(&record).unwrap_or_default(),
                        ),
                    );
                }
                SupervisorEvent::Finished { outcome } => {
                    self.active.lock().await.remove(&session_id);
                    match outcome {
                        Outcome::Done { reason, result } => {
                            if !result.text.is_empty() {
                                self.record(
                                    &session_id,
                                    &TranscriptEntry::message(Role::Assistant, &result.text),
                                );
                            }
                            self.record(
                                &session_id,
                                &TranscriptEntry::event(
                                    "agent.done",
                                    json!({
                                        "reason": reason,
                                        "toolsUsed": &result.tools_used,
                                    }),
                                ),
                            );
                            self.publish(
                                &session_id,
                                ServerMessage::AgentDone {
                                    session_id: session_id.clone(),
                                    reason,
                                    result: Some(result),
                                },
                            );
                        }
                        Outcome::Error { message } => {
                            self.record(
                                &session_id,
                                &TranscriptEntry::event(
                                    "agent.error",
                                    json!({ "message": &message }),
                                ),
                            );
                            self.publish(
                                &session_id,
                                ServerMessage::AgentError {
                                    session_id: session_id.clone(),
                                    message,
                                },
                            );
                        }
                    }
                    break;
                }
            }
        }
        tracing::debug!(%session_id, "session event pump finished");
    }
}
