//! Append-only per-session transcript storage.
//!
//! One JSONL file per session, named by session id. Appends never rewrite
//! existing bytes, so a crash can only lose the final partial line and
//! replay is a straight top-to-bottom read.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use valet_protocol::{SessionMeta, SessionStatus, TranscriptEntry};

const TRANSCRIPT_EXT: &str = "jsonl";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("invalid session id: {session_id}")]
    InvalidSessionId { session_id: String },
    #[error("failed to serialize transcript entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TranscriptError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one entry to a session's transcript.
    ///
    /// Disk failures surface as `Err` so the caller can emit a
    /// write-failure signal; they must not take the writer down.
    pub fn append(
        &self,
        session_id: &str,
        entry: &TranscriptEntry,
    ) -> Result<(), TranscriptError> {
        let path = self.path_for(session_id)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replay a session's entries in append order.
    ///
    /// Lines that fail to parse (a torn final write, manual edits) are
    /// skipped with a warning rather than failing the whole replay.
    pub fn read(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, TranscriptError> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Err(TranscriptError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no transcript for session {session_id}"),
            )));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        session_id,
                        line_number = index + 1,
                        error = %err,
                        "skipping unparseable transcript line"
                    );
                }
            }
        }
        Ok(entries)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.path_for(session_id)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Metadata for one session, derived from its transcript file.
    pub fn meta(&self, session_id: &str) -> Result<Option<SessionMeta>, TranscriptError> {
        if !self.exists(session_id) {
            return Ok(None);
        }
        let entries = self.read(session_id)?;
        Ok(derive_meta(session_id, &entries))
    }

    /// Enumerate all sessions, most recently active first.
    pub fn list(&self) -> Result<Vec<SessionMeta>, TranscriptError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXT) {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let session_id = session_id.to_string();
            match self.read(&session_id) {
                Ok(entries) => {
                    if let Some(meta) = derive_meta(&session_id, &entries) {
                        sessions.push(meta);
                    }
                }
                Err(err) => {
                    tracing::warn!(%session_id, error = %err, "failed to read transcript");
                }
            }
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, TranscriptError> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(TranscriptError::InvalidSessionId {
                session_id: session_id.to_string(),
            });
        }
        Ok(self.dir.join(format!("{session_id}.{TRANSCRIPT_EXT}")))
    }
}

fn derive_meta(session_id: &str, entries: &[TranscriptEntry]) -> Option<SessionMeta> {
    let first = entries.first()?;
    let last = entries.last()?;
    let model = entries.iter().find_map(|entry| match entry {
        TranscriptEntry::Message {
            meta: Some(meta), ..
        } => meta
            .get("model")
            .and_then(|model| model.as_str())
            .map(|model| model.to_string()),
        _ => None,
    });
    Some(SessionMeta {
        id: session_id.to_string(),
        created_at: first.ts(),
        last_activity: last.ts(),
        message_count: entries.iter().filter(|entry| entry.is_message()).count(),
        model,
        status: SessionStatus::Idle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use valet_protocol::Role;

    fn store() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TranscriptStore::new(dir.path().join("transcripts")).expect("store");
        (dir, store)
    }

    #[test]
    fn append_then_read_preserves_order() {
        let (_dir, store) = store();
        let entries = vec![
            TranscriptEntry::message(Role::User, "first"),
            TranscriptEntry::event("agent.tool_use", json!({"tool": "bash"})),
            TranscriptEntry::message(Role::Assistant, "second"),
        ];
        for entry in &entries {
            store.append("sess_1", entry).expect("append");
        }
        let replayed = store.read("sess_1").expect("read");
        assert_eq!(replayed, entries);
    }

    #[test]
    fn unparseable_lines_are_skipped_not_fatal() {
        let (_dir, store) = store();
        store
            .append("sess_2", &TranscriptEntry::message(Role::User, "ok"))
            .expect("append");
        let path = store.dir().join("sess_2.jsonl");
        let mut file = OpenOptions::new().append(true).open(path).expect("open");
        file.write_all(b"{\"type\":\"message\",\"role\":\n").expect("write");
        file.write_all(
            serde_json::to_string(&TranscriptEntry::message(Role::Assistant, "after"))
                .expect("json")
                .as_bytes(),
        )
        .expect("write");
        file.write_all(b"\n").expect("write");

        let entries = store.read("sess_2").expect("read");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn list_derives_metadata() {
        let (_dir, store) = store();
        store
            .append("alpha", &TranscriptEntry::message(Role::User, "one"))
            .expect("append");
        store
            .append("alpha", &TranscriptEntry::message(Role::Assistant, "two"))
            .expect("append");
        store
            .append("beta", &TranscriptEntry::event("agent.done", json!({})))
            .expect("append");

        let sessions = store.list().expect("list");
        assert_eq!(sessions.len(), 2);
        let alpha = sessions
            .iter()
            .find(|meta| meta.id == "alpha")
            .expect("alpha");
        assert_eq!(alpha.message_count, 2);
        assert!(alpha.created_at <= alpha.last_activity);
        let beta = sessions.iter().find(|meta| meta.id == "beta").expect("beta");
        assert_eq!(beta.message_count, 0);
    }

    #[test]
    fn traversal_session_ids_are_rejected() {
        let (_dir, store) = store();
        let err = store
            .append("../escape", &TranscriptEntry::message(Role::User, "no"))
            .expect_err("must reject");
        assert!(matches!(err, TranscriptError::InvalidSessionId { .. }));
    }

    #[test]
    fn missing_session_is_an_error_but_store_survives() {
        let (_dir, store) = store();
        assert!(store.read("absent").is_err());
        store
            .append("present", &TranscriptEntry::message(Role::User, "hi"))
            .expect("append still works");
    }
}
