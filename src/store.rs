//! Durable session store: metadata rows plus append-only event logs.
//!
//! Layout under `<workspace>/.ralph/`:
//!
//! ```text
//! sessions.db/
//!   store.lock                  # exclusive ownership (one process)
//!   sessions/<sessionId>.json   # metadata row
//!   events/<sessionId>.jsonl    # append-only envelope log
//! sessions/<instanceId>.json    # per-instance latest session snapshot
//! ```
//!
//! Every append is flushed to disk before it is acknowledged; the assigned
//! `eventIndex` is the replay cursor. Appends are serialised per session;
//! range scans read a point-in-time snapshot without holding any lock.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{EventEnvelope, SessionStatus, now_ms};
use crate::paths;

/// Sessions with fewer events than this and no bound task are evicted as
/// startup noise at completion time.
pub const NOISE_EVENT_THRESHOLD: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
    #[error("another process owns the session store at {0}")]
    Locked(PathBuf),
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Persisted session metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    pub adapter_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub created_at: u64,
    pub last_message_at: u64,
    pub status: SessionStatus,
    pub cwd: String,
    #[serde(default)]
    pub allowed_toolset: Vec<String>,
    pub event_count: u64,
    pub last_event_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, adapter_kind: impl Into<String>, cwd: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.into(),
            worker_name: None,
            task_id: None,
            task_title: None,
            adapter_kind: adapter_kind.into(),
            workspace_id: None,
            created_at: now,
            last_message_at: now,
            status: SessionStatus::Idle,
            cwd: cwd.into(),
            allowed_toolset: Vec::new(),
            event_count: 0,
            last_event_sequence: 0,
            completed_at: None,
        }
    }
}

/// The store. One instance per process; the lock file enforces that.
pub struct SessionStore {
    workspace: PathBuf,
    db: PathBuf,
    _lock: File,
    sessions: Mutex<HashMap<String, SessionMeta>>,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open (or create) the store under `<workspace>/.ralph/sessions.db/`.
    pub fn open(workspace: &Path) -> Result<Self, StoreError> {
        let db = paths::sessions_db_dir(workspace);
        fs::create_dir_all(db.join("sessions"))?;
        fs::create_dir_all(db.join("events"))?;
        fs::create_dir_all(paths::state_dir(workspace).join("sessions"))?;

        let lock_path = db.join("store.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(db));
        }

        let mut sessions = HashMap::new();
        for entry in fs::read_dir(db.join("sessions"))? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<SessionMeta>(&content) {
                Ok(meta) => {
                    sessions.insert(meta.session_id.clone(), meta);
                }
                Err(e) => {
                    return Err(StoreError::Corrupt(format!(
                        "{}: {e}",
                        path.display()
                    )));
                }
            }
        }

        Ok(Self {
            workspace: workspace.to_path_buf(),
            db,
            _lock: lock,
            sessions: Mutex::new(sessions),
            append_locks: Mutex::new(HashMap::new()),
        })
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.db.join("sessions").join(format!("{session_id}.json"))
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.db.join("events").join(format!("{session_id}.jsonl"))
    }

    fn append_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.append_locks
                .lock()
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    fn write_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let json = serde_json::to_string(meta)
            .map_err(|e| StoreError::Corrupt(format!("serialize session meta: {e}")))?;
        fs::write(self.meta_path(&meta.session_id), json)?;
        Ok(())
    }

    /// Create or overwrite a session row.
    pub fn save_session(&self, meta: SessionMeta) -> Result<(), StoreError> {
        self.write_meta(&meta)?;
        self.sessions.lock().insert(meta.session_id.clone(), meta);
        Ok(())
    }

    /// Metadata only; events are loaded separately via range scans.
    pub fn get_session(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Append one envelope, assigning the next `eventIndex` for the session.
    ///
    /// Atomic within one session: the log line is flushed before the
    /// metadata row (`eventCount`, `lastMessageAt`, `lastEventSequence`) is
    /// updated and the index acknowledged.
    pub fn append_event(
        &self,
        session_id: &str,
        envelope: EventEnvelope,
    ) -> Result<u64, StoreError> {
        let lock = self.append_lock(session_id);
        let _guard = lock.lock();

        let mut meta = self
            .get_session(session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;

        let index = meta.last_event_sequence + 1;
        let mut envelope = envelope;
        envelope.event_index = Some(index);

        let line = serde_json::to_string(&envelope)
            .map_err(|e| StoreError::Corrupt(format!("serialize envelope: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(session_id))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        meta.last_event_sequence = index;
        meta.event_count += 1;
        meta.last_message_at = envelope.timestamp.max(meta.last_message_at);
        self.write_meta(&meta)?;
        self.sessions.lock().insert(meta.session_id.clone(), meta);

        Ok(index)
    }

    /// Update the live status on a session row.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let lock = self.append_lock(session_id);
        let _guard = lock.lock();
        let mut meta = self
            .get_session(session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        meta.status = status;
        if status.is_terminal() && meta.completed_at.is_none() {
            meta.completed_at = Some(now_ms());
        }
        self.write_meta(&meta)?;
        self.sessions.lock().insert(meta.session_id.clone(), meta);
        Ok(())
    }

    /// Envelopes with `eventIndex > after_index`, in index order.
    pub fn events_since(
        &self,
        session_id: &str,
        after_index: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.scan_events(session_id, |e| e.event_index.is_some_and(|i| i > after_index))
    }

    /// Envelopes strictly newer than the supplied timestamp (fallback cursor
    /// for clients that only tracked time).
    pub fn events_since_timestamp(
        &self,
        session_id: &str,
        after_ms: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.scan_events(session_id, |e| e.timestamp > after_ms)
    }

    fn scan_events(
        &self,
        session_id: &str,
        mut keep: impl FnMut(&EventEnvelope) -> bool,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let path = self.events_path(session_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let envelope: EventEnvelope = serde_json::from_str(line)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
            if keep(&envelope) {
                events.push(envelope);
            }
        }
        Ok(events)
    }

    /// Sessions ordered by `lastMessageAt` descending, optionally filtered
    /// to one workspace.
    pub fn list_sessions(&self, workspace_id: Option<&str>) -> Vec<SessionMeta> {
        let mut sessions: Vec<SessionMeta> = self
            .sessions
            .lock()
            .values()
            .filter(|m| workspace_id.is_none_or(|w| m.workspace_id.as_deref() == Some(w)))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        sessions
    }

    /// Range-delete the session's events and remove its metadata.
    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let lock = self.append_lock(session_id);
        let _guard = lock.lock();
        match fs::remove_file(self.events_path(session_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.meta_path(session_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    /// Evict startup noise: sessions with fewer than three events and no
    /// bound task. Returns how many were deleted.
    pub fn filter_noise(&self) -> Result<usize, StoreError> {
        let noisy: Vec<String> = self
            .sessions
            .lock()
            .values()
            .filter(|m| m.event_count < NOISE_EVENT_THRESHOLD && m.task_id.is_none())
            .map(|m| m.session_id.clone())
            .collect();
        for session_id in &noisy {
            self.delete_session(session_id)?;
        }
        Ok(noisy.len())
    }

    /// Write the per-instance latest-session snapshot
    /// (`.ralph/sessions/<instanceId>.json`).
    pub fn save_snapshot(&self, instance_id: &str, meta: &SessionMeta) -> Result<(), StoreError> {
        let path = paths::session_snapshot_path(&self.workspace, instance_id);
        let json = serde_json::to_string(meta)
            .map_err(|e| StoreError::Corrupt(format!("serialize snapshot: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Resolve an instance id to its latest session id. Falls back to
    /// treating the instance id as a session id directly.
    pub fn resolve_instance(&self, instance_id: &str) -> Option<String> {
        let path = paths::session_snapshot_path(&self.workspace, instance_id);
        if let Ok(content) = fs::read_to_string(&path)
            && let Ok(meta) = serde_json::from_str::<SessionMeta>(&content)
        {
            return Some(meta.session_id);
        }
        self.has_session(instance_id)
            .then(|| instance_id.to_string())
    }
}
