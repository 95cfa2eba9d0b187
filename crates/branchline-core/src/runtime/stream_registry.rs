//! Registry of in-flight streams, one per conversation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ActiveStream, StreamKind, StreamStatus};

struct SessionEntry {
    kind: StreamKind,
    task_id: String,
    title: Option<String>,
    started_at: i64,
    started: Instant,
    cancel: Option<CancellationToken>,
}

/// Proof of a started stream, held by the task consuming it.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    conversation_id: String,
    task_id: String,
    cancel: Option<CancellationToken>,
}

impl StreamHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Cancellation signal, present for cancelable streams only.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Process-wide stream session state.
pub struct StreamSessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl StreamSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stream, replacing any session already held for `id`.
    ///
    /// A replaced session is not cancelled; its holder finds out through
    /// [`Self::end_if_current`].
    pub fn start(&self, id: &str, kind: StreamKind, title: Option<String>) -> StreamHandle {
        let cancel = (kind == StreamKind::Cancelable).then(CancellationToken::new);
        let task_id = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            kind,
            task_id: task_id.clone(),
            title,
            started_at: chrono::Utc::now().timestamp_millis(),
            started: Instant::now(),
            cancel: cancel.clone(),
        };

        if let Some(previous) = self.sessions.lock().insert(id.to_string(), entry) {
            info!(conversation_id = id, superseded = %previous.task_id, "Replaced active stream");
        }
        debug!(conversation_id = id, task_id = %task_id, ?kind, "Stream started");

        StreamHandle {
            conversation_id: id.to_string(),
            task_id,
            cancel,
        }
    }

    /// Unregister the session for `id`; false if none was active.
    pub fn end(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    /// Unregister only if `handle` still owns the session.
    pub fn end_if_current(&self, handle: &StreamHandle) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&handle.conversation_id) {
            Some(entry) if entry.task_id == handle.task_id => {
                sessions.remove(&handle.conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, handle: &StreamHandle) -> bool {
        self.sessions
            .lock()
            .get(&handle.conversation_id)
            .is_some_and(|entry| entry.task_id == handle.task_id)
    }

    /// Signal a cancelable stream to stop.
    pub fn stop(&self, id: &str) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(id).and_then(|entry| entry.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                info!(conversation_id = id, "Stop requested");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> StreamStatus {
        match self.sessions.lock().get(id) {
            Some(entry) => StreamStatus {
                streaming: true,
                kind: Some(entry.kind),
                stoppable: entry.kind == StreamKind::Cancelable,
            },
            None => StreamStatus::IDLE,
        }
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Cancelable sessions, oldest first.
    pub fn list_active(&self) -> Vec<ActiveStream> {
        let mut active: Vec<ActiveStream> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.kind == StreamKind::Cancelable)
            .map(|(id, entry)| ActiveStream {
                conversation_id: id.clone(),
                task_id: entry.task_id.clone(),
                title: entry.title.clone(),
                started_at: entry.started_at,
                elapsed_seconds: entry.started.elapsed().as_secs(),
            })
            .collect();
        active.sort_by_key(|stream| stream.started_at);
        active
    }
}

impl Default for StreamSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
