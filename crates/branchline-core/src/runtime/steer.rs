use parking_lot::Mutex;
use std::collections::HashMap;

use crate::models::ContentBlock;

/// Guidance for the next stream on a conversation, with what the interrupted
/// stream had produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SteerContext {
    pub guidance: String,
    pub partial_content: Vec<ContentBlock>,
    pub created_at: i64,
}

/// Steer contexts keyed by conversation id.
/// Entries outlive the stream they interrupted and are consumed by the next one.
pub struct SteerChannel {
    contexts: Mutex<HashMap<String, SteerContext>>,
}

impl SteerChannel {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, id: &str, guidance: impl Into<String>, partial_content: Vec<ContentBlock>) {
        self.contexts.lock().insert(
            id.to_string(),
            SteerContext {
                guidance: guidance.into(),
                partial_content,
                created_at: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<SteerContext> {
        self.contexts.lock().get(id).cloned()
    }

    pub fn clear(&self, id: &str) -> bool {
        self.contexts.lock().remove(id).is_some()
    }

    /// Get and clear in one step.
    pub fn take(&self, id: &str) -> Option<SteerContext> {
        self.contexts.lock().remove(id)
    }

    pub fn has_pending(&self, id: &str) -> bool {
        self.contexts.lock().contains_key(id)
    }

    /// Record the partial output of the stream a pending steer interrupted.
    /// Returns false when no steer is pending.
    pub fn attach_partial(&self, id: &str, partial_content: Vec<ContentBlock>) -> bool {
        match self.contexts.lock().get_mut(id) {
            Some(context) => {
                context.partial_content = partial_content;
                true
            }
            None => false,
        }
    }
}

impl Default for SteerChannel {
    fn default() -> Self {
        Self::new()
    }
}
