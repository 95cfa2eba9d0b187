//! Conversation stores.
//!
//! [`ConversationStore`] is implemented by two interchangeable backends:
//!
//! - [`FileConversationStore`] keeps one physical record per branch address.
//! - [`TableConversationStore`] keeps one row per message version, linked to
//!   its predecessor by `parent_message_id`, and resolves branches by walking
//!   those links.
//!
//! Both report identical observable behavior for every operation below.

pub mod file_store;
pub mod resolution;
pub mod table_store;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::branch::{BranchPath, Direction};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Conversation, ConversationSummary, ConversationUpdate, ConversationView, Message,
    MessageContent, MessageView, NewConversation, Role,
};
use crate::version::VersionInfo;

pub use file_store::FileConversationStore;
pub use table_store::TableConversationStore;

/// Title prefix given to duplicated conversations.
pub const COPY_TITLE_PREFIX: &str = "Copy of ";

/// Branch-addressable conversation persistence.
pub trait ConversationStore: Send + Sync {
    /// Create a conversation with an empty root branch.
    fn create_conversation(&self, request: NewConversation) -> StoreResult<Conversation>;

    /// Resolve messages along `branch`, or the stored current branch.
    fn get_conversation(
        &self,
        id: &str,
        branch: Option<&BranchPath>,
    ) -> StoreResult<ConversationView>;

    /// Append a message at the next position of the branch.
    fn add_message(
        &self,
        id: &str,
        role: Role,
        content: MessageContent,
        branch: Option<&BranchPath>,
        streaming: bool,
    ) -> StoreResult<MessageView>;

    /// Replace the content of a message that is still streaming.
    ///
    /// Returns false when the conversation or message does not exist. A
    /// finalized message is a [`StoreError::Conflict`].
    fn update_message_content(
        &self,
        id: &str,
        message_id: &str,
        content: MessageContent,
        streaming: bool,
    ) -> StoreResult<bool>;

    /// Fork a new sibling of the user message at `user_msg_index`.
    fn create_branch(
        &self,
        id: &str,
        current_branch: &BranchPath,
        user_msg_index: usize,
        new_content: MessageContent,
    ) -> StoreResult<(BranchPath, MessageView)>;

    /// Replace the assistant message at `position` and drop what follows it.
    fn retry_message(
        &self,
        id: &str,
        branch: &BranchPath,
        position: usize,
        new_content: MessageContent,
    ) -> StoreResult<MessageView>;

    /// Move to the neighbouring sibling at `user_msg_index`, wrapping around.
    ///
    /// Returns `None` when the position has no other sibling.
    fn switch_branch(
        &self,
        id: &str,
        current_branch: &BranchPath,
        user_msg_index: usize,
        direction: Direction,
    ) -> StoreResult<Option<BranchPath>>;

    fn get_version_info(
        &self,
        id: &str,
        branch: &BranchPath,
        user_msg_index: usize,
    ) -> StoreResult<VersionInfo>;

    /// Remove the message at `position` and everything after it.
    ///
    /// Returns false when there is nothing to remove.
    fn delete_messages_from(
        &self,
        id: &str,
        position: usize,
        branch: Option<&BranchPath>,
    ) -> StoreResult<bool>;

    /// Title matches first, then content matches, each newest first.
    fn search_conversations(&self, query: &str) -> StoreResult<Vec<ConversationSummary>>;

    fn duplicate_conversation(&self, id: &str) -> StoreResult<Conversation>;

    fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>>;

    fn get_metadata(&self, id: &str) -> StoreResult<Conversation>;

    fn update_conversation(&self, id: &str, update: ConversationUpdate)
    -> StoreResult<Conversation>;

    fn set_session_token(&self, id: &str, token: &str) -> StoreResult<()>;

    /// Point the conversation at an existing branch.
    fn set_current_branch(&self, id: &str, branch: &BranchPath) -> StoreResult<()>;

    fn delete_conversation(&self, id: &str) -> StoreResult<bool>;

    /// Every materialized branch address.
    fn list_branches(&self, id: &str) -> StoreResult<Vec<BranchPath>>;

    /// Directory for agent tool output of this conversation.
    fn workspace_path(&self, id: &str) -> StoreResult<PathBuf>;

    /// Messages strictly before `position`.
    fn get_messages_up_to(
        &self,
        id: &str,
        position: usize,
        branch: Option<&BranchPath>,
    ) -> StoreResult<Vec<Message>> {
        let view = self.get_conversation(id, branch)?;
        Ok(view
            .messages
            .into_iter()
            .take(position)
            .map(|view| view.message)
            .collect())
    }
}

/// Per-conversation mutual exclusion for read-modify-write sequences.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the conversation's lock.
    pub fn with_lock<T>(&self, id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        let _guard = lock.lock();
        f()
    }

    pub fn forget(&self, id: &str) {
        self.locks.remove(id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Position of the `user_msg_index`-th user message.
pub(crate) fn user_message_position(messages: &[Message], user_msg_index: usize) -> Option<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.is_user())
        .nth(user_msg_index)
        .map(|(position, _)| position)
}

pub(crate) fn user_message_count(messages: &[Message]) -> usize {
    messages.iter().filter(|message| message.is_user()).count()
}

pub(crate) fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

pub(crate) fn content_matches(message: &Message, needle_lowercase: &str) -> bool {
    message
        .content
        .plain_text()
        .to_lowercase()
        .contains(needle_lowercase)
}

/// Merge title hits ahead of content hits, each newest first.
pub(crate) fn rank_search_results(
    mut title_hits: Vec<ConversationSummary>,
    mut content_hits: Vec<ConversationSummary>,
) -> Vec<ConversationSummary> {
    crate::models::sort_by_recent(&mut title_hits);
    crate::models::sort_by_recent(&mut content_hits);
    title_hits.extend(content_hits);
    title_hits
}

pub(crate) fn duplicate_metadata(source: &Conversation) -> Conversation {
    let mut copy = Conversation::new(NewConversation {
        title: format!("{COPY_TITLE_PREFIX}{}", source.title),
        model: source.model.clone(),
        system_prompt: source.system_prompt.clone(),
        is_agent: source.is_agent,
        settings: Some(source.settings.clone()),
    });
    copy.current_branch = BranchPath::root();
    copy
}

pub(crate) fn ensure_finalizable(message: &Message) -> StoreResult<()> {
    if message.streaming {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "message {} is finalized",
            message.id
        )))
    }
}
