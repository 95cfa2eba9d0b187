//! File-per-branch conversation store.
//!
//! Every materialized branch address owns a full copy of its message list.
//! Editing a user message writes a new record; retrying rewrites the record
//! of the branch being retried. Sibling versions are discovered by scanning
//! the branch keys that share a prefix.

use branchline_storage::BranchRecordStorage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ConversationLocks, ConversationStore, content_matches, duplicate_metadata, ensure_finalizable,
    normalize_query, rank_search_results, user_message_count, user_message_position,
};
use crate::branch::{BranchPath, Direction};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Conversation, ConversationSummary, ConversationUpdate, ConversationView, Message,
    MessageContent, MessageView, NewConversation, Role, sort_by_recent,
};
use crate::version::{VersionInfo, lowest_unused_tag, resolve_version, step_tag};

/// Persisted body of one branch record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BranchRecord {
    messages: Vec<Message>,
}

pub struct FileConversationStore {
    records: BranchRecordStorage,
    locks: ConversationLocks,
}

impl FileConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            records: BranchRecordStorage::new(root)?,
            locks: ConversationLocks::new(),
        })
    }

    fn load_metadata(&self, id: &str) -> StoreResult<Conversation> {
        match self.records.get_metadata_raw(id)? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Err(StoreError::conversation_not_found(id)),
        }
    }

    fn save_metadata(&self, conversation: &Conversation) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(conversation)?;
        self.records.put_metadata_raw(&conversation.id, &data)?;
        Ok(())
    }

    /// Metadata update that follows a successful branch write.
    fn touch_metadata(&self, mut conversation: Conversation) {
        conversation.touch();
        if let Err(e) = self.save_metadata(&conversation) {
            warn!(conversation_id = %conversation.id, error = %e, "Failed to update conversation metadata after branch write");
        }
    }

    fn load_record(&self, id: &str, branch: &BranchPath) -> StoreResult<Option<Vec<Message>>> {
        match self.records.get_record_raw(id, &branch.to_key())? {
            Some(data) => {
                let record: BranchRecord = serde_json::from_slice(&data)?;
                Ok(Some(record.messages))
            }
            None => Ok(None),
        }
    }

    fn require_record(&self, id: &str, branch: &BranchPath) -> StoreResult<Vec<Message>> {
        self.load_record(id, branch)?
            .ok_or_else(|| StoreError::NotFound(format!("branch {branch} of conversation {id}")))
    }

    fn save_record(&self, id: &str, branch: &BranchPath, messages: &[Message]) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(&BranchRecord {
            messages: messages.to_vec(),
        })?;
        self.records.put_record_raw(id, &branch.to_key(), &data)?;
        Ok(())
    }

    fn branch_paths(&self, id: &str) -> StoreResult<Vec<BranchPath>> {
        let mut paths = Vec::new();
        for key in self.records.list_record_keys(id)? {
            match BranchPath::from_key(&key) {
                Ok(path) => paths.push(path),
                Err(e) => warn!(conversation_id = id, key = %key, error = %e, "Skipping unreadable branch record"),
            }
        }
        Ok(paths)
    }

    fn views(
        &self,
        paths: &[BranchPath],
        branch: &BranchPath,
        messages: Vec<Message>,
    ) -> Vec<MessageView> {
        let mut user_index = 0;
        messages
            .into_iter()
            .enumerate()
            .map(|(position, message)| {
                if message.is_user() {
                    let k = user_index;
                    user_index += 1;
                    MessageView {
                        message,
                        position,
                        user_msg_index: Some(k),
                        version: version_at(paths, branch, k),
                    }
                } else {
                    MessageView {
                        message,
                        position,
                        user_msg_index: None,
                        version: VersionInfo::SINGLE,
                    }
                }
            })
            .collect()
    }

    fn check_user_index(messages: &[Message], user_msg_index: usize) -> StoreResult<()> {
        let count = user_message_count(messages);
        if user_msg_index >= count {
            return Err(StoreError::InvalidPosition {
                position: user_msg_index,
                len: count,
            });
        }
        Ok(())
    }
}

/// Distinct tags at `k` among records sharing `branch`'s first `k` tags.
fn sibling_tags(paths: &[BranchPath], branch: &BranchPath, k: usize) -> Vec<u32> {
    let prefix = branch.extend_to(k);
    let mut tags: Vec<u32> = paths
        .iter()
        .filter(|path| path.extend_to(k) == prefix)
        .map(|path| path.tag_at(k))
        .collect();
    tags.sort_unstable();
    tags.dedup();
    tags
}

fn version_at(paths: &[BranchPath], branch: &BranchPath, k: usize) -> VersionInfo {
    resolve_version(&sibling_tags(paths, branch, k), branch.tag_at(k))
}

impl ConversationStore for FileConversationStore {
    fn create_conversation(&self, request: NewConversation) -> StoreResult<Conversation> {
        let conversation = Conversation::new(request);
        let id = conversation.id.clone();
        self.locks.with_lock(&id, || -> StoreResult<_> {
            self.records
                .create_conversation_dir(&id, conversation.is_agent)?;
            self.save_record(&id, &BranchPath::root(), &[])?;
            self.save_metadata(&conversation)?;
            info!(conversation_id = %id, agent = conversation.is_agent, "Created conversation");
            Ok(conversation)
        })
    }

    fn get_conversation(
        &self,
        id: &str,
        branch: Option<&BranchPath>,
    ) -> StoreResult<ConversationView> {
        let conversation = self.load_metadata(id)?;
        let branch = branch
            .cloned()
            .unwrap_or_else(|| conversation.current_branch.clone())
            .compressed();
        let messages = self.require_record(id, &branch)?;
        let paths = self.branch_paths(id)?;
        let messages = self.views(&paths, &branch, messages);

        Ok(ConversationView {
            conversation,
            branch,
            messages,
        })
    }

    fn add_message(
        &self,
        id: &str,
        role: Role,
        content: MessageContent,
        branch: Option<&BranchPath>,
        streaming: bool,
    ) -> StoreResult<MessageView> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let conversation = self.load_metadata(id)?;
            let branch = branch
                .cloned()
                .unwrap_or_else(|| conversation.current_branch.clone());
            let mut messages = self.require_record(id, &branch)?;

            let message = Message::new(role, content).streaming(streaming);
            let position = messages.len();
            let user_msg_index = message.is_user().then(|| user_message_count(&messages));
            messages.push(message.clone());
            self.save_record(id, &branch, &messages)?;
            self.touch_metadata(conversation);

            let version = match user_msg_index {
                Some(k) => version_at(&self.branch_paths(id)?, &branch, k),
                None => VersionInfo::SINGLE,
            };
            debug!(conversation_id = id, branch = %branch, position, "Appended message");
            Ok(MessageView {
                message,
                position,
                user_msg_index,
                version,
            })
        })
    }

    fn update_message_content(
        &self,
        id: &str,
        message_id: &str,
        content: MessageContent,
        streaming: bool,
    ) -> StoreResult<bool> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let conversation = match self.load_metadata(id) {
                Ok(conversation) => conversation,
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };

            // A message shared by several records is updated in all of them.
            let mut hits = Vec::new();
            for branch in self.branch_paths(id)? {
                let Some(messages) = self.load_record(id, &branch)? else {
                    continue;
                };
                if let Some(idx) = messages.iter().position(|m| m.id == message_id) {
                    ensure_finalizable(&messages[idx])?;
                    hits.push((branch, messages, idx));
                }
            }
            if hits.is_empty() {
                return Ok(false);
            }

            for (branch, mut messages, idx) in hits {
                messages[idx].content = content.clone();
                messages[idx].streaming = streaming;
                self.save_record(id, &branch, &messages)?;
            }
            self.touch_metadata(conversation);
            Ok(true)
        })
    }

    fn create_branch(
        &self,
        id: &str,
        current_branch: &BranchPath,
        user_msg_index: usize,
        new_content: MessageContent,
    ) -> StoreResult<(BranchPath, MessageView)> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let mut conversation = self.load_metadata(id)?;
            let messages = self.require_record(id, current_branch)?;
            let position = user_message_position(&messages, user_msg_index).ok_or_else(|| {
                StoreError::Conflict(format!(
                    "branch {current_branch} has no user message {user_msg_index}"
                ))
            })?;

            let paths = self.branch_paths(id)?;
            let mut used = sibling_tags(&paths, current_branch, user_msg_index);
            let tag = lowest_unused_tag(&used);
            let new_branch = current_branch
                .with_tag_at(user_msg_index, tag)
                .compressed();

            let edited = Message::new(Role::User, new_content);
            let mut branch_messages = messages[..position].to_vec();
            branch_messages.push(edited.clone());
            self.save_record(id, &new_branch, &branch_messages)?;

            conversation.current_branch = new_branch.clone();
            self.touch_metadata(conversation);

            used.push(tag);
            info!(conversation_id = id, from = %current_branch, to = %new_branch, "Created branch");
            Ok((
                new_branch,
                MessageView {
                    message: edited,
                    position,
                    user_msg_index: Some(user_msg_index),
                    version: resolve_version(&used, tag),
                },
            ))
        })
    }

    fn retry_message(
        &self,
        id: &str,
        branch: &BranchPath,
        position: usize,
        new_content: MessageContent,
    ) -> StoreResult<MessageView> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let conversation = self.load_metadata(id)?;
            let mut messages = self.require_record(id, branch)?;
            if position >= messages.len() {
                return Err(StoreError::InvalidPosition {
                    position,
                    len: messages.len(),
                });
            }
            if messages[position].role != Role::Assistant {
                return Err(StoreError::InvalidArgument(format!(
                    "message at position {position} is not an assistant message"
                )));
            }

            let message = Message::new(Role::Assistant, new_content);
            messages.truncate(position);
            messages.push(message.clone());
            self.save_record(id, branch, &messages)?;
            self.touch_metadata(conversation);

            debug!(conversation_id = id, branch = %branch, position, "Retried message");
            Ok(MessageView {
                message,
                position,
                user_msg_index: None,
                version: VersionInfo::SINGLE,
            })
        })
    }

    fn switch_branch(
        &self,
        id: &str,
        current_branch: &BranchPath,
        user_msg_index: usize,
        direction: Direction,
    ) -> StoreResult<Option<BranchPath>> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let mut conversation = self.load_metadata(id)?;
            let messages = self.require_record(id, current_branch)?;
            Self::check_user_index(&messages, user_msg_index)?;

            let paths = self.branch_paths(id)?;
            let tags = sibling_tags(&paths, current_branch, user_msg_index);
            let Some(tag) = step_tag(
                &tags,
                current_branch.tag_at(user_msg_index),
                direction == Direction::Next,
            ) else {
                return Ok(None);
            };

            let target = current_branch.with_tag_at(user_msg_index, tag);
            let depth = user_msg_index + 1;
            let snapped = paths
                .iter()
                .filter(|path| path.extend_to(depth) == target.tags())
                .map(BranchPath::compressed)
                .min_by(|a, b| a.tags().cmp(b.tags()))
                .unwrap_or_else(|| target.compressed());

            conversation.current_branch = snapped.clone();
            conversation.touch();
            self.save_metadata(&conversation)?;
            Ok(Some(snapped))
        })
    }

    fn get_version_info(
        &self,
        id: &str,
        branch: &BranchPath,
        user_msg_index: usize,
    ) -> StoreResult<VersionInfo> {
        self.load_metadata(id)?;
        let messages = self.require_record(id, branch)?;
        Self::check_user_index(&messages, user_msg_index)?;
        Ok(version_at(&self.branch_paths(id)?, branch, user_msg_index))
    }

    fn delete_messages_from(
        &self,
        id: &str,
        position: usize,
        branch: Option<&BranchPath>,
    ) -> StoreResult<bool> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let conversation = match self.load_metadata(id) {
                Ok(conversation) => conversation,
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            let branch = branch
                .cloned()
                .unwrap_or_else(|| conversation.current_branch.clone());
            let Some(mut messages) = self.load_record(id, &branch)? else {
                return Ok(false);
            };
            if position >= messages.len() {
                return Ok(false);
            }

            messages.truncate(position);
            self.save_record(id, &branch, &messages)?;
            self.touch_metadata(conversation);
            Ok(true)
        })
    }

    fn search_conversations(&self, query: &str) -> StoreResult<Vec<ConversationSummary>> {
        let needle = normalize_query(query);
        if needle.is_empty() {
            return self.list_conversations();
        }

        let mut title_hits = Vec::new();
        let mut content_hits = Vec::new();
        for id in self.records.list_conversation_ids()? {
            let conversation = match self.load_metadata(&id) {
                Ok(conversation) => conversation,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                    continue;
                }
            };
            if conversation.matches_title(&needle) {
                title_hits.push(conversation.summary());
                continue;
            }

            let mut found = false;
            for branch in self.branch_paths(&id)? {
                if let Some(messages) = self.load_record(&id, &branch)?
                    && messages.iter().any(|m| content_matches(m, &needle))
                {
                    found = true;
                    break;
                }
            }
            if found {
                content_hits.push(conversation.summary());
            }
        }

        Ok(rank_search_results(title_hits, content_hits))
    }

    fn duplicate_conversation(&self, id: &str) -> StoreResult<Conversation> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let source = self.load_metadata(id)?;
            let copy = duplicate_metadata(&source);
            self.records
                .create_conversation_dir(&copy.id, copy.is_agent)?;

            // Ids are remapped once so a message shared by several records
            // stays shared in the copy.
            let mut new_ids: HashMap<String, String> = HashMap::new();
            for branch in self.branch_paths(id)? {
                let Some(messages) = self.load_record(id, &branch)? else {
                    continue;
                };
                let copied: Vec<Message> = messages
                    .into_iter()
                    .map(|mut message| {
                        message.id = new_ids
                            .entry(message.id.clone())
                            .or_insert_with(|| Uuid::new_v4().to_string())
                            .clone();
                        message
                    })
                    .collect();
                self.save_record(&copy.id, &branch, &copied)?;
            }
            if !self.records.record_exists(&copy.id, &BranchPath::root().to_key())? {
                self.save_record(&copy.id, &BranchPath::root(), &[])?;
            }
            self.save_metadata(&copy)?;

            info!(source = id, conversation_id = %copy.id, "Duplicated conversation");
            Ok(copy)
        })
    }

    fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        for id in self.records.list_conversation_ids()? {
            match self.load_metadata(&id) {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation"),
            }
        }
        sort_by_recent(&mut summaries);
        Ok(summaries)
    }

    fn get_metadata(&self, id: &str) -> StoreResult<Conversation> {
        self.load_metadata(id)
    }

    fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> StoreResult<Conversation> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let mut conversation = self.load_metadata(id)?;
            conversation.apply_update(update);
            self.save_metadata(&conversation)?;
            Ok(conversation)
        })
    }

    fn set_session_token(&self, id: &str, token: &str) -> StoreResult<()> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let mut conversation = self.load_metadata(id)?;
            conversation.session_token = Some(token.to_string());
            conversation.touch();
            self.save_metadata(&conversation)
        })
    }

    fn set_current_branch(&self, id: &str, branch: &BranchPath) -> StoreResult<()> {
        self.locks.with_lock(id, || -> StoreResult<_> {
            let mut conversation = self.load_metadata(id)?;
            if !self.records.record_exists(id, &branch.to_key())? {
                return Err(StoreError::NotFound(format!(
                    "branch {branch} of conversation {id}"
                )));
            }
            conversation.current_branch = branch.compressed();
            conversation.touch();
            self.save_metadata(&conversation)
        })
    }

    fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        let deleted = self
            .locks
            .with_lock(id, || self.records.delete_conversation(id))?;
        self.locks.forget(id);
        if deleted {
            info!(conversation_id = id, "Deleted conversation");
        }
        Ok(deleted)
    }

    fn list_branches(&self, id: &str) -> StoreResult<Vec<BranchPath>> {
        self.load_metadata(id)?;
        let mut paths = self.branch_paths(id)?;
        paths.sort_by(|a, b| a.tags().cmp(b.tags()));
        Ok(paths)
    }

    fn workspace_path(&self, id: &str) -> StoreResult<PathBuf> {
        Ok(self.records.workspace_dir(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (FileConversationStore, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let store = FileConversationStore::new(temp_dir.path().join("conversations")).unwrap();
        (store, temp_dir)
    }

    fn branch(tags: &[u32]) -> BranchPath {
        BranchPath::new(tags.to_vec())
    }

    #[test]
    fn test_each_branch_is_its_own_record() {
        let (store, temp_dir) = setup();
        let conversation = store
            .create_conversation(NewConversation::new("Files"))
            .unwrap();
        store
            .add_message(&conversation.id, Role::User, "hi".into(), None, false)
            .unwrap();
        store
            .create_branch(&conversation.id, &branch(&[0]), 0, "hi again".into())
            .unwrap();

        let dir = temp_dir.path().join("conversations").join(&conversation.id);
        assert!(dir.join("metadata.json").is_file());
        assert!(dir.join("0.json").is_file());
        assert!(dir.join("1.json").is_file());
    }

    #[test]
    fn test_agent_conversation_gets_workspace() {
        let (store, _temp_dir) = setup();
        let conversation = store
            .create_conversation(NewConversation::new("Agent").agent())
            .unwrap();
        assert!(store.workspace_path(&conversation.id).unwrap().is_dir());
    }

    #[test]
    fn test_explicit_missing_branch_is_not_found() {
        let (store, _temp_dir) = setup();
        let conversation = store
            .create_conversation(NewConversation::new("Files"))
            .unwrap();
        let result = store.get_conversation(&conversation.id, Some(&branch(&[0, 4])));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_switch_snaps_to_lowest_descendant() {
        let (store, _temp_dir) = setup();
        let id = store
            .create_conversation(NewConversation::new("Snap"))
            .unwrap()
            .id;
        store.add_message(&id, Role::User, "q1".into(), None, false).unwrap();
        store.add_message(&id, Role::Assistant, "a1".into(), None, false).unwrap();
        store.add_message(&id, Role::User, "q2".into(), None, false).unwrap();

        // Two descendants under root tag 0: "0" and "0_1".
        let (edited, _) = store.create_branch(&id, &branch(&[0]), 1, "q2'".into()).unwrap();
        assert_eq!(edited, branch(&[0, 1]));
        let (forked, _) = store.create_branch(&id, &edited, 0, "q1'".into()).unwrap();
        assert_eq!(forked, branch(&[1]));

        let back = store
            .switch_branch(&id, &forked, 0, Direction::Next)
            .unwrap()
            .unwrap();
        assert_eq!(back, branch(&[0]));
        assert_eq!(store.get_metadata(&id).unwrap().current_branch, branch(&[0]));
    }

    #[test]
    fn test_duplicate_remaps_shared_ids_consistently() {
        let (store, _temp_dir) = setup();
        let id = store
            .create_conversation(NewConversation::new("Source"))
            .unwrap()
            .id;
        let first = store.add_message(&id, Role::User, "q1".into(), None, false).unwrap();
        store.add_message(&id, Role::Assistant, "a1".into(), None, false).unwrap();
        store.add_message(&id, Role::User, "q2".into(), None, false).unwrap();
        store.create_branch(&id, &branch(&[0]), 1, "q2'".into()).unwrap();

        let copy = store.duplicate_conversation(&id).unwrap();
        let root = store.get_conversation(&copy.id, Some(&branch(&[0]))).unwrap();
        let edited = store.get_conversation(&copy.id, Some(&branch(&[0, 1]))).unwrap();

        assert_ne!(root.messages[0].message.id, first.message.id);
        assert_eq!(root.messages[0].message.id, edited.messages[0].message.id);
        assert_eq!(root.messages.len(), 3);
        assert_eq!(edited.messages.len(), 3);
    }

    #[test]
    fn test_update_reaches_every_record_holding_the_message() {
        let (store, _temp_dir) = setup();
        let id = store
            .create_conversation(NewConversation::new("Shared"))
            .unwrap()
            .id;
        store.add_message(&id, Role::User, "q1".into(), None, false).unwrap();
        let pending = store
            .add_message(&id, Role::Assistant, "".into(), None, true)
            .unwrap();
        store.add_message(&id, Role::User, "q2".into(), None, false).unwrap();
        let (edited, _) = store.create_branch(&id, &branch(&[0]), 1, "q2'".into()).unwrap();

        assert!(store
            .update_message_content(&id, &pending.message.id, "done".into(), false)
            .unwrap());
        for path in [branch(&[0]), edited] {
            let view = store.get_conversation(&id, Some(&path)).unwrap();
            assert_eq!(view.messages[1].message.content, MessageContent::text("done"));
            assert!(!view.messages[1].message.streaming);
        }
    }
}
