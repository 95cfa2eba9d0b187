//! Single-table conversation store with parent-pointer rows.
//!
//! Each message version is one row carrying `(position, version,
//! parent_message_id)`. Branches are never stored; they are resolved by the
//! walk in [`super::resolution`]. Every mutation runs inside one redb write
//! transaction, which gives the per-conversation serialization the
//! read-modify-write sequences need.

use branchline_storage::{ConversationRows, MessageRowStorage, RowBatch, RowRef};
use redb::Database;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resolution::{
    ActiveVersions, MessageRow, Resolution, UserSelection, leaf_branches, resolve,
    sibling_versions, subtree_ids,
};
use super::{
    ConversationStore, content_matches, duplicate_metadata, ensure_finalizable, normalize_query,
    rank_search_results,
};
use crate::branch::{BranchPath, Direction};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Conversation, ConversationSummary, ConversationUpdate, ConversationView, Message,
    MessageContent, MessageView, NewConversation, Role, sort_by_recent,
};
use crate::version::{VersionInfo, lowest_unused_tag, resolve_version, step_tag};

/// Persisted conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationRecord {
    conversation: Conversation,
    #[serde(default)]
    active_versions: ActiveVersions,
}

impl ConversationRecord {
    /// Pin `version` at `position` and drop every later override.
    fn pin(&mut self, position: u32, version: u32) {
        self.active_versions.retain(|&pinned, _| pinned <= position);
        self.active_versions.insert(position, version);
    }
}

/// Decoded snapshot of one conversation.
struct Loaded {
    record: ConversationRecord,
    rows: Vec<MessageRow>,
}

impl Loaded {
    fn decode(id: &str, snapshot: ConversationRows) -> StoreResult<Self> {
        let Some(data) = snapshot.conversation else {
            return Err(StoreError::conversation_not_found(id));
        };
        let record = serde_json::from_slice(&data)?;
        let rows = snapshot
            .rows
            .iter()
            .map(|data| serde_json::from_slice(data))
            .collect::<Result<Vec<MessageRow>, _>>()?;
        Ok(Self { record, rows })
    }

    fn branch_or_current(&self, branch: Option<&BranchPath>) -> BranchPath {
        branch
            .cloned()
            .unwrap_or_else(|| self.record.conversation.current_branch.clone())
    }

    fn resolve(&self, branch: &BranchPath) -> Resolution<'_> {
        resolve(
            &self.rows,
            &self.record.active_versions,
            UserSelection::Path(branch),
        )
    }

    fn put_record(&self, batch: &mut RowBatch) -> StoreResult<()> {
        batch.set_conversation(serde_json::to_vec(&self.record)?);
        Ok(())
    }
}

fn put_row(batch: &mut RowBatch, row: &MessageRow) -> StoreResult<()> {
    batch.put_row(
        RowRef::new(row.position, row.message.id.clone()),
        serde_json::to_vec(row)?,
    );
    Ok(())
}

fn views(resolution: &Resolution<'_>) -> Vec<MessageView> {
    let mut user_index = 0;
    resolution
        .rows
        .iter()
        .enumerate()
        .map(|(position, row)| {
            let (user_msg_index, version) = if row.message.is_user() {
                let k = user_index;
                user_index += 1;
                (
                    Some(k),
                    resolve_version(&resolution.user_siblings[k], resolution.user_tags[k]),
                )
            } else {
                (None, VersionInfo::SINGLE)
            };
            MessageView {
                message: row.message.clone(),
                position,
                user_msg_index,
                version,
            }
        })
        .collect()
}

fn to_position(position: usize) -> StoreResult<u32> {
    u32::try_from(position)
        .map_err(|_| StoreError::InvalidArgument(format!("position {position} is out of range")))
}

/// Whether `branch` names a sequence that exists: every non-default tag must
/// have been resolved.
fn is_materialized(resolution: &Resolution<'_>, branch: &BranchPath) -> bool {
    branch
        .compressed()
        .tags()
        .iter()
        .enumerate()
        .all(|(k, &tag)| match resolution.user_tags.get(k) {
            Some(&resolved) => resolved == tag,
            None => tag == 0,
        })
}

pub struct TableConversationStore {
    rows: MessageRowStorage,
    workspaces: PathBuf,
}

impl TableConversationStore {
    pub fn new(db: Arc<Database>, workspaces: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            rows: MessageRowStorage::new(db)?,
            workspaces: workspaces.into(),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        workspaces: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(Database::create(path.as_ref())?);
        Self::new(db, workspaces)
    }

    fn load(&self, id: &str) -> StoreResult<Loaded> {
        Loaded::decode(id, self.rows.load(id)?)
    }

    /// Read-modify-write one existing conversation.
    fn mutate<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Loaded, &mut RowBatch) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.rows.transact(id, |snapshot| {
            let mut loaded = Loaded::decode(id, snapshot)?;
            let mut batch = RowBatch::new();
            let value = apply(&mut loaded, &mut batch)?;
            Ok((batch, value))
        })
    }

    fn workspace_dir(&self, id: &str) -> StoreResult<PathBuf> {
        branchline_storage::keys::validate_id(id)?;
        Ok(self.workspaces.join(id))
    }
}

impl ConversationStore for TableConversationStore {
    fn create_conversation(&self, request: NewConversation) -> StoreResult<Conversation> {
        let conversation = Conversation::new(request);
        let record = ConversationRecord {
            conversation: conversation.clone(),
            active_versions: ActiveVersions::new(),
        };

        self.rows.transact(&conversation.id, |snapshot| {
            if snapshot.conversation.is_some() {
                return Err(StoreError::Conflict(format!(
                    "conversation {} already exists",
                    conversation.id
                )));
            }
            let mut batch = RowBatch::new();
            batch.set_conversation(serde_json::to_vec(&record)?);
            Ok((batch, ()))
        })?;

        if conversation.is_agent {
            let workspace = self.workspace_dir(&conversation.id)?;
            std::fs::create_dir_all(&workspace).map_err(anyhow::Error::from)?;
        }
        info!(conversation_id = %conversation.id, agent = conversation.is_agent, "Created conversation");
        Ok(conversation)
    }

    fn get_conversation(
        &self,
        id: &str,
        branch: Option<&BranchPath>,
    ) -> StoreResult<ConversationView> {
        let loaded = self.load(id)?;
        let requested = branch.is_some();
        let branch = loaded.branch_or_current(branch).compressed();
        let resolution = loaded.resolve(&branch);
        if requested && !is_materialized(&resolution, &branch) {
            return Err(StoreError::NotFound(format!(
                "branch {branch} of conversation {id}"
            )));
        }
        let messages = views(&resolution);

        Ok(ConversationView {
            conversation: loaded.record.conversation.clone(),
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
        self.mutate(id, |loaded, batch| {
            let branch = loaded.branch_or_current(branch);
            let resolution = loaded.resolve(&branch);
            let position = resolution.rows.len();
            let parent = resolution.rows.last().map(|row| row.message.id.clone());
            let user_msg_index = (role == Role::User).then_some(resolution.user_tags.len());
            let position_key = to_position(position)?;

            let existing: Vec<&MessageRow> = loaded
                .rows
                .iter()
                .filter(|row| row.position == position_key && row.is_child_of(parent.as_deref()))
                .collect();
            if existing.iter().any(|row| row.message.role != role) {
                return Err(StoreError::Conflict(format!(
                    "position {position} of branch {branch} holds messages of another role"
                )));
            }
            let mut used: Vec<u32> = existing.iter().map(|row| row.version).collect();

            // New user rows take the tag the branch asks for so the branch
            // address keeps naming this sequence.
            let version = match user_msg_index {
                Some(k) if !used.contains(&branch.tag_at(k)) => branch.tag_at(k),
                _ => lowest_unused_tag(&used),
            };
            let row = MessageRow {
                message: Message::new(role, content).streaming(streaming),
                position: position_key,
                version,
                parent_message_id: parent,
            };

            put_row(batch, &row)?;
            loaded.record.conversation.touch();
            loaded.put_record(batch)?;

            used.push(version);
            debug!(conversation_id = id, branch = %branch, position, "Appended message");
            Ok(MessageView {
                message: row.message,
                position,
                user_msg_index,
                version: match user_msg_index {
                    Some(_) => resolve_version(&used, version),
                    None => VersionInfo::SINGLE,
                },
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
        self.rows.transact(id, |snapshot| {
            if snapshot.conversation.is_none() {
                return Ok((RowBatch::new(), false));
            }
            let mut loaded = Loaded::decode(id, snapshot)?;
            let Some(row) = loaded
                .rows
                .iter_mut()
                .find(|row| row.message.id == message_id)
            else {
                return Ok((RowBatch::new(), false));
            };
            ensure_finalizable(&row.message)?;

            row.message.content = content;
            row.message.streaming = streaming;

            let mut batch = RowBatch::new();
            put_row(&mut batch, row)?;
            loaded.record.conversation.touch();
            loaded.put_record(&mut batch)?;
            Ok((batch, true))
        })
    }

    fn create_branch(
        &self,
        id: &str,
        current_branch: &BranchPath,
        user_msg_index: usize,
        new_content: MessageContent,
    ) -> StoreResult<(BranchPath, MessageView)> {
        self.mutate(id, |loaded, batch| {
            let resolution = loaded.resolve(current_branch);
            let Some(&position) = resolution.user_positions.get(user_msg_index) else {
                return Err(StoreError::Conflict(format!(
                    "branch {current_branch} has no user message {user_msg_index}"
                )));
            };
            let replaced = resolution.rows[position];
            let parent = replaced.parent_message_id.clone();
            let position_key = replaced.position;

            let mut used = sibling_versions(&loaded.rows, position_key, parent.as_deref());
            let tag = lowest_unused_tag(&used);
            let mut tags = resolution.user_tags[..user_msg_index].to_vec();
            tags.push(tag);
            let new_branch = BranchPath::new(tags).compressed();

            let row = MessageRow {
                message: Message::new(Role::User, new_content),
                position: position_key,
                version: tag,
                parent_message_id: parent,
            };
            put_row(batch, &row)?;

            loaded.record.pin(position_key, tag);
            loaded.record.conversation.current_branch = new_branch.clone();
            loaded.record.conversation.touch();
            loaded.put_record(batch)?;

            used.push(tag);
            info!(conversation_id = id, from = %current_branch, to = %new_branch, "Created branch");
            Ok((
                new_branch,
                MessageView {
                    message: row.message,
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
        self.mutate(id, |loaded, batch| {
            let resolution = loaded.resolve(branch);
            let Some(replaced) = resolution.rows.get(position).copied() else {
                return Err(StoreError::InvalidPosition {
                    position,
                    len: resolution.rows.len(),
                });
            };
            if replaced.message.role != Role::Assistant {
                return Err(StoreError::InvalidArgument(format!(
                    "message at position {position} is not an assistant message"
                )));
            }

            let parent = replaced.parent_message_id.clone();
            let position_key = replaced.position;
            let used = sibling_versions(&loaded.rows, position_key, parent.as_deref());
            let version = lowest_unused_tag(&used);
            let row = MessageRow {
                message: Message::new(Role::Assistant, new_content),
                position: position_key,
                version,
                parent_message_id: parent,
            };
            put_row(batch, &row)?;

            loaded.record.pin(position_key, version);
            loaded.record.conversation.touch();
            loaded.put_record(batch)?;

            debug!(conversation_id = id, branch = %branch, position, version, "Retried message");
            Ok(MessageView {
                message: row.message,
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
        self.mutate(id, |loaded, batch| {
            let (position_key, tag, target) = {
                let resolution = loaded.resolve(current_branch);
                if user_msg_index >= resolution.user_tags.len() {
                    return Err(StoreError::InvalidPosition {
                        position: user_msg_index,
                        len: resolution.user_tags.len(),
                    });
                }
                let Some(tag) = step_tag(
                    &resolution.user_siblings[user_msg_index],
                    resolution.user_tags[user_msg_index],
                    direction == Direction::Next,
                ) else {
                    return Ok(None);
                };
                let mut tags = resolution.user_tags[..user_msg_index].to_vec();
                tags.push(tag);
                (
                    resolution.user_positions[user_msg_index] as u32,
                    tag,
                    BranchPath::new(tags),
                )
            };

            loaded.record.pin(position_key, tag);
            let snapped = resolve(
                &loaded.rows,
                &loaded.record.active_versions,
                UserSelection::Snap {
                    path: &target,
                    fixed: user_msg_index,
                },
            )
            .branch();

            loaded.record.conversation.current_branch = snapped.clone();
            loaded.record.conversation.touch();
            loaded.put_record(batch)?;
            Ok(Some(snapped))
        })
    }

    fn get_version_info(
        &self,
        id: &str,
        branch: &BranchPath,
        user_msg_index: usize,
    ) -> StoreResult<VersionInfo> {
        let loaded = self.load(id)?;
        let resolution = loaded.resolve(branch);
        match (
            resolution.user_siblings.get(user_msg_index),
            resolution.user_tags.get(user_msg_index),
        ) {
            (Some(siblings), Some(&tag)) => Ok(resolve_version(siblings, tag)),
            _ => Err(StoreError::InvalidPosition {
                position: user_msg_index,
                len: resolution.user_tags.len(),
            }),
        }
    }

    fn delete_messages_from(
        &self,
        id: &str,
        position: usize,
        branch: Option<&BranchPath>,
    ) -> StoreResult<bool> {
        self.rows.transact(id, |snapshot| {
            if snapshot.conversation.is_none() {
                return Ok((RowBatch::new(), false));
            }
            let mut loaded = Loaded::decode(id, snapshot)?;
            let branch = loaded.branch_or_current(branch);

            let (doomed, position_key) = {
                let resolution = loaded.resolve(&branch);
                let Some(first) = resolution.rows.get(position) else {
                    return Ok((RowBatch::new(), false));
                };
                // Every retried version under the same parent goes too.
                let roots: Vec<&str> = if first.message.is_user() {
                    vec![first.message.id.as_str()]
                } else {
                    loaded
                        .rows
                        .iter()
                        .filter(|row| {
                            row.position == first.position
                                && !row.message.is_user()
                                && row.is_child_of(first.parent_message_id.as_deref())
                        })
                        .map(|row| row.message.id.as_str())
                        .collect()
                };
                let mut doomed = BTreeSet::new();
                for root in roots {
                    doomed.extend(subtree_ids(&loaded.rows, root));
                }
                doomed.extend(resolution.ids_from(position));
                let doomed: Vec<RowRef> = loaded
                    .rows
                    .iter()
                    .filter(|row| doomed.contains(row.message.id.as_str()))
                    .map(|row| RowRef::new(row.position, row.message.id.clone()))
                    .collect();
                (doomed, first.position)
            };

            let mut batch = RowBatch::new();
            for row in &doomed {
                batch.delete_row(row.clone());
            }
            loaded
                .record
                .active_versions
                .retain(|&pinned, _| pinned < position_key);
            loaded.record.conversation.touch();
            loaded.put_record(&mut batch)?;

            debug!(conversation_id = id, position, removed = doomed.len(), "Deleted messages");
            Ok((batch, true))
        })
    }

    fn search_conversations(&self, query: &str) -> StoreResult<Vec<ConversationSummary>> {
        let needle = normalize_query(query);
        if needle.is_empty() {
            return self.list_conversations();
        }

        let mut title_hits = Vec::new();
        let mut content_hits = Vec::new();
        for (id, _) in self.rows.list_conversations_raw()? {
            let loaded = match self.load(&id) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation");
                    continue;
                }
            };
            let conversation = &loaded.record.conversation;
            if conversation.matches_title(&needle) {
                title_hits.push(conversation.summary());
            } else if loaded
                .rows
                .iter()
                .any(|row| content_matches(&row.message, &needle))
            {
                content_hits.push(conversation.summary());
            }
        }

        Ok(rank_search_results(title_hits, content_hits))
    }

    fn duplicate_conversation(&self, id: &str) -> StoreResult<Conversation> {
        let source = self.load(id)?;
        let copy = duplicate_metadata(&source.record.conversation);

        let new_ids: HashMap<&str, String> = source
            .rows
            .iter()
            .map(|row| (row.message.id.as_str(), Uuid::new_v4().to_string()))
            .collect();
        let remap = |old: &str| {
            new_ids
                .get(old)
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string())
        };

        let record = ConversationRecord {
            conversation: copy.clone(),
            active_versions: ActiveVersions::new(),
        };
        self.rows.transact(&copy.id, |_| {
            let mut batch = RowBatch::new();
            for row in &source.rows {
                let mut copied = row.clone();
                copied.message.id = remap(&row.message.id);
                copied.parent_message_id = row.parent_message_id.as_deref().map(remap);
                put_row(&mut batch, &copied)?;
            }
            batch.set_conversation(serde_json::to_vec(&record)?);
            Ok::<_, StoreError>((batch, ()))
        })?;

        if copy.is_agent {
            std::fs::create_dir_all(self.workspace_dir(&copy.id)?).map_err(anyhow::Error::from)?;
        }
        info!(source = id, conversation_id = %copy.id, "Duplicated conversation");
        Ok(copy)
    }

    fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        for (id, data) in self.rows.list_conversations_raw()? {
            match serde_json::from_slice::<ConversationRecord>(&data) {
                Ok(record) => summaries.push(record.conversation.summary()),
                Err(e) => warn!(conversation_id = %id, error = %e, "Skipping unreadable conversation"),
            }
        }
        sort_by_recent(&mut summaries);
        Ok(summaries)
    }

    fn get_metadata(&self, id: &str) -> StoreResult<Conversation> {
        Ok(self.load(id)?.record.conversation)
    }

    fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> StoreResult<Conversation> {
        self.mutate(id, |loaded, batch| {
            loaded.record.conversation.apply_update(update);
            loaded.put_record(batch)?;
            Ok(loaded.record.conversation.clone())
        })
    }

    fn set_session_token(&self, id: &str, token: &str) -> StoreResult<()> {
        self.mutate(id, |loaded, batch| {
            loaded.record.conversation.session_token = Some(token.to_string());
            loaded.record.conversation.touch();
            loaded.put_record(batch)
        })
    }

    fn set_current_branch(&self, id: &str, branch: &BranchPath) -> StoreResult<()> {
        self.mutate(id, |loaded, batch| {
            if !is_materialized(&loaded.resolve(branch), branch) {
                return Err(StoreError::NotFound(format!(
                    "branch {branch} of conversation {id}"
                )));
            }
            loaded.record.conversation.current_branch = branch.compressed();
            loaded.record.conversation.touch();
            loaded.put_record(batch)
        })
    }

    fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        let deleted = self.rows.delete_conversation(id)?;
        let workspace = self.workspace_dir(id)?;
        if deleted && workspace.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workspace) {
                warn!(conversation_id = id, error = %e, "Failed to remove workspace");
            }
        }
        if deleted {
            info!(conversation_id = id, "Deleted conversation");
        }
        Ok(deleted)
    }

    fn list_branches(&self, id: &str) -> StoreResult<Vec<BranchPath>> {
        Ok(leaf_branches(&self.load(id)?.rows))
    }

    fn workspace_path(&self, id: &str) -> StoreResult<PathBuf> {
        self.workspace_dir(id)
    }
}
