//! Message row storage - byte-level API for the parent-pointer table layout.
//!
//! Every conversation owns one record in `conversations` and one row per
//! message version in `conversation_messages`:
//!
//! ```text
//! conversations:          {conversation_id} -> record bytes
//! conversation_messages:  {conversation_id}:{position:010}:{message_id} -> row bytes
//! ```
//!
//! Mutations go through [`MessageRowStorage::transact`], which reads the
//! conversation and all its rows inside the same write transaction used to
//! commit the resulting [`RowBatch`]. redb serializes write transactions, so
//! a read-modify-write can never lose a concurrent update.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use std::sync::Arc;

use crate::keys::{conversation_prefix, prefix_range, row_key, validate_id};

const CONVERSATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("conversation_messages");

/// Identifies one message row inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRef {
    pub position: u32,
    pub message_id: String,
}

impl RowRef {
    pub fn new(position: u32, message_id: impl Into<String>) -> Self {
        Self {
            position,
            message_id: message_id.into(),
        }
    }
}

/// Raw snapshot of one conversation: its record plus every row, in key order.
#[derive(Debug, Clone, Default)]
pub struct ConversationRows {
    pub conversation: Option<Vec<u8>>,
    pub rows: Vec<Vec<u8>>,
}

/// Writes to apply atomically at the end of a transaction.
#[derive(Debug, Default)]
pub struct RowBatch {
    conversation: Option<Vec<u8>>,
    puts: Vec<(RowRef, Vec<u8>)>,
    deletes: Vec<RowRef>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversation(&mut self, data: Vec<u8>) -> &mut Self {
        self.conversation = Some(data);
        self
    }

    pub fn put_row(&mut self, row: RowRef, data: Vec<u8>) -> &mut Self {
        self.puts.push((row, data));
        self
    }

    pub fn delete_row(&mut self, row: RowRef) -> &mut Self {
        self.deletes.push(row);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_none() && self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Low-level message row storage with byte-level API
#[derive(Debug, Clone)]
pub struct MessageRowStorage {
    db: Arc<Database>,
}

impl MessageRowStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CONVERSATIONS_TABLE)?;
        write_txn.open_table(MESSAGES_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Read a consistent snapshot of one conversation.
    pub fn load(&self, id: &str) -> Result<ConversationRows> {
        validate_id(id)?;
        let read_txn = self.db.begin_read()?;
        let conversations = read_txn.open_table(CONVERSATIONS_TABLE)?;
        let messages = read_txn.open_table(MESSAGES_TABLE)?;
        collect_snapshot(&conversations, &messages, id)
    }

    /// Run a read-modify-write against one conversation.
    ///
    /// `apply` receives the current snapshot and returns the batch to commit
    /// together with its result. If it fails, the transaction is aborted and
    /// nothing is written.
    pub fn transact<T, E, F>(&self, id: &str, apply: F) -> std::result::Result<T, E>
    where
        F: FnOnce(ConversationRows) -> std::result::Result<(RowBatch, T), E>,
        E: From<anyhow::Error>,
    {
        validate_id(id)?;
        let write_txn = self.db.begin_write().map_err(anyhow::Error::from)?;
        let snapshot = {
            let conversations = write_txn
                .open_table(CONVERSATIONS_TABLE)
                .map_err(anyhow::Error::from)?;
            let messages = write_txn
                .open_table(MESSAGES_TABLE)
                .map_err(anyhow::Error::from)?;
            collect_snapshot(&conversations, &messages, id)?
        };

        let (batch, value) = match apply(snapshot) {
            Ok(result) => result,
            Err(e) => {
                if let Err(abort_err) = write_txn.abort() {
                    tracing::warn!(conversation_id = id, error = %abort_err, "Failed to abort transaction");
                }
                return Err(e);
            }
        };

        if !batch.is_empty() {
            apply_batch(&write_txn, id, batch)?;
        }
        write_txn.commit().map_err(anyhow::Error::from)?;
        Ok(value)
    }

    /// List all raw conversation records
    pub fn list_conversations_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;

        let mut conversations = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            conversations.push((key.value().to_string(), value.value().to_vec()));
        }

        Ok(conversations)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
        Ok(table.get(id)?.is_some())
    }

    /// Delete a conversation and every one of its rows.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut conversations = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;

            let existed = conversations.remove(id)?.is_some();

            let (start, end) = prefix_range(&conversation_prefix(id));
            let mut keys = Vec::new();
            for item in messages.range(start.as_str()..end.as_str())? {
                let (key, _) = item?;
                keys.push(key.value().to_string());
            }
            for key in &keys {
                messages.remove(key.as_str())?;
            }
            tracing::debug!(conversation_id = id, rows = keys.len(), "Deleted message rows");
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

fn collect_snapshot(
    conversations: &impl ReadableTable<&'static str, &'static [u8]>,
    messages: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<ConversationRows> {
    let conversation = conversations.get(id)?.map(|data| data.value().to_vec());

    let (start, end) = prefix_range(&conversation_prefix(id));
    let mut rows = Vec::new();
    for item in messages.range(start.as_str()..end.as_str())? {
        let (_, value) = item?;
        rows.push(value.value().to_vec());
    }

    Ok(ConversationRows { conversation, rows })
}

fn apply_batch(write_txn: &WriteTransaction, id: &str, batch: RowBatch) -> Result<()> {
    let mut conversations = write_txn.open_table(CONVERSATIONS_TABLE)?;
    let mut messages = write_txn.open_table(MESSAGES_TABLE)?;

    if let Some(data) = batch.conversation {
        conversations.insert(id, data.as_slice())?;
    }
    for row in batch.deletes {
        let key = row_key(id, row.position, &row.message_id);
        messages.remove(key.as_str())?;
    }
    for (row, data) in batch.puts {
        let key = row_key(id, row.position, &row.message_id);
        messages.insert(key.as_str(), data.as_slice())?;
    }
    Ok(())
}
