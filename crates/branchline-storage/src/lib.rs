//! Branchline Storage - byte-level persistence for branchable conversations
//!
//! This crate knows nothing about messages or branches as domain types. It
//! stores opaque bytes under keys chosen by the typed layer in
//! `branchline-core`, for the two backend layouts:
//!
//! - [`BranchRecordStorage`] - one directory per conversation holding a
//!   `metadata.json` record plus one JSON record per branch key.
//! - [`MessageRowStorage`] - a redb database with a `conversations` table and a
//!   `conversation_messages` table keyed by `conversation:position:message`.

pub mod branch_records;
pub mod keys;
pub mod message_rows;
pub mod paths;

pub use branch_records::BranchRecordStorage;
pub use message_rows::{ConversationRows, MessageRowStorage, RowBatch, RowRef};
