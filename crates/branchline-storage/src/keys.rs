//! Composite keys and range helpers for prefix scans.

use anyhow::{Result, bail};

/// Separator between the components of a message row key.
pub const KEY_SEPARATOR: char = ':';

/// Calculate the exclusive end bound for a prefix range query.
///
/// Given prefix "conv-001:", returns "conv-001;" (next ASCII char after ':').
/// This allows efficient range scans: range(prefix..end_prefix)
pub fn prefix_end_bound(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }

    let mut bytes = prefix.as_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        *last = last.saturating_add(1);
    }

    String::from_utf8(bytes).unwrap_or_else(|_| format!("{}\x7F", prefix))
}

/// Create a prefix range for redb queries.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), prefix_end_bound(prefix))
}

/// Reject ids that would break key layout or escape a directory.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("Identifier must not be empty");
    }
    if id == "." || id == ".." {
        bail!("Identifier '{}' is reserved", id);
    }
    if id
        .chars()
        .any(|c| c == KEY_SEPARATOR || c == '/' || c == '\\' || c.is_control())
    {
        bail!("Identifier '{}' contains a reserved character", id);
    }
    Ok(())
}

/// Prefix covering every row belonging to a conversation.
pub fn conversation_prefix(conversation_id: &str) -> String {
    format!("{}{}", conversation_id, KEY_SEPARATOR)
}

/// Key of one message row: `{conversation}:{position:010}:{message}`.
///
/// Positions are zero-padded so lexical order matches numeric order.
pub fn row_key(conversation_id: &str, position: u32, message_id: &str) -> String {
    format!("{conversation_id}{KEY_SEPARATOR}{position:010}{KEY_SEPARATOR}{message_id}")
}
