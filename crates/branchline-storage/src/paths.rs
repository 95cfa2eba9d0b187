//! Path utilities for Branchline directory resolution.

use anyhow::Result;
use std::path::PathBuf;

const BRANCHLINE_DIR: &str = ".branchline";
const CONVERSATIONS_DIR: &str = "conversations";
const WORKSPACES_DIR: &str = "workspaces";
const DATABASE_FILE: &str = "conversations.db";
const CONFIG_FILE: &str = "config.toml";
const MEMORY_DIR: &str = "memory";

/// Environment variable to override the Branchline directory.
const BRANCHLINE_DIR_ENV: &str = "BRANCHLINE_DIR";

/// Resolve the Branchline data directory.
/// Priority: BRANCHLINE_DIR env var > ~/.branchline/
pub fn resolve_branchline_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(BRANCHLINE_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(BRANCHLINE_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the Branchline directory exists and return its path.
pub fn ensure_branchline_dir() -> Result<PathBuf> {
    let dir = resolve_branchline_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory holding one subdirectory per conversation (file backend).
pub fn conversations_dir(base: &std::path::Path) -> PathBuf {
    base.join(CONVERSATIONS_DIR)
}

/// Directory holding agent workspaces for the table backend.
pub fn workspaces_dir(base: &std::path::Path) -> PathBuf {
    base.join(WORKSPACES_DIR)
}

/// Database file of the table backend.
pub fn database_path(base: &std::path::Path) -> PathBuf {
    base.join(DATABASE_FILE)
}

/// Per-conversation agent memory, keyed by conversation id below this directory.
pub fn memory_dir(base: &std::path::Path) -> PathBuf {
    base.join(MEMORY_DIR)
}

/// Default location of `config.toml`.
pub fn config_path(base: &std::path::Path) -> PathBuf {
    base.join(CONFIG_FILE)
}
