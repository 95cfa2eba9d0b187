//! Agent session startup parameters.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{AgentSettings, Conversation};

/// Everything needed to start an agent session without touching storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupParams {
    /// Where the agent runs its tools. The configured `cwd` when it exists,
    /// otherwise the conversation workspace.
    pub workspace_path: PathBuf,
    pub memory_path: PathBuf,
    /// Settings after the `defaults < project < conversation` cascade.
    pub settings: AgentSettings,
    pub enabled_tools: BTreeMap<String, bool>,
    pub thinking_budget: u32,
    pub session_token: Option<String>,
}

impl StartupParams {
    /// Create the workspace and memory directories and resolve settings.
    ///
    /// `memory_root` holds one directory per conversation.
    pub fn prepare(
        conversation: &Conversation,
        workspace: &Path,
        memory_root: &Path,
        defaults: &AgentSettings,
        project: Option<&AgentSettings>,
    ) -> Result<Self> {
        std::fs::create_dir_all(workspace).with_context(|| {
            format!("Failed to create workspace {}", workspace.display())
        })?;
        let memory_path = memory_root.join(&conversation.id);
        std::fs::create_dir_all(&memory_path).with_context(|| {
            format!("Failed to create memory directory {}", memory_path.display())
        })?;

        let settings = AgentSettings::cascade(
            std::iter::once(defaults)
                .chain(project)
                .chain(std::iter::once(&conversation.settings)),
        );

        let workspace_path = match settings.cwd.as_deref() {
            Some(cwd) if cwd.is_dir() => cwd.to_path_buf(),
            Some(cwd) => {
                debug!(
                    conversation_id = %conversation.id,
                    cwd = %cwd.display(),
                    "Configured cwd is not a directory; using workspace"
                );
                workspace.to_path_buf()
            }
            None => workspace.to_path_buf(),
        };

        Ok(Self {
            workspace_path,
            memory_path,
            enabled_tools: settings.enabled_tools(),
            thinking_budget: settings.resolved_thinking_budget(),
            session_token: conversation.session_token.clone(),
            settings,
        })
    }
}
