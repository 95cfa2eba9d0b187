//! Conversation and message models.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::content::MessageContent;
use super::settings::AgentSettings;
use crate::branch::BranchPath;
use crate::version::VersionInfo;

/// Role of a message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One stored message version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Content may only change while this is set.
    #[serde(default)]
    pub streaming: bool,
    pub created_at: i64,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            streaming: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// Message as returned to callers, with its place in the branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub position: usize,
    /// Index among the branch's user messages, set for user messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_msg_index: Option<usize>,
    #[serde(flatten)]
    pub version: VersionInfo,
}

/// Conversation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub is_agent: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub current_branch: BranchPath,
    /// Resumable agent session token.
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub settings: AgentSettings,
}

impl Conversation {
    pub fn new(request: NewConversation) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            title: request.title,
            model: request.model,
            system_prompt: request.system_prompt,
            is_agent: request.is_agent,
            created_at: now,
            updated_at: now,
            current_branch: BranchPath::root(),
            session_token: None,
            settings: request.settings.unwrap_or_default(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    pub fn apply_update(&mut self, update: ConversationUpdate) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        if let Some(system_prompt) = update.system_prompt {
            self.system_prompt = Some(system_prompt);
        }
        if let Some(settings) = update.settings {
            self.settings = settings;
        }
        self.touch();
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            model: self.model.clone(),
            is_agent: self.is_agent,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn matches_title(&self, needle_lowercase: &str) -> bool {
        self.title.to_lowercase().contains(needle_lowercase)
    }
}

/// Conversation resolved along one branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// Branch the messages were resolved along.
    pub branch: BranchPath,
    pub messages: Vec<MessageView>,
}

/// Listing/search entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model: Option<String>,
    pub is_agent: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters for creating a conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub title: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub is_agent: bool,
    pub settings: Option<AgentSettings>,
}

impl NewConversation {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn agent(mut self) -> Self {
        self.is_agent = true;
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// Partial metadata update; unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub settings: Option<AgentSettings>,
}

/// Sort newest first, as listings and search results are returned.
pub fn sort_by_recent(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation_starts_at_root() {
        let conversation = Conversation::new(NewConversation::new("Trip").with_model("m-1"));
        assert_eq!(conversation.current_branch, BranchPath::root());
        assert_eq!(conversation.model.as_deref(), Some("m-1"));
        assert_eq!(conversation.created_at, conversation.updated_at);
    }

    #[test]
    fn test_metadata_tolerates_missing_optional_fields() {
        let conversation: Conversation = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "title": "Old",
            "created_at": 1,
            "updated_at": 2
        }))
        .unwrap();
        assert_eq!(conversation.current_branch, BranchPath::root());
        assert!(conversation.session_token.is_none());
        assert!(!conversation.is_agent);
    }

    #[test]
    fn test_message_view_flattens_version() {
        let view = MessageView {
            message: Message::new(Role::User, MessageContent::text("hi")),
            position: 0,
            user_msg_index: Some(0),
            version: VersionInfo {
                current_version: 2,
                total_versions: 3,
            },
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["current_version"], 2);
        assert_eq!(value["total_versions"], 3);
    }

    #[test]
    fn test_update_leaves_unset_fields() {
        let mut conversation =
            Conversation::new(NewConversation::new("Trip").with_system_prompt("be brief"));
        conversation.apply_update(ConversationUpdate {
            title: Some("Trip 2".into()),
            ..ConversationUpdate::default()
        });
        assert_eq!(conversation.title, "Trip 2");
        assert_eq!(conversation.system_prompt.as_deref(), Some("be brief"));
    }
}
