pub mod content;
pub mod conversation;
pub mod settings;
pub mod stream;

pub use content::{ContentBlock, MediaSource, MessageContent, SurfaceBlock, SurfaceBody, SurfaceKind};
pub use conversation::{
    Conversation, ConversationSummary, ConversationUpdate, ConversationView, Message, MessageView,
    NewConversation, Role, sort_by_recent,
};
pub use settings::{
    AgentSettings, DEFAULT_THINKING_BUDGET, MAX_THINKING_BUDGET, MIN_THINKING_BUDGET,
    clamp_thinking_budget,
};
pub use stream::{ActiveStream, ClientEvent, ControlEvent, StreamEvent, StreamKind, StreamStatus};
