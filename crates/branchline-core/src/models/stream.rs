//! Events exchanged while streaming a response.

use serde::{Deserialize, Serialize};

use super::content::SurfaceKind;

/// Event produced by the upstream model/agent source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    SurfaceContent {
        content_id: String,
        #[serde(default)]
        content_type: SurfaceKind,
        #[serde(default)]
        title: Option<String>,
        content: String,
    },
    SessionId {
        session_id: String,
    },
    Done,
    Error {
        content: String,
    },
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }
}

/// Event generated by the coordinator itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Id of the assistant message being streamed into; always sent first.
    MessageId { id: String },
    Stopped { content: String },
}

/// Event delivered to the client of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientEvent {
    Control(ControlEvent),
    Upstream(StreamEvent),
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Control(ControlEvent::Stopped { .. })
                | Self::Upstream(StreamEvent::Done)
                | Self::Upstream(StreamEvent::Error { .. })
        )
    }
}

/// Whether a stream can be stopped by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Agent sessions with tools, long enough to need a stop control.
    Cancelable,
    /// Plain completions.
    NonCancelable,
}

/// Snapshot of a conversation's streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub streaming: bool,
    pub kind: Option<StreamKind>,
    pub stoppable: bool,
}

impl StreamStatus {
    pub const IDLE: StreamStatus = StreamStatus {
        streaming: false,
        kind: None,
        stoppable: false,
    };
}

/// Operator-facing view of a running cancelable stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveStream {
    pub conversation_id: String,
    pub task_id: String,
    pub title: Option<String>,
    pub started_at: i64,
    pub elapsed_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upstream_events_parse_by_type() {
        let event: StreamEvent =
            serde_json::from_value(json!({"type": "text", "content": "hel"})).unwrap();
        assert_eq!(event, StreamEvent::text("hel"));

        let done: StreamEvent = serde_json::from_value(json!({"type": "done"})).unwrap();
        assert_eq!(done, StreamEvent::Done);

        let surface: StreamEvent = serde_json::from_value(json!({
            "type": "surface_content",
            "content_id": "s1",
            "content": "<p>x</p>"
        }))
        .unwrap();
        assert!(matches!(
            surface,
            StreamEvent::SurfaceContent {
                content_type: SurfaceKind::Html,
                ..
            }
        ));
    }

    #[test]
    fn test_client_events_serialize_flat() {
        let control = ClientEvent::Control(ControlEvent::MessageId { id: "m1".into() });
        assert_eq!(
            serde_json::to_value(&control).unwrap(),
            json!({"type": "message_id", "id": "m1"})
        );

        let upstream = ClientEvent::Upstream(StreamEvent::text("a"));
        assert_eq!(
            serde_json::to_value(&upstream).unwrap(),
            json!({"type": "text", "content": "a"})
        );
        assert!(ClientEvent::Upstream(StreamEvent::Done).is_terminal());
        assert!(!upstream.is_terminal());
    }
}
