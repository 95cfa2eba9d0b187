//! Message content: plain text or an ordered list of typed blocks.

use serde::{Deserialize, Serialize};

/// Message content as persisted and sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn empty() -> Self {
        Self::Text(String::new())
    }

    /// Collapse a lone text block to plain text, keep everything else as blocks.
    pub fn from_blocks(mut blocks: Vec<ContentBlock>) -> Self {
        if blocks.len() == 1
            && matches!(blocks.first(), Some(ContentBlock::Text { .. }))
            && let Some(ContentBlock::Text { text }) = blocks.pop()
        {
            return Self::Text(text);
        }
        if blocks.is_empty() {
            Self::empty()
        } else {
            Self::Blocks(blocks)
        }
    }

    /// Text used for search and previews.
    ///
    /// Plain content is returned as is; block content joins its text blocks
    /// with newlines.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when any block needs more than text rendering.
    pub fn has_special_blocks(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks
                .iter()
                .any(|block| !matches!(block, ContentBlock::Text { .. })),
        }
    }

    /// Owned block view of the content.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentBlock::Text { text }],
            Self::Blocks(blocks) => blocks,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// One typed content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
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
    SurfaceContent(SurfaceBlock),
    Image {
        source: MediaSource,
    },
    Document {
        source: MediaSource,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Rendered surface kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    #[default]
    Html,
    Markdown,
}

impl SurfaceKind {
    /// Extension of the workspace file holding this surface.
    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "md",
        }
    }
}

/// Where a surface's body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceBody {
    /// Saved to the conversation workspace under this file name.
    File(String),
    Inline(String),
}

/// A rich surface produced by an agent tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSurfaceBlock", into = "RawSurfaceBlock")]
pub struct SurfaceBlock {
    pub content_id: String,
    pub content_type: SurfaceKind,
    pub title: Option<String>,
    pub body: SurfaceBody,
}

#[derive(Serialize, Deserialize)]
struct RawSurfaceBlock {
    content_id: String,
    #[serde(default)]
    content_type: SurfaceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl TryFrom<RawSurfaceBlock> for SurfaceBlock {
    type Error = String;

    fn try_from(raw: RawSurfaceBlock) -> Result<Self, Self::Error> {
        let body = match (raw.filename, raw.content) {
            (Some(filename), None) => SurfaceBody::File(filename),
            (None, Some(content)) => SurfaceBody::Inline(content),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "surface {} has both filename and inline content",
                    raw.content_id
                ));
            }
            (None, None) => {
                return Err(format!("surface {} has no content", raw.content_id));
            }
        };
        Ok(Self {
            content_id: raw.content_id,
            content_type: raw.content_type,
            title: raw.title,
            body,
        })
    }
}

impl From<SurfaceBlock> for RawSurfaceBlock {
    fn from(block: SurfaceBlock) -> Self {
        let (filename, content) = match block.body {
            SurfaceBody::File(filename) => (Some(filename), None),
            SurfaceBody::Inline(content) => (None, Some(content)),
        };
        Self {
            content_id: block.content_id,
            content_type: block.content_type,
            title: block.title,
            filename,
            content,
        }
    }
}

/// Reference to binary media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
    File { file_id: String },
}
