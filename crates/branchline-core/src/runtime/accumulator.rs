//! Folds upstream stream events into message content blocks.

use std::path::PathBuf;
use tracing::warn;

use crate::models::{ContentBlock, MessageContent, SurfaceBlock, SurfaceBody, SurfaceKind};

pub const STOP_MARKER: &str = "*[Response stopped by user]*";

/// Builds the content of the message being streamed.
#[derive(Debug, Default)]
pub struct ContentAccumulator {
    blocks: Vec<ContentBlock>,
    workspace: Option<PathBuf>,
}

impl ContentAccumulator {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        Self {
            blocks: Vec::new(),
            workspace,
        }
    }

    pub fn push_text(&mut self, delta: &str) {
        if let Some(ContentBlock::Text { text }) = self.blocks.last_mut() {
            text.push_str(delta);
        } else {
            self.blocks.push(ContentBlock::text(delta));
        }
    }

    pub fn push_thinking(&mut self, delta: &str) {
        if let Some(ContentBlock::Thinking { thinking }) = self.blocks.last_mut() {
            thinking.push_str(delta);
        } else {
            self.blocks.push(ContentBlock::Thinking {
                thinking: delta.to_string(),
            });
        }
    }

    pub fn push_block(&mut self, block: ContentBlock) {
        self.blocks.push(block);
    }

    /// Record a surface, saving its body to the workspace when one exists.
    pub fn push_surface(
        &mut self,
        content_id: &str,
        content_type: SurfaceKind,
        title: Option<String>,
        content: String,
    ) {
        let body = match self.write_surface(content_id, content_type, &content) {
            Some(filename) => SurfaceBody::File(filename),
            None => SurfaceBody::Inline(content),
        };
        self.blocks.push(ContentBlock::SurfaceContent(SurfaceBlock {
            content_id: content_id.to_string(),
            content_type,
            title,
            body,
        }));
    }

    /// Append the stop marker, separated from existing text by a blank line.
    pub fn push_stop_marker(&mut self) {
        match self.blocks.last_mut() {
            Some(ContentBlock::Text { text }) if !text.is_empty() => {
                text.push_str("\n\n");
                text.push_str(STOP_MARKER);
            }
            Some(_) => self.blocks.push(ContentBlock::text(format!("\n\n{STOP_MARKER}"))),
            None => self.blocks.push(ContentBlock::text(STOP_MARKER)),
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn content(&self) -> MessageContent {
        MessageContent::from_blocks(self.blocks.clone())
    }

    fn write_surface(&self, content_id: &str, kind: SurfaceKind, content: &str) -> Option<String> {
        let workspace = self.workspace.as_ref()?;
        let filename = format!(
            "surface_{}.{}",
            sanitize_file_stem(content_id),
            kind.file_extension()
        );
        match std::fs::write(workspace.join(&filename), content) {
            Ok(()) => Some(filename),
            Err(e) => {
                warn!(content_id, error = %e, "Failed to save surface; storing inline");
                None
            }
        }
    }
}

fn sanitize_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() { "surface".to_string() } else { stem }
}
