//! Drives an upstream event stream into the store.
//!
//! [`StreamCoordinator::prepare`] appends the streaming assistant placeholder
//! and registers the session. [`StreamCoordinator::drive`] consumes the event
//! source, folding events into the placeholder until the source finishes,
//! fails or the session is stopped. The final write always happens before
//! `drive` returns.

use futures::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::accumulator::ContentAccumulator;
use super::steer::{SteerChannel, SteerContext};
use super::stream_registry::{StreamHandle, StreamSessionRegistry};
use crate::branch::BranchPath;
use crate::config::StreamingConfig;
use crate::error::StoreResult;
use crate::models::{
    ClientEvent, ContentBlock, ControlEvent, MessageContent, Role, StreamEvent, StreamKind,
};
use crate::storage::ConversationStore;

const STOPPED_MESSAGE: &str = "Stream stopped by user";

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub conversation_id: String,
    /// Branch to append to; the conversation's current branch when `None`.
    pub branch: Option<BranchPath>,
    pub kind: StreamKind,
    pub title: Option<String>,
}

impl StreamRequest {
    pub fn new(conversation_id: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            branch: None,
            kind,
            title: None,
        }
    }

    pub fn on_branch(mut self, branch: BranchPath) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A registered stream waiting for its event source.
#[derive(Debug)]
pub struct PreparedStream {
    pub conversation_id: String,
    /// The streaming assistant placeholder.
    pub message_id: String,
    pub handle: StreamHandle,
    /// Guidance left by a steer request on the previous stream, already cleared.
    pub steer: Option<SteerContext>,
    /// Where surface files are written; set for agent conversations.
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub message_id: String,
    pub status: StreamEnd,
    pub content: MessageContent,
    pub events_consumed: usize,
    /// Another stream replaced this one in the registry before it ended.
    pub superseded: bool,
}

pub struct StreamCoordinator {
    store: Arc<dyn ConversationStore>,
    sessions: Arc<StreamSessionRegistry>,
    steer: Arc<SteerChannel>,
    config: StreamingConfig,
}

impl StreamCoordinator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        sessions: Arc<StreamSessionRegistry>,
        steer: Arc<SteerChannel>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            steer,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<StreamSessionRegistry> {
        &self.sessions
    }

    pub fn steer_channel(&self) -> &Arc<SteerChannel> {
        &self.steer
    }

    pub fn prepare(&self, request: StreamRequest) -> StoreResult<PreparedStream> {
        let id = request.conversation_id.as_str();
        let conversation = self.store.get_metadata(id)?;
        let placeholder = self.store.add_message(
            id,
            Role::Assistant,
            MessageContent::empty(),
            request.branch.as_ref(),
            true,
        )?;

        let workspace = if conversation.is_agent {
            self.store
                .workspace_path(id)
                .ok()
                .filter(|path| path.is_dir())
        } else {
            None
        };

        let steer = self.steer.take(id);
        if steer.is_some() {
            debug!(conversation_id = id, "Consumed pending steer guidance");
        }
        let handle = self.sessions.start(id, request.kind, request.title);
        info!(
            conversation_id = id,
            message_id = %placeholder.message.id,
            task_id = handle.task_id(),
            "Stream prepared"
        );

        Ok(PreparedStream {
            conversation_id: request.conversation_id,
            message_id: placeholder.message.id,
            handle,
            steer,
            workspace,
        })
    }

    /// Consume `events` until done, error or stop, forwarding to `sink`.
    ///
    /// A closed `sink` does not end the stream; content keeps being persisted.
    pub async fn drive<S>(
        &self,
        prepared: PreparedStream,
        mut events: S,
        sink: mpsc::Sender<ClientEvent>,
    ) -> StoreResult<StreamOutcome>
    where
        S: Stream<Item = anyhow::Result<StreamEvent>> + Unpin,
    {
        let PreparedStream {
            conversation_id,
            message_id,
            handle,
            workspace,
            ..
        } = prepared;
        let id = conversation_id.as_str();
        let cancel = handle
            .cancellation()
            .cloned()
            .unwrap_or_else(CancellationToken::new);
        let persist_every = self.config.persist_every_events.max(1);

        forward(
            &sink,
            &cancel,
            ClientEvent::Control(ControlEvent::MessageId {
                id: message_id.clone(),
            }),
        )
        .await;

        let mut content = ContentAccumulator::new(workspace);
        let mut consumed = 0usize;

        let status = loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Stopped,
                item = events.next() => item,
            };

            let event = match item {
                None => break StreamEnd::Completed,
                Some(Err(e)) => {
                    warn!(conversation_id = id, error = %e, "Event source failed");
                    let message = e.to_string();
                    let error = ClientEvent::Upstream(StreamEvent::error(&message));
                    forward(&sink, &cancel, error).await;
                    break StreamEnd::Failed(message);
                }
                Some(Ok(event)) => event,
            };
            consumed += 1;

            match &event {
                StreamEvent::Text { content: delta } => content.push_text(delta),
                StreamEvent::Thinking { content: delta } => content.push_thinking(delta),
                StreamEvent::ToolUse {
                    id: tool_id,
                    name,
                    input,
                } => content.push_block(ContentBlock::ToolUse {
                    id: tool_id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                StreamEvent::ToolResult {
                    tool_use_id,
                    content: output,
                    is_error,
                } => content.push_block(ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: output.clone(),
                    is_error: *is_error,
                }),
                StreamEvent::SurfaceContent {
                    content_id,
                    content_type,
                    title,
                    content: body,
                } => content.push_surface(content_id, *content_type, title.clone(), body.clone()),
                StreamEvent::SessionId { session_id } => {
                    if let Err(e) = self.store.set_session_token(id, session_id) {
                        warn!(conversation_id = id, error = %e, "Failed to save session token");
                    }
                }
                StreamEvent::Done => {
                    forward(&sink, &cancel, ClientEvent::Upstream(StreamEvent::Done)).await;
                    break StreamEnd::Completed;
                }
                StreamEvent::Error { content: message } => {
                    let message = message.clone();
                    warn!(conversation_id = id, error = %message, "Upstream reported an error");
                    let error = ClientEvent::Upstream(StreamEvent::error(&message));
                    forward(&sink, &cancel, error).await;
                    break StreamEnd::Failed(message);
                }
            }

            if consumed % persist_every == 0 {
                self.persist(id, &message_id, content.content(), true);
            }
            forward(&sink, &cancel, ClientEvent::Upstream(event)).await;

            if cancel.is_cancelled() {
                break StreamEnd::Stopped;
            }
        };

        if status == StreamEnd::Stopped {
            if self.config.append_stop_marker {
                content.push_stop_marker();
            }
            if self.steer.attach_partial(id, content.blocks().to_vec()) {
                debug!(conversation_id = id, "Attached partial content to steer request");
            }
        }

        let final_content = content.content();
        let finalized = self
            .store
            .update_message_content(id, &message_id, final_content.clone(), false);

        if status == StreamEnd::Stopped {
            let stopped = ClientEvent::Control(ControlEvent::Stopped {
                content: STOPPED_MESSAGE.to_string(),
            });
            if let Err(e) = sink.try_send(stopped) {
                debug!(conversation_id = id, error = %e, "Stop notice not delivered");
            }
            info!(conversation_id = id, consumed, "Stream stopped");
        }

        let superseded = !self.sessions.end_if_current(&handle);
        if superseded {
            info!(conversation_id = id, task_id = handle.task_id(), "Stream was superseded");
        }

        if !finalized? {
            warn!(conversation_id = id, message_id = %message_id, "Streamed message vanished before finalization");
        }
        debug!(conversation_id = id, ?status, consumed, "Stream finished");

        Ok(StreamOutcome {
            message_id,
            status,
            content: final_content,
            events_consumed: consumed,
            superseded,
        })
    }

    /// Stop a cancelable stream.
    pub fn stop(&self, id: &str) -> bool {
        self.sessions.stop(id)
    }

    /// Stop a cancelable stream and leave guidance for the next one.
    pub fn request_steer(&self, id: &str, guidance: &str) -> bool {
        if !self.sessions.status(id).stoppable {
            return false;
        }
        self.steer.set(id, guidance, Vec::new());
        if self.sessions.stop(id) {
            info!(conversation_id = id, "Steer requested");
            true
        } else {
            self.steer.clear(id);
            false
        }
    }

    fn persist(&self, id: &str, message_id: &str, content: MessageContent, streaming: bool) {
        match self
            .store
            .update_message_content(id, message_id, content, streaming)
        {
            Ok(true) => {}
            Ok(false) => warn!(conversation_id = id, message_id, "Streamed message not found"),
            Err(e) => warn!(conversation_id = id, message_id, error = %e, "Failed to persist partial content"),
        }
    }
}

/// Send to the client, giving up on the event once a stop is requested.
async fn forward(
    sink: &mpsc::Sender<ClientEvent>,
    cancel: &CancellationToken,
    event: ClientEvent,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => debug!("Stop requested while the client was not reading"),
        sent = sink.send(event) => {
            if sent.is_err() {
                debug!("Client disconnected; continuing without forwarding");
            }
        }
    }
}
