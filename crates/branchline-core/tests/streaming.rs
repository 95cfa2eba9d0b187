//! Streaming coordinator against a real store.

use std::sync::Arc;
use std::time::Duration;

use branchline_core::config::StreamingConfig;
use branchline_core::models::{
    ClientEvent, ContentBlock, ControlEvent, MessageContent, NewConversation, Role, StreamEvent,
    StreamKind,
};
use branchline_core::runtime::{
    STOP_MARKER, SteerChannel, StreamCoordinator, StreamEnd, StreamOutcome, StreamRequest,
    StreamSessionRegistry,
};
use branchline_core::{ConversationStore, FileConversationStore, StoreResult};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

struct Harness {
    store: Arc<dyn ConversationStore>,
    coordinator: Arc<StreamCoordinator>,
    _temp_dir: TempDir,
}

fn harness(persist_every_events: usize) -> Harness {
    let temp_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ConversationStore> =
        Arc::new(FileConversationStore::new(temp_dir.path().join("conversations")).unwrap());
    let coordinator = Arc::new(StreamCoordinator::new(
        store.clone(),
        Arc::new(StreamSessionRegistry::new()),
        Arc::new(SteerChannel::new()),
        StreamingConfig {
            persist_every_events,
            append_stop_marker: true,
        },
    ));
    Harness {
        store,
        coordinator,
        _temp_dir: temp_dir,
    }
}

type Source = mpsc::Sender<anyhow::Result<StreamEvent>>;

struct Running {
    source: Source,
    client: mpsc::Receiver<ClientEvent>,
    message_id: String,
    task: JoinHandle<StoreResult<StreamOutcome>>,
}

impl Harness {
    fn conversation(&self, agent: bool) -> String {
        let request = if agent {
            NewConversation::new("Agent").agent()
        } else {
            NewConversation::new("Chat")
        };
        let id = self.store.create_conversation(request).unwrap().id;
        self.store
            .add_message(&id, Role::User, MessageContent::text("hi"), None, false)
            .unwrap();
        id
    }

    fn start(&self, id: &str, kind: StreamKind) -> Running {
        self.start_with_client_buffer(id, kind, 64)
    }

    fn start_with_client_buffer(&self, id: &str, kind: StreamKind, buffer: usize) -> Running {
        let prepared = self
            .coordinator
            .prepare(StreamRequest::new(id, kind))
            .unwrap();
        let message_id = prepared.message_id.clone();
        let (source, events) = mpsc::channel(16);
        let (sink, client) = mpsc::channel(buffer);
        let coordinator = self.coordinator.clone();
        let task = tokio::spawn(async move {
            coordinator
                .drive(prepared, ReceiverStream::new(events), sink)
                .await
        });
        Running {
            source,
            client,
            message_id,
            task,
        }
    }

    fn assistant_message(&self, id: &str, message_id: &str) -> (MessageContent, bool) {
        let view = self.store.get_conversation(id, None).unwrap();
        let message = view
            .messages
            .into_iter()
            .find(|m| m.message.id == message_id)
            .unwrap()
            .message;
        (message.content, message.streaming)
    }
}

async fn next_event(client: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_message_id_is_sent_first() {
    let h = harness(10);
    let id = h.conversation(false);
    let mut run = h.start(&id, StreamKind::NonCancelable);

    assert_eq!(
        next_event(&mut run.client).await,
        ClientEvent::Control(ControlEvent::MessageId {
            id: run.message_id.clone()
        })
    );
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert!(content.is_empty());
    assert!(streaming);

    run.source.send(Ok(StreamEvent::text("Hello"))).await.unwrap();
    run.source.send(Ok(StreamEvent::Done)).await.unwrap();
    let outcome = run.task.await.unwrap().unwrap();

    assert_eq!(outcome.status, StreamEnd::Completed);
    assert_eq!(outcome.events_consumed, 2);
    assert!(!outcome.superseded);
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text("Hello"));
    assert!(!streaming);
    assert!(!h.coordinator.sessions().is_streaming(&id));
}

#[tokio::test]
async fn test_stop_takes_effect_within_one_event() {
    let h = harness(10);
    let id = h.conversation(true);
    let mut run = h.start(&id, StreamKind::Cancelable);
    next_event(&mut run.client).await;

    run.source.send(Ok(StreamEvent::text("Hel"))).await.unwrap();
    assert_eq!(
        next_event(&mut run.client).await,
        ClientEvent::Upstream(StreamEvent::text("Hel"))
    );

    assert!(h.coordinator.stop(&id));
    for _ in 0..5 {
        let _ = run.source.send(Ok(StreamEvent::text("lo"))).await;
    }

    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Stopped);
    assert_eq!(outcome.events_consumed, 1);

    assert_eq!(
        next_event(&mut run.client).await,
        ClientEvent::Control(ControlEvent::Stopped {
            content: "Stream stopped by user".into()
        })
    );
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text(format!("Hel\n\n{STOP_MARKER}")));
    assert!(!streaming);
    assert!(!h.coordinator.sessions().is_streaming(&id));
}

#[tokio::test]
async fn test_stop_is_not_held_by_a_stalled_client() {
    let h = harness(10);
    let id = h.conversation(true);
    // Room for the message id only; the client never reads.
    let run = h.start_with_client_buffer(&id, StreamKind::Cancelable, 1);

    run.source.send(Ok(StreamEvent::text("partial"))).await.unwrap();
    run.source.send(Ok(StreamEvent::text(" more"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.coordinator.stop(&id));

    let outcome = tokio::time::timeout(Duration::from_secs(5), run.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, StreamEnd::Stopped);
    assert_eq!(outcome.events_consumed, 1);

    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text(format!("partial\n\n{STOP_MARKER}")));
    assert!(!streaming);
    assert!(!h.coordinator.sessions().is_streaming(&id));
    drop(run.client);
}

#[tokio::test]
async fn test_non_cancelable_stream_ignores_stop() {
    let h = harness(10);
    let id = h.conversation(false);
    let mut run = h.start(&id, StreamKind::NonCancelable);
    next_event(&mut run.client).await;

    assert!(!h.coordinator.stop(&id));
    assert!(!h.coordinator.request_steer(&id, "shorter"));
    assert!(!h.coordinator.steer_channel().has_pending(&id));

    run.source.send(Ok(StreamEvent::text("full answer"))).await.unwrap();
    drop(run.source);
    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Completed);
    assert_eq!(outcome.content, MessageContent::text("full answer"));
}

#[tokio::test]
async fn test_steer_carries_partial_output_to_next_stream() {
    let h = harness(10);
    let id = h.conversation(true);
    let mut run = h.start(&id, StreamKind::Cancelable);
    next_event(&mut run.client).await;

    run.source.send(Ok(StreamEvent::text("draft"))).await.unwrap();
    next_event(&mut run.client).await;
    assert!(h.coordinator.request_steer(&id, "be brief"));

    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Stopped);
    assert!(!h.coordinator.sessions().is_streaming(&id));

    let pending = h.coordinator.steer_channel().get(&id).unwrap();
    assert_eq!(pending.guidance, "be brief");
    assert_eq!(
        pending.partial_content,
        vec![ContentBlock::text(format!("draft\n\n{STOP_MARKER}"))]
    );

    let next = h
        .coordinator
        .prepare(StreamRequest::new(&id, StreamKind::Cancelable))
        .unwrap();
    assert_eq!(next.steer.unwrap().guidance, "be brief");
    assert!(h.coordinator.steer_channel().get(&id).is_none());
}

#[tokio::test]
async fn test_upstream_error_terminates_stream() {
    let h = harness(10);
    let id = h.conversation(false);
    let mut run = h.start(&id, StreamKind::NonCancelable);
    next_event(&mut run.client).await;

    run.source.send(Ok(StreamEvent::text("partial"))).await.unwrap();
    run.source.send(Ok(StreamEvent::error("rate limited"))).await.unwrap();
    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Failed("rate limited".into()));

    next_event(&mut run.client).await;
    assert_eq!(
        next_event(&mut run.client).await,
        ClientEvent::Upstream(StreamEvent::error("rate limited"))
    );
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text("partial"));
    assert!(!streaming);
}

#[tokio::test]
async fn test_source_failure_is_forwarded_as_error() {
    let h = harness(10);
    let id = h.conversation(false);
    let mut run = h.start(&id, StreamKind::NonCancelable);
    next_event(&mut run.client).await;

    run.source
        .send(Err(anyhow::anyhow!("connection reset")))
        .await
        .unwrap();
    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Failed("connection reset".into()));
    assert_eq!(
        next_event(&mut run.client).await,
        ClientEvent::Upstream(StreamEvent::error("connection reset"))
    );
}

#[tokio::test]
async fn test_partial_content_persists_on_cadence() {
    let h = harness(3);
    let id = h.conversation(false);
    let mut run = h.start(&id, StreamKind::NonCancelable);
    next_event(&mut run.client).await;

    for delta in ["a", "b"] {
        run.source.send(Ok(StreamEvent::text(delta))).await.unwrap();
        next_event(&mut run.client).await;
    }
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert!(content.is_empty());
    assert!(streaming);

    run.source.send(Ok(StreamEvent::text("c"))).await.unwrap();
    next_event(&mut run.client).await;
    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text("abc"));
    assert!(streaming);

    run.source.send(Ok(StreamEvent::Done)).await.unwrap();
    run.task.await.unwrap().unwrap();
    let (_, streaming) = h.assistant_message(&id, &run.message_id);
    assert!(!streaming);
}

#[tokio::test]
async fn test_session_token_and_tool_blocks() {
    let h = harness(10);
    let id = h.conversation(true);
    let run = h.start(&id, StreamKind::Cancelable);

    let events = [
        StreamEvent::SessionId {
            session_id: "sess-42".into(),
        },
        StreamEvent::Thinking {
            content: "look around".into(),
        },
        StreamEvent::ToolUse {
            id: "t1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        },
        StreamEvent::ToolResult {
            tool_use_id: "t1".into(),
            content: "README.md".into(),
            is_error: false,
        },
        StreamEvent::text("There is a README."),
        StreamEvent::Done,
    ];
    for event in events {
        run.source.send(Ok(event)).await.unwrap();
    }
    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Completed);

    assert_eq!(
        h.store.get_metadata(&id).unwrap().session_token.as_deref(),
        Some("sess-42")
    );
    let (content, _) = h.assistant_message(&id, &run.message_id);
    let MessageContent::Blocks(blocks) = content else {
        panic!("expected block content");
    };
    assert_eq!(blocks.len(), 4);
    assert!(matches!(blocks[1], ContentBlock::ToolUse { .. }));
    assert_eq!(blocks[3], ContentBlock::text("There is a README."));
}

#[tokio::test]
async fn test_surface_written_to_agent_workspace() {
    let h = harness(10);
    let id = h.conversation(true);
    let run = h.start(&id, StreamKind::Cancelable);

    run.source
        .send(Ok(StreamEvent::SurfaceContent {
            content_id: "report".into(),
            content_type: Default::default(),
            title: Some("Report".into()),
            content: "<h1>Done</h1>".into(),
        }))
        .await
        .unwrap();
    run.source.send(Ok(StreamEvent::Done)).await.unwrap();
    run.task.await.unwrap().unwrap();

    let workspace = h.store.workspace_path(&id).unwrap();
    let saved = std::fs::read_to_string(workspace.join("surface_report.html")).unwrap();
    assert_eq!(saved, "<h1>Done</h1>");
}

#[tokio::test]
async fn test_closed_client_still_persists() {
    let h = harness(10);
    let id = h.conversation(false);
    let run = h.start(&id, StreamKind::NonCancelable);
    drop(run.client);

    run.source.send(Ok(StreamEvent::text("unseen"))).await.unwrap();
    run.source.send(Ok(StreamEvent::Done)).await.unwrap();
    let outcome = run.task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamEnd::Completed);

    let (content, streaming) = h.assistant_message(&id, &run.message_id);
    assert_eq!(content, MessageContent::text("unseen"));
    assert!(!streaming);
}

#[tokio::test]
async fn test_replaced_stream_reports_superseded() {
    let h = harness(10);
    let id = h.conversation(true);
    let first = h.start(&id, StreamKind::Cancelable);
    let second = h.start(&id, StreamKind::Cancelable);

    drop(first.source);
    let outcome = first.task.await.unwrap().unwrap();
    assert!(outcome.superseded);
    assert!(h.coordinator.sessions().is_streaming(&id));

    drop(second.source);
    let outcome = second.task.await.unwrap().unwrap();
    assert!(!outcome.superseded);
    assert!(!h.coordinator.sessions().is_streaming(&id));
}
