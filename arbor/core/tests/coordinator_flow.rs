//! End-to-end coordinator flows
//!
//! These tests drive the coordinator the way a surface does: send a message,
//! feed the backend's token channel by hand, poll, and check the tree, the
//! emitted events and what reached the repository.
//! Tests cover:
//! - A full exchange producing a reply and a follow-up input
//! - Persisting once per generation rather than once per chunk
//! - Cancellation keeping delivered text plus the stop marker
//! - Failure discarding partial output
//! - Save failures keeping the in-memory tree and warning the surface
//! - Interrupted receives losing no events
//! - Reloading a session from JSON files
//! - Concurrent generations in separate branches and sessions

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

use arbor_core::config::DEFAULT_STOP_MARKER;
use arbor_core::{
    CoordinatorError, CoordinatorEvent, CoordinatorSettings, GenerationBackend, GenerationPhase,
    GenerationResponse, InMemoryModelRegistry, JsonFileRepository, MemoryRepository, ModelConfig,
    ModelRegistry, NodeId, NodeKind, NotifyLevel, ProviderKind, Session, SessionCoordinator,
    SessionId, SessionRepository, StreamingToken, TransportError, Turn,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Backend whose token channels are fed by the test, one per request
#[derive(Default)]
struct ManualBackend {
    senders: Mutex<Vec<mpsc::Sender<StreamingToken>>>,
    requests: Mutex<Vec<Vec<Turn>>>,
}

impl ManualBackend {
    /// Sender for the n-th request
    fn sender(&self, n: usize) -> mpsc::Sender<StreamingToken> {
        self.senders.lock()[n].clone()
    }

    async fn feed(&self, n: usize, tokens: Vec<StreamingToken>) {
        let sender = self.sender(n);
        for token in tokens {
            sender.send(token).await.unwrap();
        }
    }
}

#[async_trait]
impl GenerationBackend for ManualBackend {
    fn name(&self) -> &str {
        "manual"
    }

    async fn health_check(&self, _model: &ModelConfig) -> bool {
        true
    }

    async fn send_streaming(
        &self,
        turns: &[Turn],
        _model: &ModelConfig,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().push(tx);
        self.requests.lock().push(turns.to_vec());
        Ok(rx)
    }

    async fn send(
        &self,
        _turns: &[Turn],
        _model: &ModelConfig,
    ) -> Result<GenerationResponse, TransportError> {
        Ok(GenerationResponse::default())
    }
}

/// Repository that counts whole-session replacements
#[derive(Default)]
struct CountingRepository {
    inner: MemoryRepository,
    replaces: AtomicUsize,
}

impl CountingRepository {
    fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionRepository for CountingRepository {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        self.inner.list_sessions().await
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        self.inner.get_session(id).await
    }

    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        self.inner.create_session(session).await
    }

    async fn replace_session(&self, session: &Session) -> anyhow::Result<()> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_session(session).await
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.inner.delete_session(id).await
    }
}

/// Repository whose whole-session saves always fail
#[derive(Default)]
struct FailingRepository {
    inner: MemoryRepository,
}

#[async_trait]
impl SessionRepository for FailingRepository {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        self.inner.list_sessions().await
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        self.inner.get_session(id).await
    }

    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        self.inner.create_session(session).await
    }

    async fn replace_session(&self, _session: &Session) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.inner.delete_session(id).await
    }
}

/// Log lines written while the guard from [`LogCapture::install`] is held
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn registry() -> Arc<InMemoryModelRegistry> {
    let mut model = ModelConfig::new("local", ProviderKind::Ollama, "qwen3");
    model.is_default = true;
    Arc::new(InMemoryModelRegistry::from_configs([model]))
}

struct Fixture<R> {
    coordinator: SessionCoordinator<Arc<R>, Arc<ManualBackend>>,
    repository: Arc<R>,
    backend: Arc<ManualBackend>,
    events: mpsc::UnboundedReceiver<CoordinatorEvent>,
}

async fn fixture<R: SessionRepository + 'static>(repository: R) -> Fixture<R> {
    let repository = Arc::new(repository);
    let backend = Arc::new(ManualBackend::default());
    let (tx, events) = mpsc::unbounded_channel();
    let mut coordinator = SessionCoordinator::new(
        repository.clone(),
        backend.clone(),
        registry(),
        CoordinatorSettings::default(),
        tx,
    );
    coordinator.start().await.unwrap();
    Fixture {
        coordinator,
        repository,
        backend,
        events,
    }
}

fn root<R: SessionRepository>(f: &Fixture<R>) -> NodeId {
    f.coordinator.active_session().unwrap().root_id.clone()
}

fn composite<R: SessionRepository>(
    f: &Fixture<R>,
    id: &NodeId,
) -> (String, Option<String>, Option<String>) {
    let session = f.coordinator.active_session().unwrap();
    match &session.node(id).unwrap().kind {
        NodeKind::Composite {
            user_message,
            assistant_message,
            thinking,
        } => (
            user_message.clone(),
            assistant_message.clone(),
            thinking.clone(),
        ),
        other => panic!("expected a composite node, got {}", other.label()),
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Full Exchange
// =============================================================================

#[tokio::test]
async fn test_full_exchange_spawns_follow_up_input() {
    let mut f = fixture(CountingRepository::default()).await;
    let root = root(&f);

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    assert!(f.coordinator.is_generating(&root));
    assert_eq!(f.backend.requests.lock()[0], vec![Turn::user("Hi")]);

    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("Hello ".to_string()),
                StreamingToken::Content("there".to_string()),
                StreamingToken::Complete,
            ],
        )
        .await;
    let outcome = f.coordinator.wait_for_generation(&root).await.unwrap();

    assert_eq!(outcome.phase, GenerationPhase::Completed);
    assert_eq!(
        composite(&f, &root),
        ("Hi".to_string(), Some("Hello there".to_string()), None)
    );

    let child = outcome.child_id.expect("completed generation adds an input");
    let session = f.coordinator.active_session().unwrap();
    let child_node = session.node(&child).unwrap();
    assert!(child_node.is_pending_input());
    assert_eq!(child_node.parent.as_ref(), Some(&root));
    assert!(child_node.position.y > session.node(&root).unwrap().position.y);
    assert_eq!(f.coordinator.selected_node(), Some(&child));
    assert!(session.is_well_formed());

    let events = drain(&mut f.events);
    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            CoordinatorEvent::Chunk { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["Hello ", "there"]);
    assert!(events.contains(&CoordinatorEvent::GenerationFinished {
        node_id: root.clone(),
        phase: GenerationPhase::Completed,
        child_id: Some(child.clone()),
    }));

    let stored = f
        .repository
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&stored, session);
}

#[tokio::test]
async fn test_reasoning_is_kept_apart_from_reply() {
    let mut f = fixture(MemoryRepository::new()).await;
    let root = root(&f);

    f.coordinator.send_message(&root, "2+2?", None).await.unwrap();
    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Reasoning("add them".to_string()),
                StreamingToken::Content("4".to_string()),
                StreamingToken::Complete,
            ],
        )
        .await;
    f.coordinator.wait_for_generation(&root).await.unwrap();

    assert_eq!(
        composite(&f, &root),
        (
            "2+2?".to_string(),
            Some("4".to_string()),
            Some("add them".to_string())
        )
    );
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn test_chunks_are_not_persisted_individually() {
    let mut f = fixture(CountingRepository::default()).await;
    let root = root(&f);

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    let after_send = f.repository.replaces();

    for word in ["one ", "two ", "three"] {
        f.backend
            .feed(0, vec![StreamingToken::Content(word.to_string())])
            .await;
        let finished = f.coordinator.poll_streaming().await;
        assert!(finished.is_empty());
    }
    assert_eq!(f.repository.replaces(), after_send);
    assert_eq!(composite(&f, &root).1, Some("one two three".to_string()));

    f.backend.feed(0, vec![StreamingToken::Complete]).await;
    let finished = f.coordinator.poll_streaming().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(f.repository.replaces(), after_send + 1);
}

#[tokio::test]
async fn test_save_failure_keeps_memory_state_and_warns() {
    let logs = LogCapture::default();
    let _guard = logs.install();

    let mut f = fixture(FailingRepository::default()).await;
    let root = root(&f);
    drain(&mut f.events);

    f.coordinator.update_draft(&root, "kept").await.unwrap();
    assert_eq!(
        f.coordinator.active_session().unwrap().node(&root).unwrap().kind,
        NodeKind::PendingInput {
            draft: "kept".to_string()
        }
    );

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("Hello".to_string()),
                StreamingToken::Complete,
            ],
        )
        .await;
    let outcome = f.coordinator.wait_for_generation(&root).await.unwrap();
    assert_eq!(outcome.phase, GenerationPhase::Completed);
    assert_eq!(
        composite(&f, &root),
        ("Hi".to_string(), Some("Hello".to_string()), None)
    );
    let child = outcome.child_id.expect("completed generation adds an input");
    assert!(f.coordinator.active_session().unwrap().node(&child).is_some());

    let warnings: Vec<String> = drain(&mut f.events)
        .into_iter()
        .filter_map(|e| match e {
            CoordinatorEvent::Notify {
                level: NotifyLevel::Warning,
                message,
            } => Some(message),
            _ => None,
        })
        .collect();
    // One per operation: the draft edit, the send and the completion
    assert_eq!(warnings.len(), 3);
    assert!(warnings.iter().all(|m| m.contains("disk full")));

    let logged = logs.contents();
    assert!(logged.contains("Failed to persist session"), "{logged}");
    assert!(logged.contains("disk full"), "{logged}");
}

// =============================================================================
// Cancellation and Failure
// =============================================================================

#[tokio::test]
async fn test_interrupted_receive_loses_nothing() {
    let mut f = fixture(CountingRepository::default()).await;
    let root = root(&f);
    f.coordinator.send_message(&root, "Hi", None).await.unwrap();

    // Give up on a receive that has nothing to deliver yet
    let waited = tokio::time::timeout(
        Duration::from_millis(20),
        f.coordinator.next_generation_event(&root),
    )
    .await;
    assert!(waited.is_err());
    assert!(f.coordinator.is_generating(&root));

    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("Hello".to_string()),
                StreamingToken::Complete,
            ],
        )
        .await;
    let chunk = f.coordinator.next_generation_event(&root).await.unwrap();
    assert!(f.coordinator.apply_generation_event(chunk).await.is_none());

    // Once the terminal event is taken the generation can no longer be
    // cancelled, but applying it still settles and saves the node
    let terminal = f.coordinator.next_generation_event(&root).await.unwrap();
    assert!(!f.coordinator.is_generating(&root));
    assert_eq!(
        f.coordinator.cancel_generation(&root).await,
        Err(CoordinatorError::NotGenerating(root.clone()))
    );
    let before = f.repository.replaces();
    let outcome = f
        .coordinator
        .apply_generation_event(terminal)
        .await
        .expect("terminal event finishes the generation");
    assert_eq!(outcome.phase, GenerationPhase::Completed);
    assert_eq!(f.repository.replaces(), before + 1);

    let session = f.coordinator.active_session().unwrap();
    let stored = f
        .repository
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&stored, session);
    assert!(stored.node(&outcome.child_id.unwrap()).is_some());
}

#[tokio::test]
async fn test_cancel_keeps_delivered_text_with_marker() {
    let mut f = fixture(CountingRepository::default()).await;
    let root = root(&f);

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    let after_send = f.repository.replaces();
    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("Hel".to_string()),
                StreamingToken::Content("lo".to_string()),
            ],
        )
        .await;

    let outcome = f.coordinator.cancel_generation(&root).await.unwrap();
    assert_eq!(outcome.phase, GenerationPhase::Cancelled);
    assert!(outcome.child_id.is_some());
    assert!(!f.coordinator.is_generating(&root));
    assert_eq!(
        composite(&f, &root).1,
        Some(format!("Hello{DEFAULT_STOP_MARKER}"))
    );
    assert_eq!(f.repository.replaces(), after_send + 1);

    // Late tokens after cancellation are ignored
    let _ = f
        .backend
        .sender(0)
        .send(StreamingToken::Content("ignored".to_string()))
        .await;
    assert!(f.coordinator.poll_streaming().await.is_empty());
    assert_eq!(
        composite(&f, &root).1,
        Some(format!("Hello{DEFAULT_STOP_MARKER}"))
    );
}

#[tokio::test]
async fn test_failure_discards_partial_reply() {
    let mut f = fixture(CountingRepository::default()).await;
    let root = root(&f);

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("partial".to_string()),
                StreamingToken::Error(TransportError::Stream("connection reset".to_string())),
            ],
        )
        .await;
    let outcome = f.coordinator.wait_for_generation(&root).await.unwrap();

    assert_eq!(outcome.phase, GenerationPhase::Failed);
    assert_eq!(outcome.child_id, None);
    assert_eq!(
        outcome.error,
        Some(TransportError::Stream("connection reset".to_string()))
    );
    assert_eq!(composite(&f, &root), ("Hi".to_string(), None, None));
    assert_eq!(f.coordinator.active_session().unwrap().node_count(), 1);

    let events = drain(&mut f.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoordinatorEvent::GenerationFailed { node_id, .. } if *node_id == root
    )));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_sibling_branches_stream_independently() {
    let mut f = fixture(MemoryRepository::new()).await;
    let root = root(&f);
    let left = f.coordinator.branch_from(&root).await.unwrap();
    let right = f.coordinator.branch_from(&root).await.unwrap();

    f.coordinator.send_message(&left, "left?", None).await.unwrap();
    f.coordinator.send_message(&right, "right?", None).await.unwrap();
    assert_eq!(f.coordinator.active_generations(), 2);

    f.backend
        .feed(1, vec![StreamingToken::Content("R".to_string())])
        .await;
    f.backend
        .feed(0, vec![StreamingToken::Content("L".to_string())])
        .await;
    f.backend.feed(1, vec![StreamingToken::Complete]).await;

    let finished = f.coordinator.poll_streaming().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].node_id, right);
    assert!(f.coordinator.is_generating(&left));
    assert_eq!(composite(&f, &left).1, Some("L".to_string()));
    assert_eq!(composite(&f, &right).1, Some("R".to_string()));
}

#[tokio::test]
async fn test_generation_continues_after_switching_sessions() {
    let mut f = fixture(MemoryRepository::new()).await;
    let first = f.coordinator.active_session_id().unwrap().clone();
    let root = root(&f);

    f.coordinator.send_message(&root, "Hi", None).await.unwrap();
    let second = f.coordinator.create_session("Other").await.unwrap();
    assert_eq!(f.coordinator.active_session_id(), Some(&second));

    f.backend
        .feed(
            0,
            vec![
                StreamingToken::Content("Still here".to_string()),
                StreamingToken::Complete,
            ],
        )
        .await;
    let finished = f.coordinator.poll_streaming().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].session_id, first);

    let stored = f.repository.get_session(&first).await.unwrap().unwrap();
    match &stored.node(&root).unwrap().kind {
        NodeKind::Composite {
            assistant_message, ..
        } => assert_eq!(assistant_message.as_deref(), Some("Still here")),
        other => panic!("unexpected node kind {}", other.label()),
    }
}

// =============================================================================
// Reload
// =============================================================================

#[tokio::test]
async fn test_json_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let session_id;
    let child;
    {
        let repository = JsonFileRepository::open(dir.path()).await.unwrap();
        let mut f = fixture(repository).await;
        let root = root(&f);
        session_id = f.coordinator.active_session_id().unwrap().clone();

        f.coordinator.send_message(&root, "Remember me", None).await.unwrap();
        f.backend
            .feed(
                0,
                vec![
                    StreamingToken::Content("Noted".to_string()),
                    StreamingToken::Complete,
                ],
            )
            .await;
        child = f
            .coordinator
            .wait_for_generation(&root)
            .await
            .unwrap()
            .child_id
            .unwrap();
    }

    let repository = JsonFileRepository::open(dir.path()).await.unwrap();
    let f = fixture(repository).await;
    assert_eq!(f.coordinator.active_session_id(), Some(&session_id));
    // The newest pending input is selected on activation
    assert_eq!(f.coordinator.selected_node(), Some(&child));
    let session = f.coordinator.active_session().unwrap();
    assert_eq!(session.node_count(), 2);
    assert!(session.is_well_formed());
    assert_eq!(session.node(&session.root_id).unwrap().model.as_deref(), Some("local"));
}

#[tokio::test]
async fn test_default_model_is_exclusive() {
    let registry = registry();
    let mut remote = ModelConfig::new("remote", ProviderKind::OpenAi, "gpt-4o");
    remote.is_default = true;
    registry.add(remote).unwrap();

    let defaults: Vec<String> = registry
        .list()
        .into_iter()
        .filter(|m| m.is_default)
        .map(|m| m.id)
        .collect();
    assert_eq!(defaults, vec!["remote".to_string()]);

    registry.set_default("local").unwrap();
    assert_eq!(registry.default_model().unwrap().id, "local");
    assert_eq!(registry.list().iter().filter(|m| m.is_default).count(), 1);
}
