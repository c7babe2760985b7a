//! One state machine per submission.
//!
//! Flow: submit → cancel the previous session → Submitting → (first response
//! byte) Streaming → tokens accumulate and are published → Completed (entry
//! written to history) | Failed (error published) | Cancelled (silent).
//!
//! At most one session is current. A monotonically increasing session id
//! decides whether a token or completion may still apply effects; the
//! transport is not trusted to stop delivery on its own.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ClientError;
use crate::history::HistoryStore;
use crate::models::{GenerationRequest, HistoryEntry, NewHistoryEntry};
use crate::transport::{GenerationBackend, StreamObserver};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Submitting,
    Streaming,
    Completed,
    Failed,
}

impl Phase {
    /// True while a request is outstanding.
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Submitting | Phase::Streaming)
    }
}

/// What the display layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationState {
    pub session: u64,
    pub phase: Phase,
    pub text: String,
    pub error: Option<String>,
}

/// How one `submit` call ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(String),
    Failed(String),
    /// Superseded or aborted. Never shown to the user.
    Cancelled,
}

/// Bookkeeping for one in-flight generation.
#[derive(Debug)]
struct StreamSession {
    id: u64,
    cancel: CancellationToken,
    buffer: String,
    completed: bool,
}

#[derive(Debug, Default)]
struct Active {
    current: u64,
    cancel: Option<CancellationToken>,
}

struct Shared {
    active: Mutex<Active>,
    state: watch::Sender<GenerationState>,
}

impl Shared {
    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> StreamSession {
        let mut active = self.lock();
        active.current += 1;
        let cancel = CancellationToken::new();
        if let Some(previous) = active.cancel.replace(cancel.clone()) {
            debug!("Superseding session {}", active.current - 1);
            previous.cancel();
        }

        let id = active.current;
        self.state.send_modify(|s| {
            s.session = id;
            s.phase = Phase::Submitting;
            s.text.clear();
            s.error = None;
        });

        StreamSession {
            id,
            cancel,
            buffer: String::new(),
            completed: false,
        }
    }

    /// Applies `effect` to the published state only if `session` is still current.
    fn apply_if_current<F>(&self, session: u64, effect: F) -> bool
    where
        F: FnOnce(&mut Active, &mut GenerationState),
    {
        let mut active = self.lock();
        if active.current != session {
            return false;
        }
        self.state.send_modify(|s| effect(&mut *active, s));
        true
    }
}

struct SessionObserver {
    shared: Arc<Shared>,
    session: StreamSession,
}

impl StreamObserver for SessionObserver {
    fn on_open(&mut self) {
        self.shared
            .apply_if_current(self.session.id, |_, s| s.phase = Phase::Streaming);
    }

    fn on_token(&mut self, token: String) {
        let session = &mut self.session;
        if session.completed || session.cancel.is_cancelled() {
            debug!("Discarding token for cancelled session {}", session.id);
            return;
        }

        let applied = self.shared.apply_if_current(session.id, |_, s| {
            session.buffer.push_str(&token);
            s.phase = Phase::Streaming;
            s.text.clone_from(&session.buffer);
        });
        if !applied {
            debug!("Discarding token for superseded session {}", session.id);
        }
    }
}

/// Owns the current session and publishes `GenerationState` to subscribers.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    backend: Arc<dyn GenerationBackend>,
    history: Arc<dyn HistoryStore>,
    shared: Arc<Shared>,
}

impl GenerationOrchestrator {
    pub fn new(backend: Arc<dyn GenerationBackend>, history: Arc<dyn HistoryStore>) -> Self {
        let (state, _) = watch::channel(GenerationState::default());
        Self {
            backend,
            history,
            shared: Arc::new(Shared {
                active: Mutex::new(Active::default()),
                state,
            }),
        }
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn state(&self) -> GenerationState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.shared.state.subscribe()
    }

    /// Runs one generation to its end. A newer `submit` on any clone of this
    /// orchestrator supersedes it; identical inputs are not deduplicated.
    pub async fn submit(&self, request: GenerationRequest) -> Outcome {
        let session = self.shared.begin();
        let cancel = session.cancel.clone();
        info!(
            "Session {} submitted (resume={}, language={})",
            session.id,
            request.resume().filename,
            request.language()
        );

        let mut observer = SessionObserver {
            shared: self.shared.clone(),
            session,
        };
        let result = self
            .backend
            .generate_streamed(&request, &mut observer, &cancel)
            .await;

        self.finish(observer.session, &request, result).await
    }

    async fn finish(
        &self,
        mut session: StreamSession,
        request: &GenerationRequest,
        result: Result<(), ClientError>,
    ) -> Outcome {
        match result {
            Ok(()) => {
                session.completed = true;
                let committed = self.shared.apply_if_current(session.id, |active, s| {
                    active.cancel = None;
                    s.phase = Phase::Completed;
                    s.text.clone_from(&session.buffer);
                });
                if !committed {
                    debug!("Session {} finished after being superseded", session.id);
                    return Outcome::Cancelled;
                }

                info!(
                    "Session {} completed ({} chars)",
                    session.id,
                    session.buffer.chars().count()
                );
                self.record(request, &session.buffer).await;
                Outcome::Completed(session.buffer)
            }
            Err(e) if e.is_cancelled() => {
                debug!("Session {} cancelled", session.id);
                Outcome::Cancelled
            }
            Err(e) => {
                let message = e.user_message();
                let surfaced = self.shared.apply_if_current(session.id, |active, s| {
                    active.cancel = None;
                    s.phase = Phase::Failed;
                    s.error = Some(message.clone());
                });
                if !surfaced {
                    debug!("Dropping error of superseded session {}: {e}", session.id);
                    return Outcome::Cancelled;
                }
                warn!("Session {} failed: {e}", session.id);
                Outcome::Failed(message)
            }
        }
    }

    async fn record(&self, request: &GenerationRequest, content: &str) {
        let entry = NewHistoryEntry::for_request(request, content);
        if let Err(e) = self.history.add(entry).await {
            warn!("Could not record generation in history: {e}");
        }
    }

    /// Aborts the in-flight session, if any. The displayed text stays.
    pub fn cancel(&self) {
        let mut active = self.shared.lock();
        let Some(token) = active.cancel.take() else {
            return;
        };
        token.cancel();
        active.current += 1;

        let id = active.current;
        self.shared.state.send_modify(|s| {
            s.session = id;
            s.phase = Phase::Idle;
        });
        debug!("Session {} aborted", id - 1);
    }

    /// Displays a past letter in place of the current result.
    pub fn show(&self, entry: &HistoryEntry) {
        self.cancel();
        self.shared.state.send_modify(|s| {
            s.phase = Phase::Idle;
            s.text.clone_from(&entry.content);
            s.error = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::history::{HistorySnapshot, LocalHistoryStore};
    use crate::models::{HistoryMetadata, JobSource, Language, ResumeFile};
    use crate::testing::{spawn_fake_backend, FakeState};
    use crate::transport::GenerationClient;

    enum Step {
        Open,
        Token(&'static str),
        Finish,
        Fail(ClientError),
    }

    /// Plays one scripted stream per `generate_streamed` call, in call order.
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<Step>>>,
        honour_cancel: bool,
    }

    impl ScriptedBackend {
        fn new(honour_cancel: bool) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(VecDeque::new()),
                honour_cancel,
            })
        }

        fn script(&self) -> mpsc::UnboundedSender<Step> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate_streamed(
            &self,
            _request: &GenerationRequest,
            observer: &mut dyn StreamObserver,
            cancel: &CancellationToken,
        ) -> Result<(), ClientError> {
            let mut rx = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no script queued");

            loop {
                let step = if self.honour_cancel {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        step = rx.recv() => step,
                    }
                } else {
                    rx.recv().await
                };

                match step {
                    Some(Step::Open) => observer.on_open(),
                    Some(Step::Token(t)) => observer.on_token(t.to_string()),
                    Some(Step::Fail(e)) => return Err(e),
                    Some(Step::Finish) | None => return Ok(()),
                }
            }
        }
    }

    struct FailingHistory;

    #[async_trait]
    impl HistoryStore for FailingHistory {
        fn snapshot(&self) -> HistorySnapshot {
            HistorySnapshot::from(Vec::new())
        }

        fn subscribe(&self) -> watch::Receiver<HistorySnapshot> {
            watch::channel(self.snapshot()).1
        }

        async fn refresh(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn add(&self, _entry: NewHistoryEntry) -> Result<HistoryEntry, ClientError> {
            Err(ClientError::Storage("disk full".to_string()))
        }

        async fn remove(&self, _id: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn clear(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn request(source: JobSource) -> GenerationRequest {
        GenerationRequest::new(
            ResumeFile::new("cv.pdf", b"%PDF-1.4".to_vec()),
            source,
            Language::En,
        )
        .unwrap()
    }

    fn url_request() -> GenerationRequest {
        request(JobSource::Url("https://example.com/job/1".to_string()))
    }

    async fn wait_for_text(orchestrator: &GenerationOrchestrator, text: &str) {
        let mut rx = orchestrator.subscribe();
        rx.wait_for(|s| s.text == text).await.unwrap();
    }

    #[tokio::test]
    async fn test_streamed_tokens_complete_and_are_recorded() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let script = backend.script();
        for step in [
            Step::Open,
            Step::Token("Dear"),
            Step::Token(" Hiring"),
            Step::Token(" Manager"),
            Step::Finish,
        ] {
            script.send(step).ok();
        }

        let outcome = orchestrator.submit(url_request()).await;

        assert_eq!(outcome, Outcome::Completed("Dear Hiring Manager".to_string()));
        let state = orchestrator.state();
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.text, "Dear Hiring Manager");
        assert_eq!(state.error, None);

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "Dear Hiring Manager");
        assert_eq!(snapshot[0].source_label, "example.com");
        assert_eq!(snapshot[0].metadata.resume_filename.as_deref(), Some("cv.pdf"));
        assert_eq!(snapshot[0].metadata.language, Some(Language::En));
    }

    #[tokio::test]
    async fn test_phases_progress_through_submitting_and_streaming() {
        let backend = ScriptedBackend::new(true);
        let orchestrator =
            GenerationOrchestrator::new(backend.clone(), Arc::new(LocalHistoryStore::in_memory()));
        let script = backend.script();

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(url_request()).await })
        };

        let mut rx = orchestrator.subscribe();
        rx.wait_for(|s| s.phase == Phase::Submitting).await.unwrap();
        script.send(Step::Open).ok();
        rx.wait_for(|s| s.phase == Phase::Streaming).await.unwrap();
        script.send(Step::Token("Hi")).ok();
        rx.wait_for(|s| s.text == "Hi").await.unwrap();
        script.send(Step::Finish).ok();

        assert_eq!(running.await.unwrap(), Outcome::Completed("Hi".to_string()));
        assert_eq!(orchestrator.state().phase, Phase::Completed);
    }

    #[tokio::test]
    async fn test_newer_submission_supersedes_older() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let first_script = backend.script();
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(url_request()).await })
        };
        first_script.send(Step::Open).ok();
        first_script.send(Step::Token("old ")).ok();
        wait_for_text(&orchestrator, "old ").await;

        let second_script = backend.script();
        let second = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit(request(JobSource::Text("Rust role".to_string())))
                    .await
            })
        };
        orchestrator
            .subscribe()
            .wait_for(|s| s.session == 2)
            .await
            .unwrap();

        first_script.send(Step::Token("stale")).ok();
        first_script.send(Step::Finish).ok();
        assert_eq!(first.await.unwrap(), Outcome::Cancelled);

        second_script.send(Step::Token("new letter")).ok();
        second_script.send(Step::Finish).ok();
        assert_eq!(
            second.await.unwrap(),
            Outcome::Completed("new letter".to_string())
        );

        assert_eq!(orchestrator.state().text, "new letter");
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "new letter");
        assert_eq!(snapshot[0].source_label, crate::models::request::FREE_TEXT_SOURCE_LABEL);
    }

    #[tokio::test]
    async fn test_token_landing_after_supersession_is_discarded() {
        // This backend keeps delivering after cancellation, like a token that
        // was already scheduled when the new submission arrived.
        let backend = ScriptedBackend::new(false);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let first_script = backend.script();
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(url_request()).await })
        };
        first_script.send(Step::Token("A")).ok();
        wait_for_text(&orchestrator, "A").await;

        let second_script = backend.script();
        let second = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(url_request()).await })
        };
        second_script.send(Step::Token("B")).ok();
        wait_for_text(&orchestrator, "B").await;

        first_script.send(Step::Token("late")).ok();
        first_script.send(Step::Finish).ok();
        assert_eq!(first.await.unwrap(), Outcome::Cancelled);
        assert_eq!(orchestrator.state().text, "B");

        second_script.send(Step::Finish).ok();
        assert_eq!(second.await.unwrap(), Outcome::Completed("B".to_string()));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "B");
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced_without_history() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let script = backend.script();
        script.send(Step::Open).ok();
        script.send(Step::Token("partial")).ok();
        script
            .send(Step::Fail(ClientError::Remote {
                status: 500,
                message: "quota exceeded".to_string(),
            }))
            .ok();

        let outcome = orchestrator.submit(url_request()).await;

        assert_eq!(outcome, Outcome::Failed("quota exceeded".to_string()));
        let state = orchestrator.state();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.error.as_deref(), Some("quota exceeded"));
        assert_eq!(state.text, "partial");
        assert!(history.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_does_not_fail_generation() {
        let backend = ScriptedBackend::new(true);
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(FailingHistory));

        let script = backend.script();
        script.send(Step::Token("kept")).ok();
        script.send(Step::Finish).ok();

        assert_eq!(
            orchestrator.submit(url_request()).await,
            Outcome::Completed("kept".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_session_silently() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let script = backend.script();
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(url_request()).await })
        };
        script.send(Step::Token("so far")).ok();
        wait_for_text(&orchestrator, "so far").await;

        orchestrator.cancel();

        assert_eq!(running.await.unwrap(), Outcome::Cancelled);
        let state = orchestrator.state();
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.text, "so far");
        assert_eq!(state.error, None);
        assert!(history.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_identical_submissions_are_not_deduplicated() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        for _ in 0..2 {
            let script = backend.script();
            script.send(Step::Token("same")).ok();
            script.send(Step::Finish).ok();
            orchestrator.submit(url_request()).await;
        }

        assert_eq!(history.snapshot().len(), 2);
        assert_eq!(orchestrator.state().session, 2);
    }

    #[tokio::test]
    async fn test_show_displays_history_entry() {
        let backend = ScriptedBackend::new(true);
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(backend.clone(), Arc::new(history.clone()));

        let entry = history
            .add(NewHistoryEntry {
                content: "From the archive".to_string(),
                source_label: "example.com".to_string(),
                metadata: HistoryMetadata::default(),
            })
            .await
            .unwrap();

        orchestrator.show(&entry);

        let state = orchestrator.state();
        assert_eq!(state.text, "From the archive");
        assert_eq!(state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_end_to_end_against_http_service() {
        let base = spawn_fake_backend(FakeState::default()).await;
        let client = GenerationClient::new(&base, None).unwrap();
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(Arc::new(client), Arc::new(history.clone()));

        let outcome = orchestrator.submit(url_request()).await;

        assert_eq!(outcome, Outcome::Completed("Dear Hiring Manager".to_string()));
        assert_eq!(orchestrator.state().text, "Dear Hiring Manager");
        assert_eq!(history.snapshot()[0].source_label, "example.com");
    }

    #[tokio::test]
    async fn test_end_to_end_malformed_stream_completes_with_partial_text() {
        let base = spawn_fake_backend(FakeState::default()).await;
        let client = GenerationClient::new(&base, None).unwrap();
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(Arc::new(client), Arc::new(history.clone()));

        let outcome = orchestrator
            .submit(request(JobSource::Text("malformed".to_string())))
            .await;

        assert_eq!(outcome, Outcome::Completed("first".to_string()));
        let state = orchestrator.state();
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.text, "first");
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "first");
        assert_eq!(snapshot[0].source_label, crate::models::request::FREE_TEXT_SOURCE_LABEL);
    }

    #[tokio::test]
    async fn test_end_to_end_remote_error_text() {
        let base = spawn_fake_backend(FakeState::default()).await;
        let client = GenerationClient::new(&base, None).unwrap();
        let history = LocalHistoryStore::in_memory();
        let orchestrator = GenerationOrchestrator::new(Arc::new(client), Arc::new(history.clone()));

        let outcome = orchestrator
            .submit(request(JobSource::Text("fail".to_string())))
            .await;

        assert_eq!(outcome, Outcome::Failed("quota exceeded".to_string()));
        assert_eq!(orchestrator.state().error.as_deref(), Some("quota exceeded"));
        assert!(history.snapshot().is_empty());
    }
}
