use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use runplex_protocol::RunAgentInput;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handle::{RunHandle, SubscriptionHandle};
use super::processor::{apply_event, citations_since, record_message_state, FoldStatus};
use super::registry::RunRegistry;
use super::state::{RunOutcome, RunState};
use crate::cache::HistoryCache;
use crate::completion::CompletionRouter;
use crate::config::{ClosePolicy, CoordinatorConfig, RunplexConfig};
use crate::conversation::{ChatMessage, Conversation};
use crate::error::CoordinatorError;
use crate::key::ThreadKey;
use crate::remote::{BackendApi, EventSource, EventStream, RunRequest};
use crate::storage::Store;
use crate::unread::UnreadRuns;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunPhase {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn of(state: &RunState) -> Self {
        match state {
            RunState::Idle => Self::Idle,
            RunState::Running { .. } => Self::Running,
            RunState::Completed { outcome, .. } => match outcome {
                RunOutcome::Success => Self::Completed,
                RunOutcome::Failed { .. } => Self::Failed,
                RunOutcome::Cancelled { .. } => Self::Cancelled,
            },
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What the focused thread looks like right now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FocusedRun {
    pub key: Option<ThreadKey>,
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub state: RunState,
}

impl FocusedRun {
    fn idle(key: &ThreadKey) -> Self {
        Self {
            key: Some(key.clone()),
            ..Self::default()
        }
    }

    fn starting(key: &ThreadKey) -> Self {
        Self {
            key: Some(key.clone()),
            phase: RunPhase::Starting,
            ..Self::default()
        }
    }

    fn of_run(key: &ThreadKey, run_id: &str, state: RunState) -> Self {
        Self {
            key: Some(key.clone()),
            run_id: Some(run_id.to_string()),
            phase: RunPhase::of(&state),
            state,
        }
    }

    fn unregistered(key: &ThreadKey, conversation: Conversation, outcome: RunOutcome) -> Self {
        let state = RunState::Completed {
            conversation,
            outcome,
        };
        Self {
            key: Some(key.clone()),
            run_id: None,
            phase: RunPhase::of(&state),
            state,
        }
    }
}

enum SetupFailure {
    Cancelled,
    Failed(String),
}

/// A run that is built but not yet registered.
struct PreparedRun {
    handle: Arc<RunHandle>,
    ready: oneshot::Sender<Arc<RunHandle>>,
}

#[derive(Default)]
struct FocusInner {
    key: Option<ThreadKey>,
    mirror: Option<AbortHandle>,
}

/// Keeps a key in the `starting` map until setup is over.
struct StartGuard<'a> {
    starting: &'a Mutex<HashMap<ThreadKey, CancellationToken>>,
    key: &'a ThreadKey,
    armed: bool,
}

impl StartGuard<'_> {
    /// Leave the starting phase; true when a cancel landed during setup.
    fn finish(&mut self) -> bool {
        self.armed = false;
        lock(self.starting)
            .remove(self.key)
            .is_some_and(|token| token.is_cancelled())
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.starting).remove(self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, SetupFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SetupFailure::Cancelled),
        out = fut => Ok(out),
    }
}

/// Starts, cancels and observes runs on top of a [`RunRegistry`].
///
/// Any number of threads may run at once. One of them is focused: its state
/// is published through [`RunCoordinator::focused_state`].
pub struct RunCoordinator {
    registry: Arc<RunRegistry>,
    backend: Arc<dyn BackendApi>,
    source: Arc<dyn EventSource>,
    cache: Arc<HistoryCache>,
    unread: Arc<UnreadRuns>,
    config: CoordinatorConfig,
    trace_events: bool,
    focused: Arc<watch::Sender<FocusedRun>>,
    focus: Mutex<FocusInner>,
    starting: Mutex<HashMap<ThreadKey, CancellationToken>>,
    /// Runtime that mirror tasks are spawned on when `focus` is called
    /// from outside one.
    runtime: Option<tokio::runtime::Handle>,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<RunRegistry>,
        backend: Arc<dyn BackendApi>,
        source: Arc<dyn EventSource>,
        cache: Arc<HistoryCache>,
        unread: Arc<UnreadRuns>,
        config: CoordinatorConfig,
    ) -> Self {
        let (focused, _) = watch::channel(FocusedRun::default());
        Self {
            registry,
            backend,
            source,
            cache,
            unread,
            config,
            trace_events: false,
            focused: Arc::new(focused),
            focus: Mutex::new(FocusInner::default()),
            starting: Mutex::new(HashMap::new()),
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Wire a coordinator with its cache, unread tracker and registry.
    pub fn from_config(
        config: &RunplexConfig,
        backend: Arc<dyn BackendApi>,
        source: Arc<dyn EventSource>,
        store: Option<Arc<dyn Store>>,
    ) -> Self {
        let cache = Arc::new(HistoryCache::new(backend.clone(), store));
        let unread = Arc::new(UnreadRuns::new());
        let router = CompletionRouter::new()
            .with(cache.clone())
            .with(unread.clone());
        let registry = Arc::new(RunRegistry::with_capacity(
            Arc::new(router),
            config.registry.lifecycle_capacity,
        ));
        Self::new(
            registry,
            backend,
            source,
            cache,
            unread,
            config.coordinator.clone(),
        )
        .with_trace_events(config.trace_events_enabled())
    }

    pub fn with_trace_events(mut self, enabled: bool) -> Self {
        self.trace_events = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<HistoryCache> {
        &self.cache
    }

    pub fn unread(&self) -> &Arc<UnreadRuns> {
        &self.unread
    }

    pub fn focused_state(&self) -> watch::Receiver<FocusedRun> {
        self.focused.subscribe()
    }

    pub fn focused(&self) -> FocusedRun {
        self.focused.borrow().clone()
    }

    /// Start a run for `key` with `user_message` and focus it.
    ///
    /// Returns the run id once the run is registered; events keep streaming
    /// in the background. Setup failures have already been reported to the
    /// completion sink when the error is returned.
    pub async fn start_run(
        &self,
        key: ThreadKey,
        user_message: impl Into<String>,
        existing_run_id: Option<String>,
    ) -> Result<String, CoordinatorError> {
        let setup_cancel = self.begin_start(&key)?;
        let mut guard = StartGuard {
            starting: &self.starting,
            key: &key,
            armed: true,
        };
        self.focus(&key);

        let prepared = self
            .prepare(&key, user_message.into(), existing_run_id, &setup_cancel)
            .await;
        let PreparedRun { handle, ready } = match prepared {
            Ok(prepared) => prepared,
            Err(failure) => {
                guard.finish();
                return Err(self.fail_setup(&key, failure));
            }
        };

        self.registry.register_run(handle.clone());
        if guard.finish() {
            handle.dispose();
            self.registry
                .complete_run(&handle, RunOutcome::cancelled(self.config.cancel_reason.clone()));
            self.refocus(&key);
            return Err(CoordinatorError::Cancelled(key.clone()));
        }
        if handle.is_disposed() {
            return Err(self.fail_setup(
                &key,
                SetupFailure::Failed("run registry is disposed".to_string()),
            ));
        }
        // The consumer only starts folding once the handle is registered.
        let _ = ready.send(handle.clone());
        self.refocus(&key);
        Ok(handle.run_id().to_string())
    }

    /// Cancel the run for `key`, or abort its setup if it is still starting.
    ///
    /// Returns whether anything was cancelled.
    pub fn cancel_run(&self, key: &ThreadKey) -> bool {
        if let Some(token) = lock(&self.starting).get(key) {
            tracing::debug!(%key, "cancelling run setup");
            token.cancel();
            return true;
        }
        let Some(handle) = self.registry.get_handle(key) else {
            return false;
        };
        handle.dispose();
        self.registry
            .complete_run(&handle, RunOutcome::cancelled(self.config.cancel_reason.clone()))
    }

    /// Point the published state at the run of `key`.
    ///
    /// Starts, stops and mutates nothing; clears the unread mark of `key`.
    pub fn focus(&self, key: &ThreadKey) {
        self.unread.set_focus(Some(key.clone()));
        let mut focus = lock(&self.focus);
        focus.key = Some(key.clone());
        if let Some(mirror) = focus.mirror.take() {
            mirror.abort();
        }
        if lock(&self.starting).contains_key(key) {
            self.focused.send_replace(FocusedRun::starting(key));
            return;
        }
        match self.registry.get_handle(key) {
            Some(handle) => focus.mirror = self.mirror(&handle),
            None => {
                self.focused.send_replace(FocusedRun::idle(key));
            }
        }
    }

    pub fn clear_focus(&self) {
        self.unread.set_focus(None);
        let mut focus = lock(&self.focus);
        focus.key = None;
        if let Some(mirror) = focus.mirror.take() {
            mirror.abort();
        }
        self.focused.send_replace(FocusedRun::default());
    }

    /// Cancel pending setups and stop mirroring the focused run.
    ///
    /// Registered runs are left to the registry.
    pub fn shutdown(&self) {
        for token in lock(&self.starting).values() {
            token.cancel();
        }
        if let Some(mirror) = lock(&self.focus).mirror.take() {
            mirror.abort();
        }
    }

    fn begin_start(&self, key: &ThreadKey) -> Result<CancellationToken, CoordinatorError> {
        let focus = lock(&self.focus);
        let busy = focus.key.as_ref() == Some(key) && self.focused.borrow().phase.is_busy();
        let mut starting = lock(&self.starting);
        if busy || starting.contains_key(key) {
            return Err(CoordinatorError::AlreadyRunning(key.clone()));
        }
        let token = CancellationToken::new();
        starting.insert(key.clone(), token.clone());
        Ok(token)
    }

    async fn prepare(
        &self,
        key: &ThreadKey,
        user_message: String,
        existing_run_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PreparedRun, SetupFailure> {
        let run_id = match existing_run_id {
            Some(run_id) => run_id,
            None => cancellable(cancel, self.backend.create_run(key))
                .await?
                .map_err(|e| SetupFailure::Failed(format!("create run: {e}")))?,
        };
        let mut conversation = cancellable(cancel, self.cache.get(key))
            .await?
            .map_err(|e| SetupFailure::Failed(format!("load history: {e}")))?;

        let prior_protocol_state = conversation.protocol_state();
        let user_message_id = Uuid::new_v4().to_string();
        conversation.push(ChatMessage::user(user_message_id.clone(), user_message));
        record_message_state(&mut conversation, &user_message_id, &run_id);

        let input = RunAgentInput::new(
            key.thread_id.clone(),
            run_id.clone(),
            conversation.to_input_messages(),
            conversation.state.clone(),
        );
        let run_cancel = cancel.child_token();
        let request = RunRequest {
            key: key.clone(),
            run_id: run_id.clone(),
            input,
        };
        let stream = cancellable(cancel, self.source.open(request, run_cancel.clone()))
            .await?
            .map_err(|e| SetupFailure::Failed(format!("open event stream: {e}")))?;

        let (ready, ready_rx) = oneshot::channel();
        let task = tokio::spawn(consume_events(
            ready_rx,
            stream,
            Arc::downgrade(&self.registry),
            self.config.close_without_terminal,
            self.trace_events,
        ));
        let handle = Arc::new(RunHandle::new(
            key.clone(),
            run_id,
            user_message_id,
            prior_protocol_state,
            run_cancel,
            SubscriptionHandle::new(task.abort_handle()),
            RunState::running(conversation),
        ));
        Ok(PreparedRun { handle, ready })
    }

    fn fail_setup(&self, key: &ThreadKey, failure: SetupFailure) -> CoordinatorError {
        let (outcome, error) = match failure {
            SetupFailure::Failed(message) => {
                tracing::warn!(
                    room_id = %key.room_id,
                    thread_id = %key.thread_id,
                    error = %message,
                    "run setup failed"
                );
                (
                    RunOutcome::failed(message.clone()),
                    CoordinatorError::Setup(message),
                )
            }
            SetupFailure::Cancelled => (
                RunOutcome::cancelled(self.config.cancel_reason.clone()),
                CoordinatorError::Cancelled(key.clone()),
            ),
        };
        self.registry.notify_completion(key, outcome.clone());

        let focus = lock(&self.focus);
        if focus.key.as_ref() == Some(key) {
            let conversation = self.cache.cached(key).unwrap_or_default();
            self.focused
                .send_replace(FocusedRun::unregistered(key, conversation, outcome));
        }
        error
    }

    fn refocus(&self, key: &ThreadKey) {
        let still_focused = lock(&self.focus).key.as_ref() == Some(key);
        if still_focused {
            self.focus(key);
        }
    }

    /// Publish the state of `handle` now and after every change.
    ///
    /// Without a runtime only the current state is published.
    fn mirror(&self, handle: &RunHandle) -> Option<AbortHandle> {
        let key = handle.key().clone();
        let run_id = handle.run_id().to_string();
        let mut states = handle.subscribe();
        let initial = states.borrow_and_update().clone();
        self.focused
            .send_replace(FocusedRun::of_run(&key, &run_id, initial));

        let runtime = tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone());
        let Some(runtime) = runtime else {
            tracing::debug!(%key, "no runtime, focused state will not follow the run");
            return None;
        };
        let focused = self.focused.clone();
        let task = runtime.spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                focused.send_if_modified(|current| {
                    if current.key.as_ref() != Some(&key) {
                        return false;
                    }
                    *current = FocusedRun::of_run(&key, &run_id, state);
                    true
                });
            }
        });
        Some(task.abort_handle())
    }
}

impl Drop for RunCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fold the event stream of one run into its handle.
///
/// Waits for the handle to be registered first, so no terminal event can
/// land before `RunStarted`.
async fn consume_events(
    ready: oneshot::Receiver<Arc<RunHandle>>,
    mut stream: EventStream,
    registry: Weak<RunRegistry>,
    close_policy: ClosePolicy,
    trace_events: bool,
) {
    let Ok(handle) = ready.await else {
        return;
    };
    let cancel = handle.cancel_token().clone();
    let key = handle.key().clone();

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if trace_events {
                    tracing::debug!(
                        room_id = %key.room_id,
                        thread_id = %key.thread_id,
                        run_id = %handle.run_id(),
                        kind = event.kind(),
                        "run event"
                    );
                }
                let folded = handle.apply(|conversation, streaming| {
                    let status = apply_event(conversation, streaming, &event);
                    if status == FoldStatus::Completed {
                        let citations =
                            citations_since(handle.prior_protocol_state(), &conversation.state);
                        if let Some(message_state) = conversation
                            .message_states
                            .get_mut(handle.user_message_id())
                        {
                            message_state.citations.extend(citations);
                        }
                    }
                    status
                });
                match folded {
                    None => return,
                    Some(FoldStatus::Running) => {}
                    Some(FoldStatus::Completed) => break RunOutcome::Success,
                    Some(FoldStatus::Failed(message)) => break RunOutcome::failed(message),
                    Some(FoldStatus::Cancelled(reason)) => break RunOutcome::cancelled(reason),
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    room_id = %key.room_id,
                    thread_id = %key.thread_id,
                    run_id = %handle.run_id(),
                    error = %e,
                    "run event stream failed"
                );
                break RunOutcome::failed(e.to_string());
            }
            None => {
                tracing::debug!(%key, run_id = %handle.run_id(), "event stream closed without terminal event");
                break match close_policy {
                    ClosePolicy::Success => RunOutcome::Success,
                    ClosePolicy::Failed => {
                        RunOutcome::failed("event stream closed before the run finished")
                    }
                };
            }
        }
    };

    if let Some(registry) = registry.upgrade() {
        registry.complete_run(&handle, outcome);
    }
}
