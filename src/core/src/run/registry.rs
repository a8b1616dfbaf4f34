use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::broadcast;

use super::handle::RunHandle;
use super::state::{RunCompletion, RunLifecycleEvent, RunOutcome, RunState};
use crate::completion::CompletionSink;
use crate::key::ThreadKey;

pub const DEFAULT_LIFECYCLE_CAPACITY: usize = 256;

type RunMap = HashMap<ThreadKey, Arc<RunHandle>>;

struct RegistryInner {
    /// Replaced wholesale on every write; readers clone the `Arc`.
    runs: Arc<RunMap>,
    /// `None` once the registry is disposed.
    events: Option<broadcast::Sender<RunLifecycleEvent>>,
}

/// Source of truth for which threads have a run.
///
/// Holds at most one handle per [`ThreadKey`] and broadcasts a
/// [`RunLifecycleEvent`] for every registration and terminal transition.
/// Every outcome is reported; filtering is left to subscribers.
pub struct RunRegistry {
    inner: RwLock<RegistryInner>,
    /// Serializes sink calls so they observe transitions in order.
    completion_lock: Mutex<()>,
    sink: Arc<dyn CompletionSink>,
}

impl RunRegistry {
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_LIFECYCLE_CAPACITY)
    }

    /// `capacity` bounds how far a lifecycle subscriber may lag before it
    /// starts missing events.
    pub fn with_capacity(sink: Arc<dyn CompletionSink>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(RegistryInner {
                runs: Arc::new(HashMap::new()),
                events: Some(events),
            }),
            completion_lock: Mutex::new(()),
            sink,
        }
    }

    /// Subscribe to lifecycle events. After `dispose()` the receiver is
    /// already closed.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<RunLifecycleEvent> {
        match self.read().events.as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Store `handle` as the run for its key and emit `RunStarted`.
    ///
    /// A handle already stored for the key is disposed silently.
    pub fn register_run(&self, handle: Arc<RunHandle>) {
        let key = handle.key().clone();
        let previous = {
            let mut inner = self.write();
            let Some(events) = inner.events.clone() else {
                tracing::warn!(%key, run_id = %handle.run_id(), "register on disposed registry");
                drop(inner);
                handle.dispose();
                return;
            };
            let mut runs = RunMap::clone(&inner.runs);
            let previous = runs.insert(key.clone(), handle.clone());
            inner.runs = Arc::new(runs);
            let _ = events.send(RunLifecycleEvent::RunStarted { key: key.clone() });
            previous
        };
        tracing::debug!(
            room_id = %key.room_id,
            thread_id = %key.thread_id,
            run_id = %handle.run_id(),
            "run registered"
        );
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &handle) {
                tracing::debug!(%key, run_id = %previous.run_id(), "run superseded");
                previous.dispose();
            }
        }
    }

    /// Move `handle` to its terminal state, emit `RunCompleted`, and hand the
    /// final conversation to the completion sink.
    ///
    /// Returns `false` without side effects when the registry is disposed,
    /// when `handle` is no longer the one stored for its key, or when it has
    /// already completed.
    pub fn complete_run(&self, handle: &Arc<RunHandle>, outcome: RunOutcome) -> bool {
        let key = handle.key();
        // Taken before the map lock so readers never wait on the sink.
        let _order = self
            .completion_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let conversation = {
            let inner = self.write();
            let Some(events) = inner.events.as_ref() else {
                return false;
            };
            let current = inner.runs.get(key);
            if !current.is_some_and(|current| Arc::ptr_eq(current, handle)) {
                tracing::debug!(%key, run_id = %handle.run_id(), "dropping stale completion");
                return false;
            }
            let Some(conversation) = handle.complete(outcome.clone()) else {
                return false;
            };
            let _ = events.send(RunLifecycleEvent::RunCompleted {
                key: key.clone(),
                outcome: outcome.clone(),
            });
            conversation
        };
        tracing::debug!(
            room_id = %key.room_id,
            thread_id = %key.thread_id,
            run_id = %handle.run_id(),
            outcome = outcome.as_str(),
            elapsed_ms = (Utc::now() - handle.started_at()).num_milliseconds(),
            "run completed"
        );
        self.sink.on_run_completed(&RunCompletion {
            key: key.clone(),
            run_id: Some(handle.run_id().to_string()),
            outcome,
            conversation: Some(conversation),
        });
        true
    }

    /// Report a terminal outcome for a run that never got a handle.
    ///
    /// Reaches the completion sink only: the map is untouched and no
    /// lifecycle event is emitted.
    pub fn notify_completion(&self, key: &ThreadKey, outcome: RunOutcome) {
        if self.is_disposed() {
            return;
        }
        let _order = self
            .completion_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(%key, outcome = outcome.as_str(), "unregistered run completed");
        self.sink.on_run_completed(&RunCompletion {
            key: key.clone(),
            run_id: None,
            outcome,
            conversation: None,
        });
    }

    pub fn get_handle(&self, key: &ThreadKey) -> Option<Arc<RunHandle>> {
        self.snapshot().get(key).cloned()
    }

    pub fn get_run_state(&self, key: &ThreadKey) -> Option<RunState> {
        self.get_handle(key).map(|handle| handle.state())
    }

    pub fn has_run(&self, key: &ThreadKey) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn has_active_run(&self, key: &ThreadKey) -> bool {
        self.snapshot()
            .get(key)
            .is_some_and(|handle| handle.is_active())
    }

    /// Keys with a running handle, sorted.
    pub fn active_keys(&self) -> Vec<ThreadKey> {
        let mut keys: Vec<ThreadKey> = self
            .snapshot()
            .iter()
            .filter(|(_, handle)| handle.is_active())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Dispose and forget the run for `key`. No event is emitted.
    pub fn remove_run(&self, key: &ThreadKey) -> bool {
        let removed = {
            let mut inner = self.write();
            if !inner.runs.contains_key(key) {
                return false;
            }
            let mut runs = RunMap::clone(&inner.runs);
            let removed = runs.remove(key);
            inner.runs = Arc::new(runs);
            removed
        };
        match removed {
            Some(handle) => {
                handle.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every handle and clear the map. No events are emitted.
    pub fn remove_all(&self) {
        let runs = {
            let mut inner = self.write();
            std::mem::replace(&mut inner.runs, Arc::new(HashMap::new()))
        };
        for handle in runs.values() {
            handle.dispose();
        }
    }

    /// Tear down every run and close the lifecycle stream. Idempotent.
    pub fn dispose(&self) {
        self.remove_all();
        let events = self.write().events.take();
        if events.is_some() {
            tracing::debug!("run registry disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.read().events.is_none()
    }

    fn snapshot(&self) -> Arc<RunMap> {
        self.read().runs.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RunRegistry {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ChatMessage, Conversation};
    use crate::run::handle::SubscriptionHandle;
    use serde_json::Map;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingSink {
        completions: Mutex<Vec<RunCompletion>>,
    }

    impl CompletionSink for RecordingSink {
        fn on_run_completed(&self, completion: &RunCompletion) {
            self.completions.lock().unwrap().push(completion.clone());
        }
    }

    fn registry() -> (RunRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (RunRegistry::new(sink.clone()), sink)
    }

    fn handle(room: &str, thread: &str, run_id: &str) -> Arc<RunHandle> {
        let mut conversation = Conversation::default();
        conversation.push(ChatMessage::user("u1", "hello"));
        Arc::new(RunHandle::new(
            ThreadKey::new(room, thread),
            run_id,
            "u1",
            Map::new(),
            CancellationToken::new(),
            SubscriptionHandle::detached(),
            RunState::running(conversation),
        ))
    }

    #[test]
    fn register_then_complete_emits_paired_events() {
        let (registry, sink) = registry();
        let mut events = registry.lifecycle_events();
        let key = ThreadKey::new("r1", "t1");
        let h = handle("r1", "t1", "run-1");

        registry.register_run(h.clone());
        assert!(registry.has_run(&key));
        assert!(registry.has_active_run(&key));
        assert_eq!(
            events.try_recv().unwrap(),
            RunLifecycleEvent::RunStarted { key: key.clone() }
        );

        assert!(registry.complete_run(&h, RunOutcome::Success));
        assert!(registry.has_run(&key));
        assert!(!registry.has_active_run(&key));
        assert_eq!(
            events.try_recv().unwrap(),
            RunLifecycleEvent::RunCompleted {
                key: key.clone(),
                outcome: RunOutcome::Success
            }
        );

        let completions = sink.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].run_id.as_deref(), Some("run-1"));
        let conversation = completions[0].conversation.as_ref().unwrap();
        assert_eq!(conversation.messages, vec![ChatMessage::user("u1", "hello")]);
    }

    #[test]
    fn second_completion_is_ignored() {
        let (registry, sink) = registry();
        let mut events = registry.lifecycle_events();
        let h = handle("r1", "t1", "run-1");
        registry.register_run(h.clone());
        let _ = events.try_recv();

        assert!(registry.complete_run(&h, RunOutcome::Success));
        let _ = events.try_recv();
        assert!(!registry.complete_run(&h, RunOutcome::failed("late")));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(sink.completions.lock().unwrap().len(), 1);
    }

    #[test]
    fn registering_over_a_key_disposes_previous_handle() {
        let (registry, _sink) = registry();
        let key = ThreadKey::new("r1", "t1");
        let mut handles = Vec::new();
        for i in 0..4 {
            let h = handle("r1", "t1", &format!("run-{i}"));
            registry.register_run(h.clone());
            handles.push(h);
        }
        let current = registry.get_handle(&key).unwrap();
        assert!(Arc::ptr_eq(&current, handles.last().unwrap()));
        for old in &handles[..3] {
            assert!(old.is_disposed());
        }
        assert!(!current.is_disposed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_completion_is_a_no_op() {
        let (registry, sink) = registry();
        let mut events = registry.lifecycle_events();
        let key = ThreadKey::new("r1", "t1");
        let a = handle("r1", "t1", "run-a");
        let b = handle("r1", "t1", "run-b");
        registry.register_run(a.clone());
        registry.register_run(b.clone());
        while events.try_recv().is_ok() {}

        assert!(!registry.complete_run(&a, RunOutcome::Success));
        assert!(b.is_active());
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert!(Arc::ptr_eq(&registry.get_handle(&key).unwrap(), &b));
        assert!(sink.completions.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_run_on_unknown_key_is_silent() {
        let (registry, _sink) = registry();
        let mut events = registry.lifecycle_events();
        assert!(!registry.remove_run(&ThreadKey::new("r1", "t1")));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn remove_run_disposes_without_event() {
        let (registry, _sink) = registry();
        let key = ThreadKey::new("r1", "t1");
        let h = handle("r1", "t1", "run-1");
        registry.register_run(h.clone());
        let mut events = registry.lifecycle_events();

        assert!(registry.remove_run(&key));
        assert!(h.is_disposed());
        assert!(!registry.has_run(&key));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn notify_completion_reaches_sink_only() {
        let (registry, sink) = registry();
        let mut events = registry.lifecycle_events();
        let key = ThreadKey::new("r1", "t1");

        registry.notify_completion(&key, RunOutcome::failed("setup error"));

        let completions = sink.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].outcome, RunOutcome::failed("setup error"));
        assert!(completions[0].conversation.is_none());
        assert!(registry.is_empty());
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn dispose_clears_runs_and_closes_stream() {
        let (registry, sink) = registry();
        let h1 = handle("r1", "t1", "run-1");
        let h2 = handle("r1", "t2", "run-2");
        registry.register_run(h1.clone());
        registry.register_run(h2.clone());
        let mut events = registry.lifecycle_events();

        registry.dispose();
        registry.dispose();

        assert!(h1.is_disposed() && h2.is_disposed());
        assert!(registry.is_empty());
        assert_eq!(events.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(
            registry.lifecycle_events().try_recv(),
            Err(TryRecvError::Closed)
        );
        assert!(!registry.complete_run(&h1, RunOutcome::Success));
        registry.notify_completion(h1.key(), RunOutcome::Success);
        assert!(sink.completions.lock().unwrap().is_empty());
    }

    struct SlowSink {
        entered: std::sync::mpsc::Sender<()>,
        delay: std::time::Duration,
    }

    impl CompletionSink for SlowSink {
        fn on_run_completed(&self, _completion: &RunCompletion) {
            let _ = self.entered.send(());
            std::thread::sleep(self.delay);
        }
    }

    #[test]
    fn readers_do_not_wait_on_a_busy_sink() {
        use std::time::{Duration, Instant};

        let (entered, sink_entered) = std::sync::mpsc::channel();
        let registry = Arc::new(RunRegistry::new(Arc::new(SlowSink {
            entered,
            delay: Duration::from_millis(800),
        })));
        let h = handle("r1", "t2", "run-2");
        registry.register_run(h.clone());

        let first = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry.notify_completion(&ThreadKey::new("r1", "t1"), RunOutcome::Success)
            })
        };
        sink_entered.recv().unwrap();
        let second = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.complete_run(&h, RunOutcome::Success))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(!registry.has_run(&ThreadKey::new("r9", "t9")));
        assert!(registry.get_handle(&ThreadKey::new("r1", "t2")).is_some());
        assert!(started.elapsed() < Duration::from_millis(300));

        first.join().unwrap();
        assert!(second.join().unwrap());
    }

    #[test]
    fn active_keys_lists_only_running_handles() {
        let (registry, _sink) = registry();
        let h1 = handle("r1", "t2", "run-1");
        let h2 = handle("r1", "t1", "run-2");
        registry.register_run(h1.clone());
        registry.register_run(h2.clone());
        registry.complete_run(&h1, RunOutcome::Success);
        assert_eq!(registry.active_keys(), vec![ThreadKey::new("r1", "t1")]);
    }
}
