use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::completion::CompletionSink;
use crate::key::ThreadKey;
use crate::run::{RunCompletion, RunOutcome};

#[derive(Default)]
struct UnreadInner {
    focused: Option<ThreadKey>,
    unread: HashSet<ThreadKey>,
}

/// Threads whose run finished while the user was looking elsewhere.
///
/// Cancellations are never marked.
#[derive(Default)]
pub struct UnreadRuns {
    inner: Mutex<UnreadInner>,
}

impl UnreadRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &ThreadKey) {
        self.lock().unread.insert(key.clone());
    }

    pub fn clear(&self, key: &ThreadKey) -> bool {
        self.lock().unread.remove(key)
    }

    pub fn is_unread(&self, key: &ThreadKey) -> bool {
        self.lock().unread.contains(key)
    }

    /// Sorted.
    pub fn unread_keys(&self) -> Vec<ThreadKey> {
        let mut keys: Vec<ThreadKey> = self.lock().unread.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Focusing a key also clears its mark.
    pub fn set_focus(&self, key: Option<ThreadKey>) {
        let mut inner = self.lock();
        if let Some(key) = key.as_ref() {
            inner.unread.remove(key);
        }
        inner.focused = key;
    }

    pub fn focused(&self) -> Option<ThreadKey> {
        self.lock().focused.clone()
    }

    fn lock(&self) -> MutexGuard<'_, UnreadInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CompletionSink for UnreadRuns {
    fn on_run_completed(&self, completion: &RunCompletion) {
        if matches!(completion.outcome, RunOutcome::Cancelled { .. }) {
            return;
        }
        let mut inner = self.lock();
        if inner.focused.as_ref() != Some(&completion.key) {
            inner.unread.insert(completion.key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(key: &ThreadKey, outcome: RunOutcome) -> RunCompletion {
        RunCompletion {
            key: key.clone(),
            run_id: None,
            outcome,
            conversation: None,
        }
    }

    #[test]
    fn marks_only_unfocused_completions() {
        let unread = UnreadRuns::new();
        let focused = ThreadKey::new("r1", "t1");
        let other = ThreadKey::new("r1", "t2");
        unread.set_focus(Some(focused.clone()));

        unread.on_run_completed(&done(&focused, RunOutcome::Success));
        unread.on_run_completed(&done(&other, RunOutcome::failed("boom")));
        assert_eq!(unread.unread_keys(), vec![other.clone()]);

        unread.set_focus(Some(other.clone()));
        assert!(!unread.is_unread(&other));
    }

    #[test]
    fn cancellations_are_not_marked() {
        let unread = UnreadRuns::new();
        let key = ThreadKey::new("r1", "t1");
        unread.on_run_completed(&done(&key, RunOutcome::cancelled("stop")));
        assert!(!unread.is_unread(&key));

        unread.mark(&key);
        assert!(unread.clear(&key));
        assert!(!unread.clear(&key));
    }
}
