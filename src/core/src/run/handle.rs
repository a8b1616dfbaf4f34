use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::processor;
use super::state::{RunOutcome, RunState};
use crate::conversation::{Conversation, StreamingState};
use crate::key::ThreadKey;

/// Owns the event-consumer task of one run.
pub struct SubscriptionHandle {
    task: Option<AbortHandle>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn new(task: AbortHandle) -> Self {
        Self {
            task: Some(task),
            closed: AtomicBool::new(false),
        }
    }

    /// A subscription with no task behind it (runs driven by hand).
    pub fn detached() -> Self {
        Self {
            task: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Abort the consumer task. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.as_ref() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Resources and lifecycle state of exactly one run.
///
/// Everything but the state is fixed at construction. Handles are shared as
/// `Arc<RunHandle>` and compared by pointer identity.
pub struct RunHandle {
    key: ThreadKey,
    run_id: String,
    user_message_id: String,
    prior_protocol_state: Map<String, Value>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    subscription: SubscriptionHandle,
    state: watch::Sender<RunState>,
    disposed: AtomicBool,
}

impl RunHandle {
    pub fn new(
        key: ThreadKey,
        run_id: impl Into<String>,
        user_message_id: impl Into<String>,
        prior_protocol_state: Map<String, Value>,
        cancel: CancellationToken,
        subscription: SubscriptionHandle,
        state: RunState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            key,
            run_id: run_id.into(),
            user_message_id: user_message_id.into(),
            prior_protocol_state,
            started_at: Utc::now(),
            cancel,
            subscription,
            state,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn prior_protocol_state(&self) -> &Map<String, Value> {
        &self.prior_protocol_state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Watch the state of this run. The receiver sees every later write.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Cancel the switch, then close the subscription.
    ///
    /// Idempotent and infallible.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.subscription.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mutate the running state in place.
    ///
    /// Returns `None` without touching anything once the run is cancelled or
    /// no longer running.
    pub(crate) fn apply<R>(
        &self,
        f: impl FnOnce(&mut Conversation, &mut StreamingState) -> R,
    ) -> Option<R> {
        let mut out = None;
        self.state.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            let RunState::Running {
                conversation,
                streaming,
            } = state
            else {
                return false;
            };
            out = Some(f(conversation, streaming));
            true
        });
        out
    }

    /// Move into `Completed(outcome)`.
    ///
    /// Only the first terminal transition wins; it alone receives the final
    /// conversation. Text still in the streaming buffer is flushed first.
    pub(crate) fn complete(&self, outcome: RunOutcome) -> Option<Conversation> {
        let mut finished = None;
        self.state.send_if_modified(|state| {
            let conversation = match std::mem::take(state) {
                RunState::Completed {
                    conversation,
                    outcome,
                } => {
                    *state = RunState::Completed {
                        conversation,
                        outcome,
                    };
                    return false;
                }
                RunState::Running {
                    conversation,
                    streaming,
                } => processor::finalize(conversation, streaming),
                RunState::Idle => Conversation::default(),
            };
            finished = Some(conversation.clone());
            *state = RunState::Completed {
                conversation,
                outcome,
            };
            true
        });
        finished
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("key", &self.key)
            .field("run_id", &self.run_id)
            .field("user_message_id", &self.user_message_id)
            .field("active", &self.is_active())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
