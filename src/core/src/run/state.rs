use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, StreamingState};
use crate::key::ThreadKey;

/// Terminal result of a run. Cancellation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed { message: String },
    Cancelled { reason: String },
}

impl RunOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RunState {
    #[default]
    Idle,
    Running {
        conversation: Conversation,
        streaming: StreamingState,
    },
    Completed {
        conversation: Conversation,
        outcome: RunOutcome,
    },
}

impl RunState {
    pub fn running(conversation: Conversation) -> Self {
        Self::Running {
            conversation,
            streaming: StreamingState::AwaitingText,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        match self {
            Self::Idle => None,
            Self::Running { conversation, .. } | Self::Completed { conversation, .. } => {
                Some(conversation)
            }
        }
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            Self::Completed { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Broadcast on the registry's lifecycle stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunLifecycleEvent {
    RunStarted { key: ThreadKey },
    RunCompleted { key: ThreadKey, outcome: RunOutcome },
}

impl RunLifecycleEvent {
    pub fn key(&self) -> &ThreadKey {
        match self {
            Self::RunStarted { key } | Self::RunCompleted { key, .. } => key,
        }
    }
}

/// Delivered once per run that reached a terminal state.
///
/// `conversation` is `None` when the run failed before a handle existed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub key: ThreadKey,
    pub run_id: Option<String>,
    pub outcome: RunOutcome,
    pub conversation: Option<Conversation>,
}
