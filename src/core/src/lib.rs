pub mod cache;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod key;
pub mod paths;
pub mod remote;
pub mod run;
pub mod storage;
pub mod unread;

pub use cache::HistoryCache;
pub use completion::{CompletionRouter, CompletionSink};
pub use config::{ClosePolicy, RunplexConfig};
pub use conversation::{ChatMessage, Conversation, StreamingState, ToolCallInfo};
pub use error::{BackendError, ConfigError, CoordinatorError, TransportError};
pub use key::ThreadKey;
pub use remote::{BackendApi, EventSource, EventStream, HttpBackend, HttpEventSource, RunRequest};
pub use run::{
    FocusedRun, RunCompletion, RunCoordinator, RunHandle, RunLifecycleEvent, RunOutcome,
    RunPhase, RunRegistry, RunState, SubscriptionHandle,
};
pub use storage::{SqliteStore, Store};
pub use unread::UnreadRuns;
