mod coordinator;
mod handle;
pub mod processor;
mod registry;
mod state;

pub use coordinator::{FocusedRun, RunCoordinator, RunPhase};
pub use handle::{RunHandle, SubscriptionHandle};
pub use processor::{EventProcessingResult, FoldStatus};
pub use registry::{RunRegistry, DEFAULT_LIFECYCLE_CAPACITY};
pub use state::{RunCompletion, RunLifecycleEvent, RunOutcome, RunState};
