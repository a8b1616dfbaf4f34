mod http;

pub use http::{HttpBackend, HttpEventSource};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use runplex_protocol::{ProtocolEvent, RunAgentInput};
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::error::{BackendError, TransportError};
use crate::key::ThreadKey;

/// Events of one run, in arrival order. Ends when the server closes it.
pub type EventStream = BoxStream<'static, Result<ProtocolEvent, TransportError>>;

/// Everything needed to open the event stream of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub key: ThreadKey,
    pub run_id: String,
    pub input: RunAgentInput,
}

/// Opens run event streams.
///
/// `cancel` is signalled independently of dropping the stream; sources
/// should stop producing and tear down the transport when it fires.
pub trait EventSource: Send + Sync {
    fn open(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<EventStream, TransportError>>;
}

/// Run allocation and history lookup.
pub trait BackendApi: Send + Sync {
    /// Allocate a run id for a new run on `key`.
    fn create_run<'a>(&'a self, key: &'a ThreadKey) -> BoxFuture<'a, Result<String, BackendError>>;

    /// Fetch the stored conversation of `key`.
    fn get_history<'a>(
        &'a self,
        key: &'a ThreadKey,
    ) -> BoxFuture<'a, Result<Conversation, BackendError>>;
}
