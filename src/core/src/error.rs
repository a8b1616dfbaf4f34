use thiserror::Error;

use crate::key::ThreadKey;

/// Failures of the event stream of one run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),
}

/// Failures of the run/history API.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Errors returned by `RunCoordinator::start_run`.
///
/// Setup failures and setup cancellations have already been delivered to
/// the completion sink when they are returned.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a run is already starting or running for {0}")]
    AlreadyRunning(ThreadKey),

    #[error("run setup failed: {0}")]
    Setup(String),

    #[error("run for {0} was cancelled during setup")]
    Cancelled(ThreadKey),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Path(String),

    #[error("read config.toml: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),
}
