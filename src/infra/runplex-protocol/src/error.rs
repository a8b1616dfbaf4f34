use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty event payload")]
    EmptyPayload,

    #[error("event payload is missing a `type` tag")]
    MissingType,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
