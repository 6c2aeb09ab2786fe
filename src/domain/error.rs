use std::time::Duration;
use thiserror::Error;

/// Recoverable problems with a single payload. The message is dropped, the
/// pipeline keeps going.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("malformed JSON payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no deviceId")]
    MissingDeviceId,
}

impl PayloadError {
    /// Label value used for the `ingest_payload_errors_total` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            PayloadError::InvalidUtf8(_) | PayloadError::Malformed(_) | PayloadError::NotAnObject => {
                "malformed"
            }
            PayloadError::MissingDeviceId => "missing_device_id",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database unavailable")]
    Unavailable,

    #[error("database initialization failed: {0:#}")]
    Initialization(anyhow::Error),

    #[error("write failed: {0:#}")]
    Write(anyhow::Error),

    #[error("query failed: {0:#}")]
    Query(anyhow::Error),

    #[error("database call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server rejected subscription to topic: {topic}")]
    SubscriptionRejected { topic: String },

    #[error("transport client error: {0:#}")]
    Client(#[from] anyhow::Error),
}
