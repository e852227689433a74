//! Error types for Recorral

use crate::jobs::JobStatus;

/// Result type alias for Recorral operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Recorral
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No registered, healthy room server matches the request
    #[error("no healthy room server: {0}")]
    NoRoomServer(String),
    /// No recorder can take the job right now (the job is queued, not failed)
    #[error("no recorder available")]
    NoRecorderAvailable,
    /// Node lookup failed
    #[error("node not found: {0}")]
    NodeNotFound(String),
    /// Job lookup failed
    #[error("job not found: {0}")]
    JobNotFound(String),
    /// Illegal job state-machine transition
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    /// Outbound RPC to a room server or recorder failed
    #[error("rpc error: {0}")]
    Rpc(String),
    /// Outbound RPC deadline exceeded
    #[error("operation timed out")]
    Timeout,
    /// Repository errors
    #[error("repository error: {0}")]
    Repository(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Map a reqwest failure onto the RPC taxonomy. Timeouts are
    /// distinguished because callers treat them as assignment failure.
    pub fn from_rpc(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Rpc(e.to_string())
        }
    }
}
