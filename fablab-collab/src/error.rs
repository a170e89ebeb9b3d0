//! Error taxonomy for the collaboration core.
//!
//! Most failures here are non-fatal: connection loss is recovered by the
//! reconnect loop, malformed frames and failing handlers are logged and
//! skipped, broadcast failures are logged only. The variants exist so callers
//! that *do* observe an error (connect, load/save, local edits) can match on it.

use thiserror::Error;

/// Error type returned by handlers registered on the event bus.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the collaboration core.
#[derive(Debug, Error)]
pub enum CollabError {
    /// The socket failed to open or closed unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// An inbound frame could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// A fire-and-forget gateway call failed.
    #[error("broadcast failed: {0}")]
    Broadcast(String),

    /// Loading or saving a surface failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A local edit was attempted while another user holds the lock.
    #[error("document is locked by {owner}")]
    DocumentLocked { owner: String },

    /// Only the lock owner may release the lock.
    #[error("lock is held by {owner}, not by the local user")]
    NotLockOwner { owner: String },

    /// An operation needs an authenticated session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// An environment variable carried an unusable value.
    #[error("invalid value {value:?} for {var}")]
    Config { var: &'static str, value: String },
}

impl From<reqwest::Error> for CollabError {
    fn from(e: reqwest::Error) -> Self {
        CollabError::Persistence(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Connection(e.to_string())
    }
}
