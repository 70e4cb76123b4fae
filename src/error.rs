//! Error taxonomy for the sync core.
//!
//! Every fallible path in the crate funnels into [`SyncError`]. The variants
//! matter operationally: `Storage` surfaces to the caller immediately,
//! `Network` is retried with backoff, `ServerRejection` and `Auth` are
//! terminal for the operation that hit them, and `Channel` is only ever
//! recovered internally by the push client's reconnect loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local durable-store write or read failed (disk, quota, corruption).
    #[error("storage error: {0}")]
    Storage(String),

    /// Request failed to reach the server, timed out, or got a 5xx.
    /// Recovered automatically via retry up to the per-operation ceiling.
    #[error("network error: {0}")]
    Network(String),

    /// Server rejected the request with a non-auth 4xx. Retrying cannot
    /// help, so the operation goes straight to `failed`.
    #[error("server rejected request: {0}")]
    ServerRejection(String),

    /// 401 that survived one token-refresh attempt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Push channel failure. Never user-facing; the reconnect loop owns it.
    #[error("push channel error: {0}")]
    Channel(String),
}

impl SyncError {
    /// Terminal errors move the pending operation to `failed` immediately
    /// instead of consuming a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::ServerRejection(_) | SyncError::Auth(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(format!("payload serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
