use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key holds no value (surfaced by safe-update and typed reads).
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// The cluster cannot currently serve the request.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The write must be served by the leader and forwarding failed.
    #[error("not leader; current leader: {leader:?}; {reason}")]
    NotLeader { leader: Option<u64>, reason: String },

    /// The operation was abandoned by shutdown or caller cancellation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("store failure: {reason}")]
    Internal { reason: String },
}
