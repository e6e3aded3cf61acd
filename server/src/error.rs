//! Error types shared across the delivery core.

/// Failure of the durable message store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt message row {0}")]
    Corrupt(i64),
}

/// Failure of a fast key-value backend (recency cache, presence, pub/sub).
///
/// Never fatal to the caller's primary operation: callers log it and fall
/// back to the durable store or carry on without the signal.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend lock poisoned")]
    Poisoned,
}

/// Why a chat message was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}
