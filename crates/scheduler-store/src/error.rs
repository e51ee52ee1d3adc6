use thiserror::Error;

/// Errors surfaced by a [`crate::Store`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. Transient: callers retry with backoff
    /// and must never read this as "nothing is due".
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the command.
    #[error("Store command failed: {0}")]
    Command(String),

    /// A stored value could not be decoded.
    #[error("Malformed stored value at {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// In-process lock poisoned (in-memory backend only).
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
