use scheduler_core::ConfigError;
use scheduler_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Per-job variants (`LeaseLost`, `UnknownJob`, `HandlerTimeout`,
/// `HandlerFailure`) are contained inside that job's processing and never
/// stop the dispatch loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The shared store could not be reached. Transient; retried with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered but the operation failed.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Our lease expired and may now be held by another instance.
    #[error("Lease lost for job {job}")]
    LeaseLost { job: String },

    /// Scheduled by some process, but this one has no handler for it.
    #[error("Unknown job: {job}")]
    UnknownJob { job: String },

    #[error("Job {job} timed out after {timeout_ms}ms")]
    HandlerTimeout { job: String, timeout_ms: u64 },

    #[error("Job {job} failed: {reason}")]
    HandlerFailure { job: String, reason: String },

    /// Bad configuration or unreachable store before the loop starts.
    #[error("Startup configuration error: {0}")]
    StartupConfig(#[from] ConfigError),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Job registered twice: {job}")]
    DuplicateJob { job: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Whether the caller should back off and retry the same operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::StoreUnavailable(_))
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => SchedulerError::StoreUnavailable(reason),
            other => SchedulerError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
