use std::time::Duration;

/// Error categories for runner operations.
///
/// Categories:
/// - Retryable: transient contention, worth retrying
/// - Fatal: halt the orchestrator, unrecoverable
/// - Skip: log and continue, the scheduler retries next loop
/// - Git: git operation failure
/// - Unexpected: should not occur with validated input
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    // Retryable
    #[error("lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("worker heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    // Fatal -- halt the orchestrator
    #[error("state store corrupted: {0}. Recovery: inspect {1} and restore from its .bak copy")]
    StorageCorruption(String, String),

    #[error("run state not initialized: {0}")]
    NotInitialized(String),

    #[error("task id collision exhausted after {0} attempts")]
    IdCollisionExhausted(u32),

    #[error("internal panic in worker thread: {0}")]
    InternalPanic(String),

    // Skip -- log and continue, scheduler advances past it
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    // Git
    #[error("git error: {0}")]
    Git(String),

    // Catch-all for unexpected variants
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl RunnerError {
    /// Returns true if the error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::LockTimeout(_) | RunnerError::HeartbeatTimeout(_)
        )
    }

    /// Returns true if the error is unrecoverable and the orchestrator should halt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RunnerError::StorageCorruption(_, _)
                | RunnerError::NotInitialized(_)
                | RunnerError::IdCollisionExhausted(_)
                | RunnerError::InternalPanic(_)
        )
    }
}

impl From<RunnerError> for String {
    fn from(err: RunnerError) -> String {
        err.to_string()
    }
}
