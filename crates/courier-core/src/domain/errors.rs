//! Error types shared across the engine.

use thiserror::Error;

use super::TaskId;

/// Failure of a task store call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("blocking store call did not complete: {0}")]
    Join(String),

    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed.
    ///
    /// Only lock contention and I/O failures qualify. SQL errors,
    /// constraint violations and bad rows fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Join(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Failure reported by a batch handler. Any error faults the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("payload decode failed for {task_id}: {reason}")]
    Decode { task_id: TaskId, reason: String },

    #[error("handler cancelled")]
    Cancelled,

    #[error("store error in handler: {0}")]
    Store(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::Store(e.to_string())
    }
}
