use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The list store could not be reached. Retried by the task runner.
    #[error("Queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A queue call did not see its task finish within the wait budget.
    /// The task itself keeps running.
    #[error("Queue timeout: {0}")]
    QueueTimeout(String),

    /// The task runner dropped the task before replying.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The permanent record store could not be reached. Retried by the task runner.
    #[error("Completion hook unavailable: {0}")]
    HookUnavailable(String),

    #[error("Completion hook failed: {0}")]
    CompletionHook(String),

    #[error("Job already queued: {0}")]
    Duplicate(String),

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),

    #[error("Photo error: {0}")]
    Photo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    /// Whether the task runner should retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::StoreUnavailable(_) | QueueError::HookUnavailable(_)
        )
    }
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => {
                QueueError::StoreUnavailable("connection closed".to_string())
            }
            tokio_rusqlite::Error::Rusqlite(e) => e.into(),
            other => QueueError::Database(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                ) =>
            {
                QueueError::StoreUnavailable(err.to_string())
            }
            _ => QueueError::Database(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
