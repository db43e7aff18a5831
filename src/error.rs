use thiserror::Error;

/// Failures of the local durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue entry {0} not found")]
    NotFound(String),
    #[error("local store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entry {id} failed: {message}")]
    Delivery { id: String, message: String },
    #[error("rejected by server: {message}")]
    Rejected { id: Option<String>, message: String },
}

impl SyncError {
    /// Message suitable for the sync log and user notifications.
    pub fn log_message(&self) -> String {
        match self {
            SyncError::Delivery { id, message } => format!("{id}: {message}"),
            SyncError::Rejected {
                id: Some(id),
                message,
            } => format!("{id}: rejected: {message}"),
            other => other.to_string(),
        }
    }
}
