use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("Negative time window: {0} minutes")]
    InvalidWindow(i64),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}
