use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unknown receipt handle: {0}")]
    UnknownReceiptHandle(String),

    #[error("Consumer is stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[cfg(feature = "sqs")]
    #[error("SQS error: {0}")]
    Sqs(String),
}
