use thiserror::Error;

/// Errors that can occur when talking to a storage or communication provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// An operation was attempted before `initialize`.
    #[error("{provider} provider is not initialized")]
    NotInitialized { provider: &'static str },

    /// An operation was attempted after `close`.
    #[error("provider has been closed")]
    AlreadyClosed,

    /// A counter key holds a value that is not a decimal integer.
    #[error("key {key} does not hold an integer counter: {value:?}")]
    InvalidCounter { key: String, value: String },

    /// A message body exceeds what the transport can carry.
    #[error("payload for topic {topic} is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        topic: String,
        size: usize,
        limit: usize,
    },

    /// The subscription transport went away.
    #[error("channel error: {0}")]
    Channel(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
