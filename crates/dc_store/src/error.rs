use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Partition does not exist: {0}")]
    NoSuchPartition(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record key in partition {partition}: {len} bytes")]
    CorruptKey { partition: String, len: usize },

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Public key for {username} differs from the cached key")]
    KeyConflict { username: String },

    #[error("Migration error: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
