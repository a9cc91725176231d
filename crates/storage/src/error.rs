use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("checksum mismatch for timeline entry {timeline_id}")]
    ChecksumMismatch { timeline_id: i64 },

    #[error("core error: {0}")]
    Core(#[from] eavstore_core::CoreError),
}
