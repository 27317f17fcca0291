//! Error types for keygate core.
//!
//! Verification outcomes such as "not found" or "expired" are not errors;
//! they are variants of [`Outcome`](crate::engine::Outcome). The types here
//! cover genuine faults only.

use thiserror::Error;

/// Schema invariant violations on a license record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("license key must not be empty")]
    EmptyKey,

    #[error("license {0} is unused but carries a hardware id")]
    UnusedWithHwid(String),

    #[error("license {0} is bound to an empty hardware id")]
    EmptyHwid(String),
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

/// Errors returned by the verification engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("hardware id is required to verify license {0}")]
    MissingHardwareId(String),

    #[error("license {key} still contended after {attempts} bind attempts")]
    Contention { key: String, attempts: u32 },
}
