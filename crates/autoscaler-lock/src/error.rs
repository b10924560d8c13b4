//! Error types for the distributed lock.

use thiserror::Error;

/// Result type alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur while talking to the lock table.
///
/// Contention is not an error: a lock held by someone else is reported
/// as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("unsupported lock database url: {0}")]
    UnsupportedUrl(String),

    #[error("invalid lock table name: {0:?}")]
    InvalidTable(String),

    #[error("failed to connect to lock database: {0}")]
    Connect(String),

    #[error("lock {op} failed after {attempts} attempt(s): {message}")]
    Database {
        op: &'static str,
        attempts: u32,
        message: String,
    },
}
