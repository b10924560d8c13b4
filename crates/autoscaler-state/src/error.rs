//! Errors raised by the state store and by policy parsing.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Backend failures carry the rendered redb or serde error. Pipeline loops
/// log them and retry on their next cycle.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    /// A record could not be encoded as JSON.
    #[error("cannot encode state record: {0}")]
    Serialize(String),

    /// A stored record no longer decodes as its type.
    #[error("corrupt state record: {0}")]
    Deserialize(String),

    /// A policy document failed to parse or validate.
    #[error("invalid policy for app {app_id}: {reason}")]
    InvalidPolicy { app_id: String, reason: String },
}
