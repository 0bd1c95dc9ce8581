//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state store: {0}")]
    Open(String),

    /// A redb transaction, table, read or write failed.
    #[error("storage error on '{table}': {message}")]
    Storage { table: String, message: String },

    #[error("failed to encode '{key}' for '{table}': {message}")]
    Encode {
        table: String,
        key: String,
        message: String,
    },

    /// A stored document no longer matches its type.
    #[error("corrupt record '{key}' in '{table}': {message}")]
    Corrupt {
        table: String,
        key: String,
        message: String,
    },
}
