//! State store errors.
//!
//! redb failures are flattened to strings: callers only need to tell a
//! missing record or a version conflict apart from everything else.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// Transaction, table, or storage-level failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A value could not be encoded or decoded as JSON.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The record's version moved past the one the writer read.
    #[error("the object {key} has been modified (expected version {expected}, found {actual})")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Rejected by admission validation.
    #[error("invalid object: {0}")]
    Invalid(String),
}
