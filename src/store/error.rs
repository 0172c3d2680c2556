//! Store error types.

use crate::models::PostStatus;

/// Errors produced by [`Store`](crate::store::Store) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite/sqlx failure.
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A persisted value could not be mapped back into a domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// The requested status change is not an edge of the post state machine.
    #[error("post {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        id: uuid::Uuid,
        from: PostStatus,
        to: PostStatus,
    },

    /// File-system failure while preparing the database location.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn decode(what: impl std::fmt::Display) -> Self {
        StoreError::Decode(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
