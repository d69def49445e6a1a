//! Error types shared by every layer of the engine.

use std::io;

use thiserror::Error;

use crate::page::PageId;

/// Result alias used throughout the crate.
pub type DbResult<T> = Result<T, DbError>;

/// Every failure the engine can surface to a caller.
#[derive(Debug, Error)]
pub enum DbError {
    /// File system failure. Never retried by the engine.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A page, journal frame or encoded document failed an integrity check.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// A unique key (primary key or unique index value) already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Another writer transaction is already active.
    #[error("a write transaction is already active")]
    TransactionConflict,

    /// The file was written by an incompatible format version.
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// A document or array nests deeper than the codec allows.
    #[error("document nesting exceeds the maximum depth of {0}")]
    NestingTooDeep(usize),

    /// An encoded key does not fit in a B-tree node.
    #[error("key of {len} bytes exceeds the limit of {max} bytes")]
    KeyTooLarge { len: usize, max: usize },

    /// A value has the wrong type for the requested operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Malformed filter, patch, name or other caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested key, collection or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transaction hit a fatal error earlier and was rolled back.
    #[error("transaction was aborted by an earlier error")]
    TransactionAborted,

    /// Configuration rejected by `Config::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A durable commit could not be written through to the data file. The
    /// handle refuses further work; reopening replays the journal.
    #[error("database must be reopened: {0}")]
    Poisoned(String),
}

impl DbError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        DbError::CorruptData(msg.into())
    }

    pub(crate) fn corrupt_page(page_id: PageId, msg: impl std::fmt::Display) -> Self {
        DbError::CorruptData(format!("page {page_id}: {msg}"))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DbError::InvalidArgument(msg.into())
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        DbError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Whether the error leaves an enclosing transaction usable once the
    /// failed statement has been undone.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DbError::DuplicateKey(_)
                | DbError::NestingTooDeep(_)
                | DbError::KeyTooLarge { .. }
                | DbError::TypeMismatch { .. }
                | DbError::InvalidArgument(_)
                | DbError::NotFound(_)
        )
    }
}
