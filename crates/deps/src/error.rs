//! Dependency Table Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A dependency table error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for dependency table operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories for dependency table operations.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No row exists for the requested path
    #[display("no dependency row for: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A row already exists for a path that must be new
    #[display("dependency row already exists: {_0}")]
    Duplicate(#[error(not(source))] String),
    /// Operation applied to a row of the wrong kind (e.g. tombstoning a table)
    #[display("wrong row kind for: {_0}")]
    KindMismatch(#[error(not(source))] String),
    /// Persisted table could not be decoded
    #[display("corrupt dependency table: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
