//! Archive Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories for packing and unpacking archives.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Container is not a readable archive
    #[display("corrupt archive: {}", _0.display())]
    Corrupt(#[error(not(source))] PathBuf),
    /// Entry escapes the unpack destination
    #[display("unsafe archive entry: {_0}")]
    UnsafeEntry(#[error(not(source))] String),
    /// Member file missing from the pack source
    #[display("missing archive member: {}", _0.display())]
    MissingMember(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
