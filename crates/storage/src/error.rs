//! Storage Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong
/// internally: `NotFound` falls back or surfaces, `Network` retries,
/// `Auth` gives up on this repository, `Corrupt` re-fetches.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Object does not exist at the repository
    #[display("object not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Transport-level failure (connection, timeout, DNS)
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Credential rejection
    #[display("authentication failed: {_0}")]
    Auth(#[error(not(source))] String),
    /// Server-side checksum mismatch or undecodable payload
    #[display("corrupt object: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Key contains traversal components or illegal characters
    #[display("invalid repository key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Backend kind is not registered or not usable on this platform
    #[display("unsupported backend: {_0}")]
    UnsupportedBackend(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Network(_) | Self::BackendError(_))
    }
}
