//! Configuration Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories for configuration loading.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Config file or environment could not be deserialized
    #[display("invalid configuration")]
    Invalid,
    /// A repository entry is malformed
    #[display("invalid repository entry: {_0}")]
    InvalidRepository(#[error(not(source))] String),
}
