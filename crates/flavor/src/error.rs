//! Flavor Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A flavor error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for flavor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories for flavor handling.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Specification holds a value outside the allowed set
    #[display("invalid flavor: {_0}")]
    InvalidFlavor(#[error(not(source))] String),
    /// The converter cannot perform the requested transformation
    #[display("unsupported conversion: {_0}")]
    UnsupportedConversion(#[error(not(source))] String),
    /// Audio container is present but not decodable
    #[display("corrupt media file: {_0}")]
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
