//! Library Error Types
//!
//! The public error surface of audb. Sub-crate errors (storage, cache,
//! dependency table, archive, flavor) are folded into these kinds at the
//! crate boundary, preserving the original `exn` frame as a child in the
//! error tree.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failed artifact path and the cause, as carried by the aggregate kinds.
pub type FailedPath = (String, String);

fn failed_list(failed: &[FailedPath]) -> String {
    let mut out = failed.iter().take(5).map(|(p, c)| format!("{p}: {c}")).collect::<Vec<_>>().join("; ");
    if failed.len() > 5 {
        out.push_str(&format!("; and {} more", failed.len() - 5));
    }
    out
}

/// Actionable error categories surfaced to callers.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Database or version absent in all configured repositories
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Bad version string, illegal id, non-portable build
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
    /// Transport-level failure after retries
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Credential rejection
    #[display("authentication failed: {_0}")]
    Auth(#[error(not(source))] String),
    /// Checksum or format mismatch on read
    #[display("corrupt data: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Cache lock not obtainable within the retry schedule
    #[display("gave up waiting for cache lock: {}", _0.display())]
    LockTimeout(#[error(not(source))] PathBuf),
    /// Backend kind not registered or unusable on this platform
    #[display("unsupported backend: {_0}")]
    UnsupportedBackend(#[error(not(source))] String),
    /// The audio converter cannot express the requested transformation
    #[display("unsupported conversion: {_0}")]
    UnsupportedConversion(#[error(not(source))] String),
    /// Per-file flavor transform failures, collected
    #[display("flavor transform failed for {} file(s): {}", failed.len(), failed_list(failed))]
    Flavor {
        #[error(not(source))]
        failed: Vec<FailedPath>,
    },
    /// Per-file fetch failures, collected; the cache stays consistent
    #[display("load failed for {} file(s): {}", failed.len(), failed_list(failed))]
    Load {
        #[error(not(source))]
        failed: Vec<FailedPath>,
    },
    /// Operation cancelled through its cancellation token
    #[display("operation cancelled")]
    Cancelled,
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

fn clone_io(err: &IoError) -> IoError {
    IoError::new(err.kind(), err.to_string())
}

impl ErrorKind {
    /// Fold a storage error into the public surface, keeping its frame as a
    /// child in the error tree.
    #[track_caller]
    pub(crate) fn storage(err: audb_storage::error::Error) -> Error {
        use audb_storage::error::ErrorKind as S;
        let kind = match &*err {
            S::NotFound(key) => Self::NotFound(key.clone()),
            S::Network(msg) => Self::Network(msg.clone()),
            S::Auth(msg) => Self::Auth(msg.clone()),
            S::Corrupt(msg) => Self::Corrupt(msg.clone()),
            S::InvalidKey(key) => Self::InvalidArgument(format!("invalid repository key: {key}")),
            S::UnsupportedBackend(kind) => Self::UnsupportedBackend(kind.clone()),
            S::BackendError(msg) => Self::Network(msg.clone()),
            S::Io(e) => Self::Io(clone_io(e)),
        };
        err.raise(kind)
    }

    /// Fold a cache error into the public surface.
    #[track_caller]
    pub(crate) fn cache(err: audb_cache::error::Error) -> Error {
        use audb_cache::error::ErrorKind as C;
        let kind = match &*err {
            C::LockTimeout(path) => Self::LockTimeout(path.clone()),
            C::Io(e) => Self::Io(clone_io(e)),
        };
        err.raise(kind)
    }

    /// Fold a dependency table error into the public surface.
    #[track_caller]
    pub(crate) fn deps(err: audb_deps::error::Error) -> Error {
        use audb_deps::error::ErrorKind as D;
        let kind = match &*err {
            D::NotFound(path) => Self::NotFound(path.clone()),
            D::Duplicate(path) => Self::Corrupt(format!("duplicate dependency row: {path}")),
            D::KindMismatch(path) => Self::Corrupt(format!("wrong dependency row kind: {path}")),
            D::Corrupt(msg) => Self::Corrupt(msg.clone()),
            D::Io(e) => Self::Io(clone_io(e)),
        };
        err.raise(kind)
    }

    /// Fold an archive error into the public surface.
    #[track_caller]
    pub(crate) fn archive(err: audb_archive::error::Error) -> Error {
        use audb_archive::error::ErrorKind as A;
        let kind = match &*err {
            A::Corrupt(path) => Self::Corrupt(format!("corrupt archive: {}", path.display())),
            A::UnsafeEntry(name) => Self::Corrupt(format!("unsafe archive entry: {name}")),
            A::MissingMember(path) => Self::InvalidArgument(format!("missing archive member: {}", path.display())),
            A::Io(e) => Self::Io(clone_io(e)),
        };
        err.raise(kind)
    }

    /// Fold a flavor error into the public surface.
    #[track_caller]
    pub(crate) fn flavor(err: audb_flavor::error::Error) -> Error {
        use audb_flavor::error::ErrorKind as F;
        let kind = match &*err {
            F::InvalidFlavor(msg) => Self::InvalidArgument(format!("invalid flavor: {msg}")),
            F::UnsupportedConversion(msg) => Self::UnsupportedConversion(msg.clone()),
            F::Corrupt(msg) => Self::Corrupt(msg.clone()),
            F::Io(e) => Self::Io(clone_io(e)),
        };
        err.raise(kind)
    }

    /// Fold a configuration error into the public surface.
    #[track_caller]
    pub(crate) fn config(err: audb_config::error::Error) -> Error {
        let kind = Self::InvalidArgument(err.to_string());
        err.raise(kind)
    }
}
