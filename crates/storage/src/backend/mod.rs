//! Repository backend trait and implementations.
//!
//! A backend is the transport that stores a repository's objects: the local
//! filesystem, an S3-compatible object store, or anything else registered
//! through the [registry](crate::registry::BackendRegistry). The core is
//! agnostic to the implementation; it only relies on the capability set
//! below and on the atomic-visibility guarantee of [`put`](Backend::put).

mod fs;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::fs::FileSystemBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Unified interface for repository backends.
///
/// All operations are asynchronous and keyed by slash-separated repository
/// keys (validated through [`key::validate`](crate::key::validate)). Object
/// payloads move through the local filesystem: [`get`](Self::get) streams
/// into a caller-provided file and [`put`](Self::put) reads from one, so
/// archives never have to fit in memory.
///
/// # Atomic visibility
///
/// `put` must be atomic from a reader's perspective: a partially uploaded
/// object is never observable through `exists`, `get` or `list`. The
/// filesystem backend writes to a temp name and renames; object stores give
/// this for free.
///
/// # Examples
///
/// ```no_run
/// use audb_storage::{Backend, error::Result};
/// use std::path::Path;
///
/// async fn fetch_header(backend: &dyn Backend, dest: &Path) -> Result<()> {
///     if backend.exists("emodb/1.0.0/db.yaml").await? {
///         backend.get("emodb/1.0.0/db.yaml", dest).await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name of the configured repository this backend serves (used for
    /// logging and the `available()` listing only).
    fn name(&self) -> &str;

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Stream an object into the caller-provided local file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) when the key
    /// is absent, [`Corrupt`](crate::error::ErrorKind::Corrupt) when the
    /// transport detects a server-side checksum mismatch.
    async fn get(&self, key: &str, dest: &Path) -> Result<()>;

    /// Upload a local file to the given key.
    ///
    /// Must provide atomic visibility; see the trait docs.
    async fn put(&self, src: &Path, key: &str) -> Result<()>;

    /// List all keys under a prefix, sorted. Deterministic for a fixed
    /// repository state.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Maintenance paths only; never part of publish or
    /// load.
    async fn delete(&self, key: &str) -> Result<()>;
}
