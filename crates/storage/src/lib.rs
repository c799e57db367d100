//! Repository storage for audb.
//!
//! Defines the [`Backend`] capability set the pipelines consume, the
//! canonical [key naming scheme](key), the built-in filesystem and
//! S3-compatible implementations, and the open [registry](registry) that
//! maps configured backend kinds to factories.

pub mod backend;
pub mod error;
pub mod key;
pub mod registry;

pub use crate::backend::Backend;
pub use crate::backend::FileSystemBackend;
#[cfg(feature = "mock")]
pub use crate::backend::MockBackend;
#[cfg(feature = "s3")]
pub use crate::backend::S3Backend;
pub use crate::registry::BackendRegistry;
use std::sync::Arc;

/// Shared handle to an opened backend.
pub type BackendHandle = Arc<dyn Backend + Send + Sync>;
