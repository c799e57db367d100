//! Backend registry.
//!
//! The backend set is open: kinds are resolved by name through a registry of
//! factories, so embedders can plug in transports the core has never heard
//! of. Unregistered kinds surface [`UnsupportedBackend`](ErrorKind::UnsupportedBackend);
//! read paths treat that as "skip this repository", write paths reject.

use crate::BackendHandle;
use crate::backend::FileSystemBackend;
use crate::error::{ErrorKind, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Factory building a backend for a `(repository name, host)` pair.
pub type BackendFactory = Arc<dyn Fn(&str, &str) -> Result<BackendHandle> + Send + Sync>;

/// Registry mapping backend kind names to factories.
///
/// [`BackendRegistry::default`] registers the built-in kinds:
/// `file-system` always, `s3` and `minio` when the `s3` feature is enabled.
/// `artifactory` is recognized in configuration but has no built-in factory;
/// opening it fails with `UnsupportedBackend` unless one is registered.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Registry with the built-in backend kinds.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("file-system", |name, host| {
            // The host is the repository root directory; keys (which carry
            // the database name as their first segment) map to paths below it.
            Ok(Arc::new(FileSystemBackend::new(name, PathBuf::from(host))) as BackendHandle)
        });
        #[cfg(feature = "s3")]
        {
            registry.register("s3", |name, host| {
                let endpoint = (!host.is_empty()).then(|| host.to_string());
                Ok(Arc::new(crate::backend::S3Backend::from_env(name, endpoint)?) as BackendHandle)
            });
            registry.register("minio", |name, host| {
                Ok(Arc::new(crate::backend::S3Backend::from_env(name, Some(host.to_string()))?) as BackendHandle)
            });
        }
        registry
    }

    /// Register (or replace) a factory for a backend kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&str, &str) -> Result<BackendHandle> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// `true` when a factory is registered for the kind.
    pub fn supports(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Open a backend for a repository.
    pub fn open(&self, kind: &str, name: &str, host: &str) -> Result<BackendHandle> {
        match self.factories.get(kind) {
            Some(factory) => factory(name, host),
            None => exn::bail!(ErrorKind::UnsupportedBackend(kind.to_string())),
        }
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry").field("kinds", &self.factories.keys().collect::<Vec<_>>()).finish()
    }
}

/// Convenience: wrap an existing backend instance as a one-kind registry
/// entry, mostly for tests wiring a mock.
pub fn fixed(kind: impl Into<String>, backend: BackendHandle) -> BackendRegistry {
    let mut registry = BackendRegistry::default();
    registry.register(kind, move |_, _| Ok(backend.clone()));
    registry
}
