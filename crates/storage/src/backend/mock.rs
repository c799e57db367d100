//! In-memory repository backend for testing.

use crate::error::{ErrorKind, Result};
use crate::{Backend, key};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;

/// In-memory repository backend for testing.
///
/// Objects are stored in a [`BTreeMap`] behind a [`RwLock`], so all trait
/// methods operate on `&self` without external synchronisation and listings
/// are naturally sorted. Failures can be injected per key to exercise the
/// retry paths of the pipelines.
///
/// # Examples
///
/// ```
/// use audb_storage::{Backend, MockBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_objects([("emodb/1.0.0/db.yaml", b"name: emodb".to_vec())]);
/// assert!(backend.exists("emodb/1.0.0/db.yaml").await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Remaining injected `get` failures per key.
    failures: RwLock<HashMap<String, usize>>,
}
impl Default for MockBackend {
    fn default() -> Self {
        Self::with_objects(std::iter::empty::<(String, Vec<u8>)>())
    }
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects.
    ///
    /// Panics on invalid keys; if test setup is wrong, the test should not
    /// pass.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        for (repo_key, data) in objects {
            let repo_key = repo_key.into();
            if key::validate(&repo_key).is_err() {
                panic!("MockBackend::with_objects: invalid key {repo_key}");
            }
            map.insert(repo_key, data.into());
        }
        Self {
            name: "mock".to_string(),
            objects: RwLock::new(map),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make the next `times` calls to [`get`](Backend::get) for `repo_key`
    /// fail with a network error.
    pub async fn fail_gets(&self, repo_key: impl Into<String>, times: usize) {
        self.failures.write().await.insert(repo_key.into(), times);
    }

    /// Snapshot of all stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Raw object bytes, for assertions.
    pub async fn object(&self, repo_key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(repo_key).cloned()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, repo_key: &str) -> Result<bool> {
        key::validate(repo_key)?;
        Ok(self.objects.read().await.contains_key(repo_key))
    }

    async fn get(&self, repo_key: &str, dest: &Path) -> Result<()> {
        key::validate(repo_key)?;
        {
            let mut failures = self.failures.write().await;
            if let Some(remaining) = failures.get_mut(repo_key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    exn::bail!(ErrorKind::Network(format!("injected failure for {repo_key}")));
                }
            }
        }
        let data = self
            .objects
            .read()
            .await
            .get(repo_key)
            .cloned()
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(repo_key.to_string())))?;
        tokio::fs::write(dest, data).await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    async fn put(&self, src: &Path, repo_key: &str) -> Result<()> {
        key::validate(repo_key)?;
        let data = tokio::fs::read(src).await.map_err(ErrorKind::Io)?;
        self.objects.write().await.insert(repo_key.to_string(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.objects.read().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn delete(&self, repo_key: &str) -> Result<()> {
        key::validate(repo_key)?;
        self.objects
            .write()
            .await
            .remove(repo_key)
            .map(|_| ())
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(repo_key.to_string())))
    }
}
