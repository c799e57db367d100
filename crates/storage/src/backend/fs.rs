//! Local filesystem repository backend.
//!
//! Objects live as plain files under a root directory, one file per key.
//! Uploads are written to a temporary sibling and renamed into place so a
//! concurrent reader never observes a half-written object.

use crate::error::{ErrorKind, Result};
use crate::{Backend, key};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Repository backend on the local filesystem.
#[derive(Clone, Debug)]
pub struct FileSystemBackend {
    name: String,
    root: PathBuf,
}
impl FileSystemBackend {
    /// Create a backend rooted at `root`. The directory is created lazily on
    /// the first `put`; a missing root just behaves as an empty repository.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), root: root.into() }
    }

    fn absolute(&self, repo_key: &str) -> Result<PathBuf> {
        key::validate(repo_key)?;
        Ok(self.root.join(repo_key))
    }
}

#[async_trait]
impl Backend for FileSystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, repo_key: &str) -> Result<bool> {
        let path = self.absolute(repo_key)?;
        Ok(tokio::fs::try_exists(&path).await.map_err(ErrorKind::Io)?)
    }

    async fn get(&self, repo_key: &str, dest: &Path) -> Result<()> {
        let path = self.absolute(repo_key)?;
        if !tokio::fs::try_exists(&path).await.map_err(ErrorKind::Io)? {
            exn::bail!(ErrorKind::NotFound(repo_key.to_string()));
        }
        tokio::fs::copy(&path, dest).await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    async fn put(&self, src: &Path, repo_key: &str) -> Result<()> {
        let path = self.absolute(repo_key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
        }
        // Copy-then-rename within the destination directory keeps the rename
        // on one filesystem and the partial copy invisible to readers.
        let temp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::copy(src, &temp).await.map_err(ErrorKind::Io)?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            _ = tokio::fs::remove_file(&temp).await;
            exn::bail!(ErrorKind::Io(e));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !tokio::fs::try_exists(&self.root).await.map_err(ErrorKind::Io)? {
            return Ok(keys);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(ErrorKind::Io)?;
            while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(ErrorKind::Io)?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else { continue };
                let repo_key =
                    relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
                // In-flight uploads stay invisible until their rename
                if repo_key.contains(".tmp-") {
                    continue;
                }
                if repo_key.starts_with(prefix) {
                    keys.push(repo_key);
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    async fn delete(&self, repo_key: &str) -> Result<()> {
        let path = self.absolute(repo_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(repo_key.to_string()))
            },
            Err(e) => exn::bail!(ErrorKind::Io(e)),
        }
    }
}
