//! Cross-version file reuse.
//!
//! Consecutive versions of a database share most of their media bytes. When
//! materializing `(name, V, flavor)`, any sibling `(name, V', flavor)`
//! directory in either tier may already hold a file with the right checksum;
//! hard-linking it in is far cheaper than re-fetching the archive. Reuse is
//! best-effort throughout: any failure just means the file is fetched.

use crate::tiers::CacheTiers;
use audb_deps::Dependencies;
use std::path::{Path, PathBuf};

/// Sibling flavor directories usable as reuse sources, with their dependency
/// tables preloaded.
#[derive(Debug, Default)]
pub struct ReusePool {
    sources: Vec<(PathBuf, Dependencies)>,
}

impl ReusePool {
    /// Scan both cache tiers for sibling versions of `(name, flavor_id)`,
    /// skipping `exclude_version` (the version being materialized).
    ///
    /// Sibling directories without a readable dependency table are ignored;
    /// the pool never fails.
    pub fn scan(tiers: &CacheTiers, name: &str, flavor_id: &str, exclude_version: &str) -> Self {
        let mut sources = Vec::new();
        for (version, dir) in tiers.sibling_versions(name, flavor_id) {
            if version.to_string() == exclude_version {
                continue;
            }
            match Dependencies::load(dir.join("db.parquet")) {
                Ok(deps) => sources.push((dir, deps)),
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "skipping reuse source without dependency table");
                },
            }
        }
        Self { sources }
    }

    /// Number of usable reuse sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// `true` when no sibling version can contribute files.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Try to materialize `path` (relative artifact path, expected content
    /// `checksum`) into `dest_dir` from any sibling.
    ///
    /// A sibling qualifies when its dependency table records the same
    /// checksum for the same path and the file exists on disk. Hard-link
    /// first, copy as fallback. Returns the source directory on success.
    pub fn adopt(&self, path: &str, checksum: &str, dest_dir: &Path) -> Option<&Path> {
        let dest = dest_dir.join(path);
        for (dir, deps) in &self.sources {
            if deps.checksum(path).map(|c| c == checksum).unwrap_or(false) {
                let source = dir.join(path);
                if !source.is_file() {
                    continue;
                }
                if let Some(parent) = dest.parent() {
                    if std::fs::create_dir_all(parent).is_err() {
                        continue;
                    }
                }
                _ = std::fs::remove_file(&dest);
                let linked = std::fs::hard_link(&source, &dest).is_ok()
                    || std::fs::copy(&source, &dest).is_ok();
                if linked {
                    return Some(dir.as_path());
                }
            }
        }
        None
    }
}
