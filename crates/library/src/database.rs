//! Handle to a loaded database.

use crate::header::Header;
use audb_deps::Dependencies;
use audb_flavor::Flavor;
use std::path::{Path, PathBuf};

/// A materialized database: one flavor of one version, complete for the
/// scope that was requested, rooted in a cache flavor directory.
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) flavor: Flavor,
    pub(crate) flavor_id: String,
    pub(crate) root: PathBuf,
    pub(crate) header: Header,
    pub(crate) deps: Dependencies,
}

impl Database {
    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loaded version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Flavor the tree was materialized with.
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// Flavor id of the materialized tree.
    pub fn flavor_id(&self) -> &str {
        &self.flavor_id
    }

    /// The flavor directory holding the database tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parsed database header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The version's dependency table.
    pub fn deps(&self) -> &Dependencies {
        &self.deps
    }

    /// Total duration in seconds over the live (non-tombstoned) media rows.
    ///
    /// Answered from the in-memory dependency table; nothing is fetched.
    pub fn files_duration(&self) -> f64 {
        self.deps
            .media()
            .filter(|p| !self.deps.removed(p).unwrap_or(false))
            .filter_map(|p| self.deps.duration(p).ok())
            .sum()
    }

    /// Absolute path of an artifact inside the loaded tree.
    ///
    /// The path is the dependency table's (original) artifact path; for
    /// non-default flavors the on-disk file may carry the flavor's mapped
    /// extension instead; see [`media_path`](Self::media_path).
    pub fn file_path(&self, artifact: &str) -> PathBuf {
        self.root.join(artifact)
    }

    /// Absolute on-disk path of a media artifact, with the flavor's
    /// destination mapping applied (`audio/001.wav` → `audio/001.flac` for
    /// a flac flavor).
    pub fn media_path(&self, artifact: &str) -> PathBuf {
        self.root.join(self.flavor.destination(artifact))
    }
}
