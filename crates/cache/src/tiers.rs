//! Two-tier cache layout.
//!
//! A shared tier (read-first, often a network mount maintained by one
//! producer) sits in front of every user's private tier. Reads consult
//! shared then user; writes land in the user tier unless the shared tier is
//! writable and explicitly requested.
//!
//! Layout below either root: `<name>/<version>/<flavor_id>/` holds the
//! complete materialized database for one flavor of one version, plus the
//! `.lock` and `.complete` marker files.

use crate::error::{ErrorKind, Result};
use std::path::{Path, PathBuf};

/// Lock file name inside a flavor directory.
pub const LOCK_FILE: &str = ".lock";
/// Completeness sentinel inside a flavor directory.
pub const COMPLETE_FILE: &str = ".complete";

/// The shared and user cache roots an operation works against.
#[derive(Clone, Debug)]
pub struct CacheTiers {
    shared: Option<PathBuf>,
    user: PathBuf,
}

impl CacheTiers {
    /// Cache tiers from a user root and an optional shared root.
    pub fn new(user: impl Into<PathBuf>, shared: Option<PathBuf>) -> Self {
        Self { user: user.into(), shared }
    }

    /// The writable user tier root.
    pub fn user(&self) -> &Path {
        &self.user
    }

    /// The read-first shared tier root, when configured.
    pub fn shared(&self) -> Option<&Path> {
        self.shared.as_deref()
    }

    /// Flavor directory below an arbitrary root.
    pub fn flavor_dir_in(root: &Path, name: &str, version: &str, flavor_id: &str) -> PathBuf {
        root.join(name).join(version).join(flavor_id)
    }

    /// Flavor directory in the user tier (the default write target).
    pub fn user_flavor_dir(&self, name: &str, version: &str, flavor_id: &str) -> PathBuf {
        Self::flavor_dir_in(&self.user, name, version, flavor_id)
    }

    /// Resolve a flavor directory for reading: shared tier first, then user.
    /// Returns the first directory that exists.
    pub fn resolve(&self, name: &str, version: &str, flavor_id: &str) -> Option<PathBuf> {
        self.roots()
            .into_iter()
            .map(|root| Self::flavor_dir_in(root, name, version, flavor_id))
            .find(|dir| dir.is_dir())
    }

    /// The write target for materializing a flavor.
    ///
    /// The user tier unless the shared tier is requested *and* writable.
    pub fn write_flavor_dir(&self, name: &str, version: &str, flavor_id: &str, prefer_shared: bool) -> PathBuf {
        if prefer_shared {
            if let Some(shared) = &self.shared {
                if dir_is_writable(shared) {
                    return Self::flavor_dir_in(shared, name, version, flavor_id);
                }
                tracing::warn!(shared = %shared.display(), "shared cache not writable, falling back to user cache");
            }
        }
        self.user_flavor_dir(name, version, flavor_id)
    }

    /// Roots in read resolution order: shared, then user.
    pub fn roots(&self) -> Vec<&Path> {
        let mut roots = Vec::with_capacity(2);
        if let Some(shared) = &self.shared {
            roots.push(shared.as_path());
        }
        roots.push(&self.user);
        roots
    }

    /// All sibling version directories of `(name, *, flavor_id)` across both
    /// tiers, used by the cross-version reuse scan. Sorted newest first so
    /// reuse prefers recent versions.
    pub fn sibling_versions(&self, name: &str, flavor_id: &str) -> Vec<(semver::Version, PathBuf)> {
        let mut siblings = Vec::new();
        for root in self.roots() {
            let name_dir = root.join(name);
            let Ok(entries) = std::fs::read_dir(&name_dir) else { continue };
            for entry in entries.flatten() {
                let Ok(version) = semver::Version::parse(&entry.file_name().to_string_lossy()) else { continue };
                let flavor_dir = entry.path().join(flavor_id);
                if flavor_dir.is_dir() {
                    siblings.push((version, flavor_dir));
                }
            }
        }
        siblings.sort_by(|(a, _), (b, _)| b.cmp(a));
        siblings
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    // A metadata readonly bit misses ACLs and read-only mounts; probing with
    // an actual create is the only reliable answer.
    let probe = dir.join(format!(".probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            _ = std::fs::remove_file(&probe);
            true
        },
        Err(_) => false,
    }
}

/// Write the completeness sentinel into a flavor directory.
pub fn mark_complete(flavor_dir: &Path) -> Result<()> {
    std::fs::write(flavor_dir.join(COMPLETE_FILE), b"").map_err(ErrorKind::Io)?;
    Ok(())
}

/// Drop the completeness sentinel (before mutating the directory).
pub fn clear_complete(flavor_dir: &Path) -> Result<()> {
    match std::fs::remove_file(flavor_dir.join(COMPLETE_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => exn::bail!(ErrorKind::Io(e)),
    }
}

/// `true` when the completeness sentinel is present.
pub fn is_marked_complete(flavor_dir: &Path) -> bool {
    flavor_dir.join(COMPLETE_FILE).is_file()
}
