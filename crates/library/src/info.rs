//! Header-only introspection.
//!
//! Every question a header can answer (schemes, splits, raters, tables,
//! languages, description) costs one small `db.yaml` fetch; duration and
//! file-count totals add the dependency table. Media is never materialized.

use crate::error::{ErrorKind, Result};
use crate::header::Header;
use crate::load::fetch_object;
use crate::resolver;
use crate::retry::REQUEST_TIMEOUT;
use audb_cache::{CacheTiers, FlavorLock};
use audb_config::Config;
use audb_deps::Dependencies;
use audb_flavor::DEFAULT_FLAVOR_ID;
use audb_storage::{BackendRegistry, key};
use std::path::PathBuf;

async fn cached_object(
    config: &Config,
    registry: &BackendRegistry,
    name: &str,
    version: Option<&str>,
    file_name: &str,
) -> Result<PathBuf> {
    let version = match version {
        Some(version) => version.to_string(),
        None => resolver::latest_version(config, registry, name).await?.to_string(),
    };
    let tiers = CacheTiers::new(config.cache_root(), config.shared_cache_root());
    if let Some(dir) = tiers.resolve(name, &version, DEFAULT_FLAVOR_ID) {
        let cached = dir.join(file_name);
        if cached.is_file() {
            return Ok(cached);
        }
    }
    let (_repository, backend) = resolver::repository(config, registry, name, &version).await?;
    let dir = tiers.write_flavor_dir(name, &version, DEFAULT_FLAVOR_ID, false);
    let _lock = FlavorLock::acquire(&dir).await.map_err(ErrorKind::cache)?;
    let dest = dir.join(file_name);
    if dest.is_file() {
        return Ok(dest);
    }
    let repo_key = match file_name {
        key::DEPS_FILE => key::deps(name, &version),
        _ => key::header(name, &version),
    };
    fetch_object(&backend, &repo_key, &dir, file_name, REQUEST_TIMEOUT).await
}

/// Fetch (or reuse) just the header of a version.
pub async fn info(config: &Config, registry: &BackendRegistry, name: &str, version: Option<&str>) -> Result<Header> {
    let path = cached_object(config, registry, name, version, key::HEADER_FILE).await?;
    Header::load(path)
}

/// Fetch (or reuse) just the dependency table of a version.
pub async fn dependencies(
    config: &Config,
    registry: &BackendRegistry,
    name: &str,
    version: Option<&str>,
) -> Result<Dependencies> {
    let path = cached_object(config, registry, name, version, key::DEPS_FILE).await?;
    tokio::task::spawn_blocking(move || Dependencies::load(&path))
        .await
        .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
        .map_err(ErrorKind::deps)
}

/// Total duration in seconds over all live (non-tombstoned) media.
pub async fn total_duration(
    config: &Config,
    registry: &BackendRegistry,
    name: &str,
    version: Option<&str>,
) -> Result<f64> {
    let deps = dependencies(config, registry, name, version).await?;
    Ok(deps.media().filter(|p| !deps.removed(p).unwrap_or(false)).filter_map(|p| deps.duration(p).ok()).sum())
}

/// Number of live media files in a version.
pub async fn media_count(
    config: &Config,
    registry: &BackendRegistry,
    name: &str,
    version: Option<&str>,
) -> Result<usize> {
    let deps = dependencies(config, registry, name, version).await?;
    Ok(deps.media().filter(|p| !deps.removed(p).unwrap_or(false)).count())
}
