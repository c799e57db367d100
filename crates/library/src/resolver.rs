//! Version resolution across configured repositories.
//!
//! Repositories are consulted in declaration order. Read paths are
//! forgiving: a repository that doesn't exist, rejects our credentials, or
//! uses a backend this build doesn't support is skipped with a trace log.
//! Only transport-level failures surface, because silently hiding those
//! would turn a flaky network into "database not found".

use crate::error::{ErrorKind, Result};
use audb_config::{Config, Repository};
use audb_storage::error::ErrorKind as StorageErrorKind;
use audb_storage::{BackendHandle, BackendRegistry, key};
use std::collections::BTreeSet;

/// One `(name, version)` pair a repository offers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailableEntry {
    pub name: String,
    pub version: semver::Version,
    pub repository: String,
    pub backend: String,
    pub host: String,
}

/// Decide whether a per-repository error is skippable on a read path.
fn surface_on_read(err: audb_storage::error::Error, repository: &Repository) -> Result<()> {
    match &*err {
        StorageErrorKind::Network(_) => Err(ErrorKind::storage(err)),
        _ => {
            tracing::trace!(repository = %repository.name, error = %err, "skipping repository");
            Ok(())
        },
    }
}

/// Open a repository's backend for reading; `None` means skip it.
fn open_for_read(registry: &BackendRegistry, repository: &Repository) -> Option<BackendHandle> {
    match registry.open(repository.backend.as_str(), &repository.name, &repository.host) {
        Ok(backend) => Some(backend),
        Err(err) => {
            tracing::trace!(repository = %repository.name, error = %err, "skipping repository");
            None
        },
    }
}

/// All published versions of `name`, unioned across repositories, sorted.
pub async fn versions(config: &Config, registry: &BackendRegistry, name: &str) -> Result<Vec<semver::Version>> {
    let mut found = BTreeSet::new();
    for repository in &config.repositories {
        let Some(backend) = open_for_read(registry, repository) else { continue };
        match key::ls_versions(backend.as_ref(), name).await {
            Ok(versions) => found.extend(versions),
            Err(err) => surface_on_read(err, repository)?,
        }
    }
    Ok(found.into_iter().collect())
}

/// The highest published version of `name`.
pub async fn latest_version(config: &Config, registry: &BackendRegistry, name: &str) -> Result<semver::Version> {
    versions(config, registry, name)
        .await?
        .pop()
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(name.to_string())))
}

/// The first configured repository carrying the exact `(name, version)`,
/// with its opened backend.
pub async fn repository(
    config: &Config,
    registry: &BackendRegistry,
    name: &str,
    version: &str,
) -> Result<(Repository, BackendHandle)> {
    for repository in &config.repositories {
        let Some(backend) = open_for_read(registry, repository) else { continue };
        let published = async {
            Ok::<_, audb_storage::error::Error>(
                backend.exists(&key::header(name, version)).await?
                    && backend.exists(&key::deps(name, version)).await?,
            )
        }
        .await;
        match published {
            Ok(true) => return Ok((repository.clone(), backend)),
            Ok(false) => {},
            Err(err) => surface_on_read(err, repository)?,
        }
    }
    exn::bail!(ErrorKind::NotFound(format!("{name} v{version}")));
}

/// Enumerate every published `(name, version)` pair across the given
/// repositories (defaults to all configured ones). Pairs missing their
/// header or dependency table are skipped.
pub async fn available(
    config: &Config,
    registry: &BackendRegistry,
    repositories: Option<&[String]>,
) -> Result<Vec<AvailableEntry>> {
    let mut entries = Vec::new();
    for repository in &config.repositories {
        if let Some(wanted) = repositories {
            if !wanted.contains(&repository.name) {
                continue;
            }
        }
        let Some(backend) = open_for_read(registry, repository) else { continue };
        let keys = match backend.list("").await {
            Ok(keys) => keys,
            Err(err) => {
                surface_on_read(err, repository)?;
                continue;
            },
        };
        let key_set: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
        for repo_key in &key_set {
            let mut segments = repo_key.split('/');
            let (Some(name), Some(segment), Some(file), None) =
                (segments.next(), segments.next(), segments.next(), segments.next())
            else {
                continue;
            };
            if file != key::HEADER_FILE {
                continue;
            }
            let Ok(version) = semver::Version::parse(segment) else { continue };
            if !key_set.contains(key::deps(name, segment).as_str()) {
                continue;
            }
            entries.push(AvailableEntry {
                name: name.to_string(),
                version,
                repository: repository.name.clone(),
                backend: repository.backend.to_string(),
                host: repository.host.clone(),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audb_config::BackendKind;
    use audb_storage::MockBackend;
    use std::sync::Arc;

    fn mock_config(repos: &[&str]) -> Config {
        Config {
            repositories: repos.iter().map(|n| Repository::new(*n, "", BackendKind::FileSystem)).collect(),
            ..Config::default()
        }
    }

    fn registry_with(backend: MockBackend) -> BackendRegistry {
        audb_storage::registry::fixed("file-system", Arc::new(backend))
    }

    fn published(name: &str, version: &str) -> [(String, Vec<u8>); 2] {
        [(key::header(name, version), b"h".to_vec()), (key::deps(name, version), b"d".to_vec())]
    }

    #[tokio::test]
    async fn test_versions_unions_and_sorts() {
        let mut objects = Vec::new();
        objects.extend(published("emodb", "1.0.0"));
        objects.extend(published("emodb", "10.0.0"));
        objects.extend(published("emodb", "1.1.0"));
        // Unpublished half-version is invisible
        objects.push((key::deps("emodb", "2.0.0"), b"d".to_vec()));
        let registry = registry_with(MockBackend::with_objects(objects));
        let config = mock_config(&["r1"]);

        let versions = versions(&config, &registry, "emodb").await.unwrap();
        let versions: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(versions, vec!["1.0.0".to_string(), "1.1.0".to_string(), "10.0.0".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_version_not_found() {
        let registry = registry_with(MockBackend::default());
        let config = mock_config(&["r1"]);
        let err = latest_version(&config, &registry, "nope").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_repository_picks_first_in_declaration_order() {
        let registry = registry_with(MockBackend::with_objects(published("emodb", "1.0.0")));
        let config = mock_config(&["first", "second"]);
        let (repository, _backend) = repository(&config, &registry, "emodb", "1.0.0").await.unwrap();
        assert_eq!(repository.name, "first");
    }

    #[tokio::test]
    async fn test_unsupported_backend_skipped_on_read() {
        let mut config = mock_config(&["good"]);
        config.repositories.insert(0, Repository::new("bad", "https://x", BackendKind::Artifactory));
        let registry = registry_with(MockBackend::with_objects(published("emodb", "1.0.0")));
        let (repository, _backend) = repository(&config, &registry, "emodb", "1.0.0").await.unwrap();
        assert_eq!(repository.name, "good");
    }

    #[tokio::test]
    async fn test_available_lists_pairs() {
        let mut objects = Vec::new();
        objects.extend(published("emodb", "1.0.0"));
        objects.extend(published("timit", "2.0.0"));
        objects.push((key::header("broken", "1.0.0"), b"h".to_vec()));
        let registry = registry_with(MockBackend::with_objects(objects));
        let config = mock_config(&["r1"]);

        let entries = available(&config, &registry, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "emodb" && e.version.to_string() == "1.0.0"));
        assert!(entries.iter().any(|e| e.name == "timit"));
        assert!(!entries.iter().any(|e| e.name == "broken"));
    }
}
