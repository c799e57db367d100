//! audb: versioned, content-addressed management of annotated media corpora.
//!
//! Producers [`publish`] immutable, incrementally updatable database
//! versions to pluggable repositories; consumers [`load`] any version,
//! optionally in a transformed audio [`Flavor`] and optionally restricted to
//! a subset of tables, media and attachments, into a local two-tier cache.
//! [`info`] answers header-level questions without touching media, and
//! [`stream`] iterates a table batch-wise with on-demand media fetch.

mod database;
pub mod error;
mod header;
mod info;
mod load;
mod progress;
mod publish;
mod resolver;
mod retry;
mod stream;

pub use crate::database::Database;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::header::{Attachment, Header};
pub use crate::info::{dependencies, info, media_count, total_duration};
pub use crate::load::{CachedEntry, LoadRequest, cached, is_cached, load, load_to};
pub use crate::progress::{NullProgress, Progress, ProgressEvent};
pub use crate::publish::{PublishRequest, publish};
pub use crate::resolver::{AvailableEntry, available, latest_version, repository, versions};
pub use crate::stream::{DatabaseStream, StreamRequest, stream};

// The collaborators callers wire together with the pipelines.
pub use audb_config::{BackendKind, Config, Repository};
pub use audb_deps::{DepType, Dependencies, Row};
pub use audb_flavor::{AudioConverter, AudioFormat, Flavor, RefusingConverter};
pub use audb_storage::{Backend, BackendHandle, BackendRegistry};

/// Load the process configuration from an explicit file (plus the
/// environment), folding failures into the library's error surface so
/// callers deal with one [`ErrorKind`] throughout.
pub fn load_config(file: impl AsRef<std::path::Path>) -> Result<Config> {
    Config::load_from(file).map_err(error::ErrorKind::config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audb_flavor::{MockConverter, write_wav};
    use std::path::Path;
    use std::sync::Arc;

    const DB_YAML: &str = "name: emodb\ndescription: test corpus\nlanguages: [deu]\n\
                           schemes:\n  age:\n    dtype: int\n\
                           tables:\n  age:\n    type: filewise\n";

    struct Fixture {
        _repo_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        build_dir: tempfile::TempDir,
        config: Config,
        registry: BackendRegistry,
    }

    fn fixture() -> Fixture {
        let repo_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let build_dir = tempfile::tempdir().unwrap();
        let config = Config {
            repositories: vec![Repository::new(
                "repo",
                repo_dir.path().to_str().unwrap(),
                BackendKind::FileSystem,
            )],
            cache_root: Some(cache_dir.path().to_path_buf()),
            shared_cache_root: None,
            num_workers: Some(2),
        };
        Fixture {
            config,
            registry: BackendRegistry::builtin(),
            _repo_dir: repo_dir,
            _cache_dir: cache_dir,
            build_dir,
        }
    }

    impl Fixture {
        fn seed_build(&self, wavs: &[(&str, f64)]) {
            let root = self.build_dir.path();
            std::fs::write(root.join("db.yaml"), DB_YAML).unwrap();
            std::fs::write(root.join("db.age.parquet"), b"opaque table bytes").unwrap();
            std::fs::create_dir_all(root.join("audio")).unwrap();
            for (name, seconds) in wavs {
                write_wav(root.join("audio").join(name), 1, 16, 16000, *seconds).unwrap();
            }
        }

        async fn publish(&self, version: &str, previous: Option<&str>) -> Result<Dependencies> {
            let mut request = PublishRequest::new(self.build_dir.path(), version, "repo");
            request.previous_version = previous.map(str::to_string);
            publish(&self.config, &self.registry, request).await
        }

        async fn load(&self, version: &str) -> Result<Database> {
            let mut request = LoadRequest::new("emodb");
            request.version = Some(version.to_string());
            load(&self.config, &self.registry, Arc::new(RefusingConverter), request).await
        }

        fn backend(&self) -> BackendHandle {
            self.registry.open("file-system", "repo", self.config.repositories[0].host.as_str()).unwrap()
        }
    }

    fn md5_of(path: &Path) -> String {
        format!("{:x}", md5::compute(std::fs::read(path).unwrap()))
    }

    #[tokio::test]
    async fn test_s1_minimal_publish_and_load() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.5), ("003.wav", 2.0)]);
        let deps = fx.publish("1.0.0", None).await.unwrap();
        assert_eq!(deps.len(), 4);

        let backend = fx.backend();
        for key in ["emodb/1.0.0/db.yaml", "emodb/1.0.0/db.parquet", "emodb/meta/1.0.0/age.zip"] {
            assert!(backend.exists(key).await.unwrap(), "missing {key}");
        }
        let media_archives = backend.list("emodb/media/1.0.0/").await.unwrap();
        assert_eq!(media_archives.len(), 3);

        let db = fx.load("1.0.0").await.unwrap();
        for file in ["audio/001.wav", "audio/002.wav", "audio/003.wav", "db.age.parquet"] {
            assert_eq!(
                md5_of(&db.root().join(file)),
                md5_of(&fx.build_dir.path().join(file)),
                "bytes differ for {file}",
            );
        }
        assert_eq!(db.header().name.as_deref(), Some("emodb"));
        assert!((db.deps().duration("audio/002.wav").unwrap() - 1.5).abs() < 1e-6);
        assert!((db.files_duration() - 4.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_s2_incremental_publish() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0), ("003.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        write_wav(fx.build_dir.path().join("audio/004.wav"), 1, 16, 16000, 1.0).unwrap();
        let deps = fx.publish("1.1.0", Some("1.0.0")).await.unwrap();

        let backend = fx.backend();
        let new_archives = backend.list("emodb/media/1.1.0/").await.unwrap();
        assert_eq!(new_archives.len(), 1, "only the new file gets an archive");
        assert_eq!(deps.media().count(), 4);
        for old in ["audio/001.wav", "audio/002.wav", "audio/003.wav"] {
            assert_eq!(deps.version(old).unwrap(), "1.0.0");
        }
        assert_eq!(deps.version("audio/004.wav").unwrap(), "1.1.0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_s3_cross_version_reuse_hard_links() {
        use std::os::unix::fs::MetadataExt;
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0), ("003.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        let old = fx.load("1.0.0").await.unwrap();

        write_wav(fx.build_dir.path().join("audio/004.wav"), 1, 16, 16000, 1.0).unwrap();
        fx.publish("1.1.0", Some("1.0.0")).await.unwrap();
        let new = fx.load("1.1.0").await.unwrap();

        for shared_file in ["audio/001.wav", "audio/002.wav", "audio/003.wav"] {
            let old_ino = std::fs::metadata(old.root().join(shared_file)).unwrap().ino();
            let new_ino = std::fs::metadata(new.root().join(shared_file)).unwrap().ino();
            assert_eq!(old_ino, new_ino, "{shared_file} was fetched instead of hard-linked");
        }
        assert!(new.root().join("audio/004.wav").is_file());
    }

    #[tokio::test]
    async fn test_s4_flavor_materialization() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        let plain = fx.load("1.0.0").await.unwrap();

        let converter = Arc::new(MockConverter::default());
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        request.flavor = Flavor {
            format: Some(AudioFormat::Flac),
            sampling_rate: Some(44100),
            ..Flavor::default()
        };
        let flavored = load(&fx.config, &fx.registry, converter.clone(), request).await.unwrap();

        assert_ne!(flavored.root(), plain.root(), "flavor lives in a sibling directory");
        assert!(flavored.root().join("audio/001.flac").is_file());
        assert!(flavored.root().join("audio/002.flac").is_file());
        assert_eq!(flavored.media_path("audio/001.wav"), flavored.root().join("audio/001.flac"));
        assert_eq!(converter.conversions().len(), 2);
        // The dependency table copy is identical: checksums reflect originals
        assert_eq!(md5_of(&flavored.root().join("db.parquet")), md5_of(&plain.root().join("db.parquet")));
    }

    #[tokio::test]
    async fn test_s5_remove_then_reload() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0), ("003.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        write_wav(fx.build_dir.path().join("audio/004.wav"), 1, 16, 16000, 1.0).unwrap();
        fx.publish("1.1.0", Some("1.0.0")).await.unwrap();

        // Withdraw 002 from the build and publish a new version.
        std::fs::remove_file(fx.build_dir.path().join("audio/002.wav")).unwrap();
        let deps = fx.publish("1.2.0", Some("1.1.0")).await.unwrap();
        assert!(deps.removed("audio/002.wav").unwrap());
        assert_eq!(deps.removed_media().collect::<Vec<_>>(), vec!["audio/002.wav"]);

        // A fresh cache: the tombstoned file is not materialized...
        let fresh_cache = tempfile::tempdir().unwrap();
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.2.0".to_string());
        request.cache_root = Some(fresh_cache.path().to_path_buf());
        let db = load(&fx.config, &fx.registry, Arc::new(RefusingConverter), request).await.unwrap();
        assert!(!db.root().join("audio/002.wav").exists());
        assert!(db.root().join("audio/001.wav").is_file());

        // ...but the older version still fetches it.
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.1.0".to_string());
        request.cache_root = Some(fresh_cache.path().to_path_buf());
        let db = load(&fx.config, &fx.registry, Arc::new(RefusingConverter), request).await.unwrap();
        assert!(db.root().join("audio/002.wav").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_s6_concurrent_loaders_agree() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        let fx = Arc::new(fx);
        let a = {
            let fx = fx.clone();
            tokio::spawn(async move { fx.load("1.0.0").await })
        };
        let b = {
            let fx = fx.clone();
            tokio::spawn(async move { fx.load("1.0.0").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.root(), b.root());
        assert!(a.root().join("audio/001.wav").is_file());
        assert!(audb_cache::is_marked_complete(a.root()));
    }

    #[tokio::test]
    async fn test_load_missing_version_is_not_found() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        let err = fx.load("9.9.9").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let mut request = LoadRequest::new("no-such-db");
        request.version = None;
        let err = load(&fx.config, &fx.registry, Arc::new(RefusingConverter), request).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_version_ordering_enforced() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        let err = fx.publish("1.0.0", Some("1.0.0")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
        let err = fx.publish("0.9.0", Some("1.0.0")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_publish_rejects_uppercase_media_extension() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        std::fs::write(fx.build_dir.path().join("audio/BAD.WAV"), b"riff?").unwrap();
        let err = fx.publish("1.0.0", None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_interrupted_publish_is_invisible_and_restartable() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        // Simulate an interrupted publish: everything but the header.
        let backend = fx.backend();
        backend.delete("emodb/1.0.0/db.yaml").await.unwrap();
        let visible = versions(&fx.config, &fx.registry, "emodb").await.unwrap();
        assert!(visible.is_empty(), "headerless version must be invisible");

        // Re-running the same publish succeeds and commits visibility.
        fx.publish("1.0.0", None).await.unwrap();
        let visible = versions(&fx.config, &fx.registry, "emodb").await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_load_extends_incrementally() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        let mut narrow = LoadRequest::new("emodb");
        narrow.version = Some("1.0.0".to_string());
        narrow.media = Some(vec![regex::escape("audio/001.wav")]);
        let db = load(&fx.config, &fx.registry, Arc::new(RefusingConverter), narrow).await.unwrap();
        assert!(db.root().join("audio/001.wav").is_file());
        assert!(!db.root().join("audio/002.wav").exists());
        assert!(audb_cache::is_marked_complete(db.root()), "narrow scope still completes");

        // A wider request extends the same directory.
        let db = fx.load("1.0.0").await.unwrap();
        assert!(db.root().join("audio/002.wav").is_file());
    }

    #[tokio::test]
    async fn test_load_survives_transient_fetch_failures() {
        use audb_storage::MockBackend;
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        // Mirror the filesystem repository into a mock that fails twice.
        let backend = fx.backend();
        let mock = MockBackend::default().with_name("flaky");
        for repo_key in backend.list("").await.unwrap() {
            let staging = tempfile::NamedTempFile::new().unwrap();
            backend.get(&repo_key, staging.path()).await.unwrap();
            mock.put(staging.path(), &repo_key).await.unwrap();
        }
        let media_key = mock.list("emodb/media/1.0.0/").await.unwrap()[0].clone();
        mock.fail_gets(&media_key, 2).await;

        let mut config = fx.config.clone();
        config.repositories = vec![Repository::new("flaky", "", BackendKind::FileSystem)];
        let registry = audb_storage::registry::fixed("file-system", Arc::new(mock));
        let fresh_cache = tempfile::tempdir().unwrap();
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        request.cache_root = Some(fresh_cache.path().to_path_buf());
        let db = load(&config, &registry, Arc::new(RefusingConverter), request).await.unwrap();
        assert!(db.root().join("audio/001.wav").is_file());
    }

    #[tokio::test]
    async fn test_load_collects_permanent_failures() {
        use audb_storage::MockBackend;
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        let backend = fx.backend();
        let mock = MockBackend::default();
        for repo_key in backend.list("").await.unwrap() {
            let staging = tempfile::NamedTempFile::new().unwrap();
            backend.get(&repo_key, staging.path()).await.unwrap();
            mock.put(staging.path(), &repo_key).await.unwrap();
        }
        // One media archive is gone for good.
        let media_keys = mock.list("emodb/media/1.0.0/").await.unwrap();
        mock.delete(&media_keys[0]).await.unwrap();

        let mut config = fx.config.clone();
        config.repositories = vec![Repository::new("mock", "", BackendKind::FileSystem)];
        let registry = audb_storage::registry::fixed("file-system", Arc::new(mock));
        let fresh_cache = tempfile::tempdir().unwrap();
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        request.cache_root = Some(fresh_cache.path().to_path_buf());
        let err = load(&config, &registry, Arc::new(RefusingConverter), request).await.unwrap_err();
        let ErrorKind::Load { failed } = &*err else { panic!("expected aggregate load error") };
        assert_eq!(failed.len(), 1);

        // The directory is not marked complete, and a repaired repository
        // finishes the job on the next attempt.
        let tiers = audb_cache::CacheTiers::new(fresh_cache.path(), None);
        let dir = tiers.user_flavor_dir("emodb", "1.0.0", "default");
        assert!(!audb_cache::is_marked_complete(&dir));
    }

    #[test]
    fn test_load_config_folds_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("audb.yaml");
        std::fs::write(&file, "repositories: definitely-not-a-list\n").unwrap();
        let err = load_config(&file).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));

        std::fs::write(&file, "cache_root: /tmp/audb-cache\nnum_workers: 2\n").unwrap();
        let config = load_config(&file).unwrap();
        assert_eq!(config.workers(), 2);
    }

    #[tokio::test]
    async fn test_info_queries_skip_media() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 2.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        let header = info(&fx.config, &fx.registry, "emodb", None).await.unwrap();
        assert_eq!(header.name.as_deref(), Some("emodb"));
        assert_eq!(header.table_ids(), vec!["age"]);
        assert_eq!(header.languages, vec!["deu".to_string()]);

        let duration = total_duration(&fx.config, &fx.registry, "emodb", Some("1.0.0")).await.unwrap();
        assert!((duration - 3.0).abs() < 1e-6);
        assert_eq!(media_count(&fx.config, &fx.registry, "emodb", None).await.unwrap(), 2);

        // No media landed in the cache.
        let tiers = audb_cache::CacheTiers::new(fx.config.cache_root(), None);
        let dir = tiers.user_flavor_dir("emodb", "1.0.0", "default");
        assert!(!dir.join("audio/001.wav").exists());
    }

    #[tokio::test]
    async fn test_shared_cache_tier_is_read_first() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();

        // A producer materializes into the shared tier...
        let shared = tempfile::tempdir().unwrap();
        let mut config = fx.config.clone();
        config.shared_cache_root = Some(shared.path().to_path_buf());
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        request.prefer_shared_cache = true;
        let db = load(&config, &fx.registry, Arc::new(RefusingConverter), request).await.unwrap();
        assert!(db.root().starts_with(shared.path()));

        // ...and a consumer with an empty user cache resolves it from there.
        let user = tempfile::tempdir().unwrap();
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        request.cache_root = Some(user.path().to_path_buf());
        let db = load(&config, &fx.registry, Arc::new(RefusingConverter), request).await.unwrap();
        assert!(db.root().starts_with(shared.path()), "shared tier satisfies the read");
        assert!(!user.path().join("emodb").exists(), "user tier stays untouched");
    }

    #[tokio::test]
    async fn test_load_to_mirrors_a_plain_tree() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0), ("002.wav", 1.5)]);
        fx.publish("1.0.0", None).await.unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("emodb-export");
        let mut request = LoadRequest::new("emodb");
        request.version = Some("1.0.0".to_string());
        let db =
            load_to(&fx.config, &fx.registry, Arc::new(RefusingConverter), &dest, request).await.unwrap();

        assert_eq!(db.root(), dest.as_path());
        for file in ["db.yaml", "db.age.parquet", "audio/001.wav", "audio/002.wav"] {
            assert_eq!(md5_of(&dest.join(file)), md5_of(&fx.build_dir.path().join(file)), "bytes differ for {file}");
        }
        // Cache bookkeeping stays out of the export
        assert!(!dest.join(".complete").exists());
        assert!(!dest.join(".lock").exists());
        assert!(!dest.join("db.parquet").exists());
    }

    #[tokio::test]
    async fn test_cached_lists_both_versions() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        fx.publish("1.1.0", Some("1.0.0")).await.unwrap();
        fx.load("1.0.0").await.unwrap();
        fx.load("1.1.0").await.unwrap();

        let entries = cached(&fx.config);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.name == "emodb" && e.flavor_id == "default" && e.complete));
        assert_eq!(entries[0].version, "1.0.0");
        assert_eq!(entries[1].version, "1.1.0");
    }

    #[tokio::test]
    async fn test_is_cached_reflects_completeness() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        assert!(!is_cached(&fx.config, "emodb", "1.0.0", &Flavor::default()));

        fx.load("1.0.0").await.unwrap();
        assert!(is_cached(&fx.config, "emodb", "1.0.0", &Flavor::default()));

        // Losing a file invalidates completeness even with the sentinel left
        let tiers = audb_cache::CacheTiers::new(fx.config.cache_root(), None);
        let dir = tiers.user_flavor_dir("emodb", "1.0.0", "default");
        std::fs::remove_file(dir.join("audio/001.wav")).unwrap();
        assert!(!is_cached(&fx.config, "emodb", "1.0.0", &Flavor::default()));
    }

    #[tokio::test]
    async fn test_available_and_latest() {
        let fx = fixture();
        fx.seed_build(&[("001.wav", 1.0)]);
        fx.publish("1.0.0", None).await.unwrap();
        fx.publish("1.1.0", Some("1.0.0")).await.unwrap();

        let latest = latest_version(&fx.config, &fx.registry, "emodb").await.unwrap();
        assert_eq!(latest.to_string(), "1.1.0");
        let entries = available(&fx.config, &fx.registry, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.name == "emodb" && e.repository == "repo"));
    }
}
