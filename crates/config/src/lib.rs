//! Configuration loading for audb.
//!
//! Configuration is an explicit value threaded through the API, never
//! ambient state: load it once at process start (file, environment), then
//! it's plain data. Sources are layered with [`figment`]:
//!
//! 1. built-in defaults,
//! 2. the YAML config file (`<config dir>/audb/config.yaml` by default),
//! 3. the environment (`CACHE_ROOT`, `SHARED_CACHE_ROOT`, `REPOSITORIES`).

pub mod error;

pub use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name of the user cache below `$XDG_CACHE_HOME`.
const CACHE_DIR_NAME: &str = "audb";

/// Transport kind of a repository.
///
/// `artifactory` is accepted in configuration for compatibility, but no
/// built-in backend factory exists for it; opening one fails with
/// `UnsupportedBackend` unless the embedder registers a factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[display("file-system")]
    FileSystem,
    #[display("s3")]
    S3,
    #[display("minio")]
    Minio,
    #[display("artifactory")]
    Artifactory,
}
impl std::str::FromStr for BackendKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file-system" => Ok(Self::FileSystem),
            "s3" => Ok(Self::S3),
            "minio" => Ok(Self::Minio),
            "artifactory" => Ok(Self::Artifactory),
            other => exn::bail!(ErrorKind::InvalidRepository(format!("unknown backend kind `{other}`"))),
        }
    }
}
impl BackendKind {
    /// Kind name as used by the backend registry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileSystem => "file-system",
            Self::S3 => "s3",
            Self::Minio => "minio",
            Self::Artifactory => "artifactory",
        }
    }
}

/// One configured repository: a named location databases are published to
/// and loaded from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository name (bucket name for object stores).
    pub name: String,
    /// Host: root directory for `file-system`, endpoint URL for object
    /// stores.
    pub host: String,
    /// Transport kind.
    pub backend: BackendKind,
}
impl Repository {
    pub fn new(name: impl Into<String>, host: impl Into<String>, backend: BackendKind) -> Self {
        Self { name: name.into(), host: host.into(), backend }
    }
}
impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.name, self.host, self.backend)
    }
}
impl std::str::FromStr for Repository {
    type Err = Error;

    /// Parse the `name|host|backend` form used by the `REPOSITORIES`
    /// environment variable.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '|');
        let (Some(name), Some(host), Some(backend)) = (parts.next(), parts.next(), parts.next()) else {
            exn::bail!(ErrorKind::InvalidRepository(format!("expected `name|host|backend`, got `{s}`")));
        };
        if name.is_empty() {
            exn::bail!(ErrorKind::InvalidRepository(format!("empty repository name in `{s}`")));
        }
        Ok(Self::new(name, host, backend.parse::<BackendKind>()?))
    }
}

/// Process-wide audb settings, explicit and immutable after load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repositories consulted left-to-right.
    pub repositories: Vec<Repository>,
    /// User cache root; `$XDG_CACHE_HOME/audb` when unset.
    pub cache_root: Option<PathBuf>,
    /// Shared cache root; unset or empty disables the shared tier.
    pub shared_cache_root: Option<PathBuf>,
    /// Worker count for parallel pipeline stages; available CPUs when unset.
    pub num_workers: Option<usize>,
}

impl Config {
    /// Load configuration from the default config file and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_file())
    }

    /// Load configuration from an explicit config file path (which may not
    /// exist) and the environment.
    pub fn load_from(file: impl AsRef<Path>) -> Result<Self> {
        let env = Env::raw()
            .only(&["CACHE_ROOT", "SHARED_CACHE_ROOT", "NUM_WORKERS"])
            .map(|key| key.as_str().to_lowercase().into());
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(file.as_ref()))
            .merge(env)
            .extract()
            .or_raise(|| ErrorKind::Invalid)?;
        // Repositories from the environment replace the configured list
        // wholesale; merging would make the declaration order ambiguous.
        if let Ok(raw) = std::env::var("REPOSITORIES") {
            config.repositories = parse_repositories(&raw)?;
        }
        Ok(config)
    }

    /// The user cache root, after defaulting.
    pub fn cache_root(&self) -> PathBuf {
        match self.cache_root.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
            _ => default_cache_root(),
        }
    }

    /// The shared cache root; `None` when disabled.
    pub fn shared_cache_root(&self) -> Option<PathBuf> {
        self.shared_cache_root.as_deref().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf)
    }

    /// Bounded worker count for parallel stages.
    pub fn workers(&self) -> usize {
        self.num_workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(usize::from).unwrap_or(1))
    }
}

/// Parse the `REPOSITORIES` environment value: `name|host|backend` entries
/// separated by `;`.
pub fn parse_repositories(raw: &str) -> Result<Vec<Repository>> {
    raw.split(';').map(str::trim).filter(|s| !s.is_empty()).map(str::parse).collect()
}

/// `$XDG_CACHE_HOME/audb`, falling back to `~/.cache/audb`.
pub fn default_cache_root() -> PathBuf {
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.cache_dir().join(CACHE_DIR_NAME),
        None => PathBuf::from(".").join(CACHE_DIR_NAME),
    }
}

fn default_config_file() -> PathBuf {
    match directories::ProjectDirs::from("", "", CACHE_DIR_NAME) {
        Some(dirs) => dirs.config_dir().join("config.yaml"),
        None => PathBuf::from("config.yaml"),
    }
}
