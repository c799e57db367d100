//! The load pipeline.
//!
//! Resolve a version across the configured repositories, fetch and unpack
//! only the archives the cache doesn't already satisfy, optionally transcode
//! media to the requested flavor, and expose a complete local database tree.
//!
//! Partial loads are first-class: a narrower earlier scope is extended
//! incrementally, per-archive failures are collected instead of aborting,
//! and everything that did land on disk matches its recorded checksum, so a
//! re-run only does the missing work.

use crate::database::Database;
use crate::error::{ErrorKind, FailedPath, Result};
use crate::header::Header;
use crate::progress::{NullProgress, Progress, ProgressEvent};
use crate::resolver;
use crate::retry::{ARCHIVE_TIMEOUT, FETCH_ATTEMPTS, REQUEST_TIMEOUT, with_retries};
use audb_cache::{CacheTiers, FlavorLock, ReusePool, clear_complete, is_marked_complete, mark_complete};
use audb_config::Config;
use audb_deps::Dependencies;
use audb_flavor::{AudioConverter, Flavor};
use audb_storage::{BackendHandle, BackendRegistry, key};
use exn::ResultExt;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// What to load and how.
#[derive(Clone)]
pub struct LoadRequest {
    /// Database name.
    pub name: String,
    /// Version to load; latest when unset.
    pub version: Option<String>,
    /// Regex filters (full match) on table ids; `None` loads all tables,
    /// an empty list loads none.
    pub tables: Option<Vec<String>>,
    /// Regex filters (full match) on media paths.
    pub media: Option<Vec<String>>,
    /// Regex filters (full match) on attachment ids.
    pub attachments: Option<Vec<String>>,
    /// Media transformation; default flavor means verbatim bytes.
    pub flavor: Flavor,
    /// Skip media entirely (tables and attachments only).
    pub only_metadata: bool,
    /// Materialize into the shared cache tier when it is writable.
    pub prefer_shared_cache: bool,
    /// Override the user cache root from the configuration.
    pub cache_root: Option<PathBuf>,
    /// Override the worker count from the configuration.
    pub num_workers: Option<usize>,
    /// Progress sink.
    pub progress: Arc<dyn Progress>,
    /// Cooperative cancellation, checked at task boundaries.
    pub cancel: CancellationToken,
}

impl LoadRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            tables: None,
            media: None,
            attachments: None,
            flavor: Flavor::default(),
            only_metadata: false,
            prefer_shared_cache: false,
            cache_root: None,
            num_workers: None,
            progress: Arc::new(NullProgress),
            cancel: CancellationToken::new(),
        }
    }
}

/// Compiled request filters. Patterns match the full table id / media path /
/// attachment id.
#[derive(Debug)]
struct Filters {
    tables: Option<Vec<regex::Regex>>,
    media: Option<Vec<regex::Regex>>,
    attachments: Option<Vec<regex::Regex>>,
}

fn compile(patterns: &Option<Vec<String>>) -> Result<Option<Vec<regex::Regex>>> {
    let Some(patterns) = patterns else { return Ok(None) };
    patterns
        .iter()
        .map(|p| {
            regex::Regex::new(&format!("^(?:{p})$"))
                .or_raise(|| ErrorKind::InvalidArgument(format!("bad filter pattern `{p}`")))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn matches(patterns: &Option<Vec<regex::Regex>>, value: &str) -> bool {
    match patterns {
        None => true,
        Some(patterns) => patterns.iter().any(|p| p.is_match(value)),
    }
}

impl Filters {
    fn compile(request: &LoadRequest) -> Result<Self> {
        Ok(Self {
            tables: compile(&request.tables)?,
            media: compile(&request.media)?,
            attachments: compile(&request.attachments)?,
        })
    }
}

/// The artifact paths a request resolves to against a dependency table.
struct Plan {
    tables: Vec<String>,
    attachments: Vec<String>,
    media: Vec<String>,
}

impl Plan {
    fn build(deps: &Dependencies, filters: &Filters, only_metadata: bool) -> Self {
        let tables = deps
            .tables()
            .filter(|path| deps.archive(path).map(|id| matches(&filters.tables, id)).unwrap_or(false))
            .map(str::to_string)
            .collect();
        let attachments = deps
            .attachments()
            .filter(|path| deps.archive(path).map(|id| matches(&filters.attachments, id)).unwrap_or(false))
            .map(str::to_string)
            .collect();
        let media = match only_metadata {
            true => Vec::new(),
            false => deps
                .media()
                .filter(|path| !deps.removed(path).unwrap_or(true))
                .filter(|path| matches(&filters.media, path))
                .map(str::to_string)
                .collect(),
        };
        Self { tables, attachments, media }
    }

    fn files(&self) -> usize {
        self.tables.len() + self.attachments.len() + self.media.len()
    }

    /// `true` when every planned artifact is materialized below `dir`
    /// (media under its flavor-mapped destination).
    fn satisfied(&self, dir: &Path, flavor: &Flavor) -> bool {
        self.tables.iter().all(|p| dir.join(p).is_file())
            && self.attachments.iter().all(|p| dir.join(p).exists())
            && self.media.iter().all(|p| dir.join(flavor.destination(p)).exists())
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }
    Ok(())
}

/// Fetch one repository object into `dir/file_name`, via a temp file so a
/// concurrent reader of the cache never sees a torn write.
pub(crate) async fn fetch_object(
    backend: &BackendHandle,
    repo_key: &str,
    dir: &Path,
    file_name: &str,
    timeout: std::time::Duration,
) -> Result<PathBuf> {
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(ErrorKind::Io)?;
    with_retries(FETCH_ATTEMPTS, || async {
        match tokio::time::timeout(timeout, backend.get(repo_key, temp.path())).await {
            Ok(result) => result,
            Err(_) => Err(exn::Exn::from(audb_storage::error::ErrorKind::Network(format!(
                "timed out fetching {repo_key}"
            )))),
        }
    })
    .await
    .map_err(ErrorKind::storage)?;
    let dest = dir.join(file_name);
    temp.persist(&dest).map_err(|e| ErrorKind::Io(e.error))?;
    Ok(dest)
}

/// Load a database version into the cache and return a handle to it.
///
/// # Examples
///
/// ```no_run
/// use audb_library::{BackendRegistry, Config, LoadRequest, RefusingConverter};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::load()?;
/// let registry = BackendRegistry::builtin();
/// let request = LoadRequest::new("emodb");
/// let db = audb_library::load(&config, &registry, Arc::new(RefusingConverter), request).await?;
/// println!("materialized at {}", db.root().display());
/// # Ok(())
/// # }
/// ```
pub async fn load(
    config: &Config,
    registry: &BackendRegistry,
    converter: Arc<dyn AudioConverter>,
    request: LoadRequest,
) -> Result<Database> {
    let flavor = request.flavor.clone().normalize().map_err(ErrorKind::flavor)?;
    let flavor_id = flavor.id();
    let filters = Filters::compile(&request)?;
    let progress = request.progress.clone();
    let cancel = request.cancel.clone();
    let workers = request.num_workers.filter(|&n| n > 0).unwrap_or_else(|| config.workers());

    // Stage 1: resolve name and version to a repository.
    let version = match &request.version {
        Some(version) => {
            semver::Version::parse(version)
                .or_raise(|| ErrorKind::InvalidArgument(format!("bad version `{version}`")))?;
            version.clone()
        },
        None => resolver::latest_version(config, registry, &request.name).await?.to_string(),
    };
    let (repository, backend) = resolver::repository(config, registry, &request.name, &version).await?;
    progress.event(ProgressEvent::Resolved { repository: repository.name.clone(), version: version.clone() });

    let user_root = request.cache_root.clone().unwrap_or_else(|| config.cache_root());
    let tiers = CacheTiers::new(user_root, config.shared_cache_root());

    // A complete directory in either tier that already covers the requested
    // scope short-circuits the whole pipeline, lock-free.
    if let Some(done) = try_cached(&tiers, &request, &filters, &flavor, &flavor_id, &version) {
        progress.event(ProgressEvent::Complete);
        return Ok(done);
    }

    // Stage 2: everything below mutates the flavor directory.
    let dir = tiers.write_flavor_dir(&request.name, &version, &flavor_id, request.prefer_shared_cache);
    let _lock = FlavorLock::acquire(&dir).await.map_err(ErrorKind::cache)?;

    // Another process may have completed the directory while we waited.
    if let Some(done) = try_cached(&tiers, &request, &filters, &flavor, &flavor_id, &version) {
        progress.event(ProgressEvent::Complete);
        return Ok(done);
    }
    clear_complete(&dir).map_err(ErrorKind::cache)?;

    // Stage 3: header and dependency table. The pair is immutable once a
    // version is published, so a readable local copy is authoritative.
    let (header, deps) = fetch_metadata(&backend, &request.name, &version, &dir).await?;
    let deps = Arc::new(deps);

    // Stage 4: plan.
    ensure_live(&cancel)?;
    let plan = Plan::build(&deps, &filters, request.only_metadata);
    progress.event(ProgressEvent::PlanReady {
        archives: archive_groups(&deps, &plan, &dir, &flavor).len(),
        files: plan.files(),
    });

    // Stage 5: cross-version reuse, best-effort.
    let reuse = {
        let tiers = tiers.clone();
        let name = request.name.clone();
        let flavor_id = flavor_id.clone();
        let version = version.clone();
        tokio::task::spawn_blocking(move || ReusePool::scan(&tiers, &name, &flavor_id, &version))
            .await
            .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
    };
    if !reuse.is_empty() {
        for path in &plan.media {
            if dir.join(flavor.destination(path)).exists() || dir.join(path).exists() {
                continue;
            }
            let Ok(checksum) = deps.checksum(path) else { continue };
            if reuse.adopt(path, checksum, &dir).is_some() {
                progress.event(ProgressEvent::FileReused { path: path.clone() });
            }
        }
    }

    // Stage 6: fetch missing archives in parallel.
    let failed: Arc<Mutex<Vec<FailedPath>>> = Arc::new(Mutex::new(Vec::new()));
    fetch_tables_and_attachments(&backend, &request.name, &deps, &plan, &dir, workers, &progress, &cancel, &failed)
        .await?;
    fetch_media(&backend, &request.name, &deps, &plan, &dir, &flavor, workers, &progress, &cancel, &failed).await?;

    // Stage 7: flavor transforms in parallel.
    let transform_failed: Vec<FailedPath> = match flavor.is_default() || request.only_metadata {
        true => Vec::new(),
        false => transform_media(&converter, &flavor, &plan, &dir, workers, &progress, &cancel).await?,
    };

    // Stage 8: finalize. A cancelled run keeps its partial state but never
    // gains the completeness sentinel.
    ensure_live(&cancel)?;
    let fetch_failed: Vec<FailedPath> = failed.lock().unwrap().clone();
    let clean = fetch_failed.is_empty() && transform_failed.is_empty();
    if clean && plan.satisfied(&dir, &flavor) {
        mark_complete(&dir).map_err(ErrorKind::cache)?;
    }
    progress.event(ProgressEvent::Complete);

    if !fetch_failed.is_empty() {
        let mut all = fetch_failed;
        all.extend(transform_failed);
        exn::bail!(ErrorKind::Load { failed: all });
    }
    if !transform_failed.is_empty() {
        exn::bail!(ErrorKind::Flavor { failed: transform_failed });
    }

    Ok(Database {
        name: request.name,
        version,
        flavor,
        flavor_id,
        root: dir,
        header,
        deps: Arc::try_unwrap(deps).unwrap_or_else(|arc| (*arc).clone()),
    })
}

/// Materialize a database version into an arbitrary directory.
///
/// Loads through the cache first (so repeated exports of the same version
/// are cheap), then mirrors the requested scope into `dest`: header, table
/// files, attachments and media under their flavor-mapped names. Cache
/// bookkeeping (`.lock`, `.complete`, `db.parquet`) stays behind; the result
/// is a plain database tree.
pub async fn load_to(
    config: &Config,
    registry: &BackendRegistry,
    converter: Arc<dyn AudioConverter>,
    dest: impl Into<PathBuf>,
    request: LoadRequest,
) -> Result<Database> {
    let dest = dest.into();
    let filters = Filters::compile(&request)?;
    let only_metadata = request.only_metadata;
    let database = load(config, registry, converter, request).await?;

    let plan = Plan::build(database.deps(), &filters, only_metadata);
    std::fs::create_dir_all(&dest).map_err(ErrorKind::Io)?;
    mirror_file(database.root(), &dest, key::HEADER_FILE)?;
    for path in plan.tables.iter().chain(&plan.attachments) {
        mirror_file(database.root(), &dest, path)?;
    }
    for path in &plan.media {
        mirror_file(database.root(), &dest, &database.flavor().destination(path))?;
    }
    Ok(Database { root: dest, ..database })
}

/// Hard-link (or copy) one artifact out of a flavor directory, replacing any
/// stale file at the destination.
fn mirror_file(from: &Path, to: &Path, relative: &str) -> Result<()> {
    let source = from.join(relative);
    if source.is_dir() {
        // Directory attachments mirror their whole subtree.
        for entry in walk_files(&source)? {
            let Ok(suffix) = entry.strip_prefix(from) else { continue };
            mirror_file(from, to, &suffix.to_string_lossy())?;
        }
        return Ok(());
    }
    let target = to.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(ErrorKind::Io)?;
    }
    _ = std::fs::remove_file(&target);
    if std::fs::hard_link(&source, &target).is_err() {
        std::fs::copy(&source, &target).map_err(ErrorKind::Io)?;
    }
    Ok(())
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(ErrorKind::Io)? {
            let entry = entry.map_err(ErrorKind::Io)?;
            match entry.file_type().map_err(ErrorKind::Io)?.is_dir() {
                true => pending.push(entry.path()),
                false => files.push(entry.path()),
            }
        }
    }
    Ok(files)
}

/// One flavor directory found in the cache tiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedEntry {
    pub name: String,
    pub version: String,
    pub flavor_id: String,
    pub root: PathBuf,
    /// Sentinel present *and* every non-tombstoned dependency row exists.
    pub complete: bool,
}

/// Enumerate every materialized `(name, version, flavor)` across both cache
/// tiers, without touching any repository.
pub fn cached(config: &Config) -> Vec<CachedEntry> {
    let tiers = CacheTiers::new(config.cache_root(), config.shared_cache_root());
    let mut entries = Vec::new();
    for root in tiers.roots() {
        let Ok(names) = std::fs::read_dir(root) else { continue };
        for name in names.flatten() {
            let Ok(versions) = std::fs::read_dir(name.path()) else { continue };
            for version in versions.flatten() {
                if semver::Version::parse(&version.file_name().to_string_lossy()).is_err() {
                    continue;
                }
                let Ok(flavors) = std::fs::read_dir(version.path()) else { continue };
                for flavor_dir in flavors.flatten() {
                    let dir = flavor_dir.path();
                    if !dir.is_dir() {
                        continue;
                    }
                    let flavor_id = flavor_dir.file_name().to_string_lossy().into_owned();
                    // The destination mapping of a non-default flavor is not
                    // derivable from its id, so only the default flavor gets
                    // the per-file existence check on top of the sentinel.
                    let complete = is_marked_complete(&dir)
                        && (flavor_id != audb_flavor::DEFAULT_FLAVOR_ID
                            || Dependencies::load(dir.join(key::DEPS_FILE))
                                .map(|deps| {
                                    let filters = Filters { tables: None, media: None, attachments: None };
                                    Plan::build(&deps, &filters, false).satisfied(&dir, &Flavor::default())
                                })
                                .unwrap_or(false));
                    entries.push(CachedEntry {
                        name: name.file_name().to_string_lossy().into_owned(),
                        version: version.file_name().to_string_lossy().into_owned(),
                        flavor_id,
                        root: dir,
                        complete,
                    });
                }
            }
        }
    }
    entries.sort_by(|a, b| (&a.name, &a.version, &a.flavor_id).cmp(&(&b.name, &b.version, &b.flavor_id)));
    entries
}

/// `true` when the flavor directory's sentinel is present and every
/// non-tombstoned artifact of the dependency table exists below it.
pub fn is_cached(config: &Config, name: &str, version: &str, flavor: &Flavor) -> bool {
    let tiers = CacheTiers::new(config.cache_root(), config.shared_cache_root());
    let Some(dir) = tiers.resolve(name, version, &flavor.id()) else { return false };
    if !is_marked_complete(&dir) {
        return false;
    }
    let Ok(deps) = Dependencies::load(dir.join(key::DEPS_FILE)) else { return false };
    let filters = Filters { tables: None, media: None, attachments: None };
    Plan::build(&deps, &filters, false).satisfied(&dir, flavor)
}

/// Return a handle to an already-complete directory covering the request,
/// shared tier first. Logs when the tiers disagree; the shared copy wins.
fn try_cached(
    tiers: &CacheTiers,
    request: &LoadRequest,
    filters: &Filters,
    flavor: &Flavor,
    flavor_id: &str,
    version: &str,
) -> Option<Database> {
    let dir = tiers.resolve(&request.name, version, flavor_id)?;
    if !is_marked_complete(&dir) {
        return None;
    }
    let deps = Dependencies::load(dir.join(key::DEPS_FILE)).ok()?;
    let header = Header::load(dir.join(key::HEADER_FILE)).ok()?;
    warn_on_tier_divergence(tiers, &dir, request, version, flavor_id);
    let plan = Plan::build(&deps, filters, request.only_metadata);
    if !plan.satisfied(&dir, flavor) {
        return None;
    }
    Some(Database {
        name: request.name.clone(),
        version: version.to_string(),
        flavor: flavor.clone(),
        flavor_id: flavor_id.to_string(),
        root: dir,
        header,
        deps,
    })
}

fn warn_on_tier_divergence(tiers: &CacheTiers, chosen: &Path, request: &LoadRequest, version: &str, flavor_id: &str) {
    let user_dir = tiers.user_flavor_dir(&request.name, version, flavor_id);
    if user_dir.as_path() == chosen {
        return;
    }
    let shared_table = chosen.join(key::DEPS_FILE);
    let user_table = user_dir.join(key::DEPS_FILE);
    if !user_table.is_file() {
        return;
    }
    let diverged = match (audb_archive::md5_file(&shared_table), audb_archive::md5_file(&user_table)) {
        (Ok(a), Ok(b)) => a != b,
        _ => false,
    };
    if diverged {
        tracing::warn!(
            shared = %chosen.display(),
            user = %user_dir.display(),
            "user cache disagrees with shared cache for this version; treating the shared copy as authoritative",
        );
    }
}

async fn fetch_metadata(
    backend: &BackendHandle,
    name: &str,
    version: &str,
    dir: &Path,
) -> Result<(Header, Dependencies)> {
    let header_path = dir.join(key::HEADER_FILE);
    let deps_path = dir.join(key::DEPS_FILE);
    let cached = header_path.is_file() && deps_path.is_file();
    let deps = match cached {
        true => Dependencies::load(&deps_path).ok(),
        false => None,
    };
    let deps = match deps {
        Some(deps) => deps,
        None => {
            fetch_object(backend, &key::header(name, version), dir, key::HEADER_FILE, REQUEST_TIMEOUT).await?;
            let fetched =
                fetch_object(backend, &key::deps(name, version), dir, key::DEPS_FILE, REQUEST_TIMEOUT).await?;
            let loaded = tokio::task::spawn_blocking(move || Dependencies::load(&fetched))
                .await
                .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?;
            loaded.map_err(ErrorKind::deps)?
        },
    };
    let header = Header::load(&header_path)?;
    Ok((header, deps))
}

/// Group the media paths still missing on disk by their archive, carrying
/// each archive's last-write version (its location in the repository).
fn archive_groups(
    deps: &Dependencies,
    plan: &Plan,
    dir: &Path,
    flavor: &Flavor,
) -> HashMap<String, (String, Vec<String>)> {
    let mut groups: HashMap<String, (String, Vec<String>)> = HashMap::new();
    for path in &plan.media {
        if dir.join(flavor.destination(path)).exists() || dir.join(path).exists() {
            continue;
        }
        let (Ok(fingerprint), Ok(row_version)) = (deps.archive(path), deps.version(path)) else { continue };
        groups
            .entry(fingerprint.to_string())
            .or_insert_with(|| (row_version.to_string(), Vec::new()))
            .1
            .push(path.clone());
    }
    groups
}

#[allow(clippy::too_many_arguments)]
async fn fetch_media(
    backend: &BackendHandle,
    name: &str,
    deps: &Arc<Dependencies>,
    plan: &Plan,
    dir: &Path,
    flavor: &Flavor,
    workers: usize,
    progress: &Arc<dyn Progress>,
    cancel: &CancellationToken,
    failed: &Arc<Mutex<Vec<FailedPath>>>,
) -> Result<()> {
    ensure_live(cancel)?;
    let groups = archive_groups(deps, plan, dir, flavor);
    futures::stream::iter(groups)
        .map(|(fingerprint, (row_version, paths))| {
            let repo_key = key::media(name, &row_version, &fingerprint);
            let backend = backend.clone();
            let dir = dir.to_path_buf();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let failed = failed.clone();
            async move {
                if cancel.is_cancelled() {
                    return;
                }
                match fetch_and_unpack(&backend, &repo_key, &dir, ARCHIVE_TIMEOUT).await {
                    Ok(count) => {
                        progress.event(ProgressEvent::ArchiveFetched { fingerprint, files: count });
                    },
                    Err(err) => {
                        let cause = err.to_string();
                        for path in paths {
                            progress.event(ProgressEvent::FileFailed { path: path.clone(), cause: cause.clone() });
                            failed.lock().unwrap().push((path, cause.clone()));
                        }
                    },
                }
            }
        })
        .buffer_unordered(workers)
        .collect::<Vec<()>>()
        .await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_tables_and_attachments(
    backend: &BackendHandle,
    name: &str,
    deps: &Arc<Dependencies>,
    plan: &Plan,
    dir: &Path,
    workers: usize,
    progress: &Arc<dyn Progress>,
    cancel: &CancellationToken,
    failed: &Arc<Mutex<Vec<FailedPath>>>,
) -> Result<()> {
    ensure_live(cancel)?;
    let mut wanted: Vec<(String, String)> = Vec::new();
    for path in plan.tables.iter().chain(&plan.attachments) {
        if dir.join(path).exists() {
            continue;
        }
        let (Ok(archive_id), Ok(row_version), Ok(kind)) =
            (deps.archive(path), deps.version(path), deps.kind(path))
        else {
            continue;
        };
        let repo_key = match kind {
            audb_deps::DepType::Meta => key::meta(name, row_version, archive_id),
            audb_deps::DepType::Attachment => key::attachment(name, row_version, archive_id),
            audb_deps::DepType::Media => continue,
        };
        wanted.push((path.clone(), repo_key));
    }
    futures::stream::iter(wanted)
        .map(|(path, repo_key)| {
            let backend = backend.clone();
            let dir = dir.to_path_buf();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let failed = failed.clone();
            async move {
                if cancel.is_cancelled() {
                    return;
                }
                match fetch_and_unpack(&backend, &repo_key, &dir, REQUEST_TIMEOUT).await {
                    Ok(count) => {
                        progress.event(ProgressEvent::ArchiveFetched { fingerprint: repo_key, files: count });
                    },
                    Err(err) => {
                        let cause = err.to_string();
                        progress.event(ProgressEvent::FileFailed { path: path.clone(), cause: cause.clone() });
                        failed.lock().unwrap().push((path, cause));
                    },
                }
            }
        })
        .buffer_unordered(workers)
        .collect::<Vec<()>>()
        .await;
    Ok(())
}

/// Download one archive to a temp file and unpack it into the flavor
/// directory. Unpacking runs on the blocking pool; it is checksum-idempotent,
/// so racing an earlier partial unpack is harmless.
async fn fetch_and_unpack(
    backend: &BackendHandle,
    repo_key: &str,
    dir: &Path,
    timeout: std::time::Duration,
) -> Result<usize> {
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(ErrorKind::Io)?;
    with_retries(FETCH_ATTEMPTS, || async {
        match tokio::time::timeout(timeout, backend.get(repo_key, temp.path())).await {
            Ok(result) => result,
            Err(_) => Err(exn::Exn::from(audb_storage::error::ErrorKind::Network(format!(
                "timed out fetching {repo_key}"
            )))),
        }
    })
    .await
    .map_err(ErrorKind::storage)?;
    let dir = dir.to_path_buf();
    let unpacked = tokio::task::spawn_blocking(move || {
        let result = audb_archive::unpack(temp.path(), &dir);
        drop(temp);
        result
    })
    .await
    .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
    .map_err(ErrorKind::archive)?;
    Ok(unpacked.len())
}

async fn transform_media(
    converter: &Arc<dyn AudioConverter>,
    flavor: &Flavor,
    plan: &Plan,
    dir: &Path,
    workers: usize,
    progress: &Arc<dyn Progress>,
    cancel: &CancellationToken,
) -> Result<Vec<FailedPath>> {
    ensure_live(cancel)?;
    // Only files whose original bytes are on disk and whose flavor
    // destination is still missing need work; everything else was handled by
    // an earlier (partial) run.
    let pending: Vec<String> = plan
        .media
        .iter()
        .filter(|path| dir.join(path.as_str()).is_file())
        .filter(|path| {
            let destination = dir.join(flavor.destination(path));
            destination == dir.join(path.as_str()) || !destination.exists()
        })
        .cloned()
        .collect();

    let results = futures::stream::iter(pending)
        .map(|path| {
            let converter = converter.clone();
            let flavor = flavor.clone();
            let dir = dir.to_path_buf();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let handle = tokio::task::spawn_blocking(move || {
                    let result = audb_flavor::materialize(converter.as_ref(), &flavor, &dir, &path);
                    (path, result)
                });
                match handle.await {
                    Ok(outcome) => Some(outcome),
                    Err(join_error) => Some(("<worker>".to_string(), Err(exn::Exn::from(
                        audb_flavor::ErrorKind::Io(std::io::Error::other(join_error)),
                    )))),
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut failed = Vec::new();
    for (path, result) in results.into_iter().flatten() {
        match result {
            Ok(_) => progress.event(ProgressEvent::FileTransformed { path }),
            Err(err) => {
                let cause = err.to_string();
                progress.event(ProgressEvent::FileFailed { path: path.clone(), cause: cause.clone() });
                failed.push((path, cause));
            },
        }
    }
    Ok(failed)
}
