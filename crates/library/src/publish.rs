//! The publish pipeline.
//!
//! Diff a local build directory against the previous version's dependency
//! table, pack new or changed files into content-addressed archives, upload
//! them in parallel, then commit visibility by uploading `db.parquet` and
//! finally `db.yaml`. A reader at any point sees either no version or a
//! complete one; an interrupted publish is restartable because uploads are
//! keyed deterministically and existing keys are skipped.

use crate::error::{ErrorKind, Result};
use crate::header::{Header, is_portable_path};
use crate::progress::{NullProgress, Progress, ProgressEvent};
use crate::retry::{ARCHIVE_TIMEOUT, FETCH_ATTEMPTS, REQUEST_TIMEOUT, with_retries};
use audb_config::Config;
use audb_deps::{Dependencies, Row};
use audb_flavor::AudioInfo;
use audb_storage::{BackendHandle, BackendRegistry, key};
use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// What to publish and where.
#[derive(Clone)]
pub struct PublishRequest {
    /// Local build directory holding `db.yaml`, table files and media.
    pub build_dir: PathBuf,
    /// Version to publish.
    pub version: String,
    /// Name of the configured repository to publish to.
    pub repository: String,
    /// Version to diff against; `None` publishes from scratch.
    pub previous_version: Option<String>,
    /// Override the worker count from the configuration.
    pub num_workers: Option<usize>,
    /// Progress sink.
    pub progress: Arc<dyn Progress>,
    /// Cooperative cancellation, checked at task boundaries.
    pub cancel: CancellationToken,
}

impl PublishRequest {
    pub fn new(build_dir: impl Into<PathBuf>, version: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
            version: version.into(),
            repository: repository.into(),
            previous_version: None,
            num_workers: None,
            progress: Arc::new(NullProgress),
            cancel: CancellationToken::new(),
        }
    }
}

fn id_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new("^[A-Za-z0-9._-]+$").unwrap())
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }
    Ok(())
}

/// One archive that has to reach the repository.
#[derive(Clone, Debug)]
struct Upload {
    /// Canonical repository key.
    repo_key: String,
    /// Member paths, relative to the build root.
    members: Vec<String>,
}

/// Publish a build directory as a new immutable version.
///
/// Returns the dependency table of the published version.
///
/// # Examples
///
/// ```no_run
/// use audb_library::{BackendRegistry, Config, PublishRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::load()?;
/// let registry = BackendRegistry::builtin();
/// let mut request = PublishRequest::new("./build/emodb", "1.1.0", "data-local");
/// request.previous_version = Some("1.0.0".to_string());
/// let deps = audb_library::publish(&config, &registry, request).await?;
/// println!("published; {} artifacts tracked", deps.len());
/// # Ok(())
/// # }
/// ```
pub async fn publish(config: &Config, registry: &BackendRegistry, request: PublishRequest) -> Result<Dependencies> {
    let progress = request.progress.clone();
    let cancel = request.cancel.clone();
    let workers = request.num_workers.filter(|&n| n > 0).unwrap_or_else(|| config.workers());
    let build_dir = request.build_dir.clone();

    // Preconditions.
    let version = semver::Version::parse(&request.version)
        .or_raise(|| ErrorKind::InvalidArgument(format!("bad version `{}`", request.version)))?;
    if let Some(previous) = &request.previous_version {
        let previous = semver::Version::parse(previous)
            .or_raise(|| ErrorKind::InvalidArgument(format!("bad previous version `{previous}`")))?;
        if previous >= version {
            exn::bail!(ErrorKind::InvalidArgument(format!(
                "previous version {previous} must be older than {version}"
            )));
        }
    }
    let version = version.to_string();

    let repository = config
        .repositories
        .iter()
        .find(|r| r.name == request.repository)
        .ok_or_raise(|| ErrorKind::InvalidArgument(format!("unknown repository `{}`", request.repository)))?;
    // Publish is a write path: an unsupported backend is an error here, never
    // a silent skip.
    let backend =
        registry.open(repository.backend.as_str(), &repository.name, &repository.host).map_err(ErrorKind::storage)?;

    let header_file = build_dir.join(key::HEADER_FILE);
    if !header_file.is_file() {
        exn::bail!(ErrorKind::InvalidArgument(format!("no {} in {}", key::HEADER_FILE, build_dir.display())));
    }
    let header = Header::load(&header_file)?;
    let name = header
        .name
        .clone()
        .ok_or_raise(|| ErrorKind::InvalidArgument("database header carries no name".to_string()))?;

    if backend.exists(&key::header(&name, &version)).await.map_err(ErrorKind::storage)? {
        exn::bail!(ErrorKind::InvalidArgument(format!("{name} v{version} is already published")));
    }

    for table_id in header.table_ids() {
        if !id_pattern().is_match(table_id) {
            exn::bail!(ErrorKind::InvalidArgument(format!("illegal table id `{table_id}`")));
        }
    }
    for attachment_id in header.attachment_ids() {
        if !id_pattern().is_match(attachment_id) {
            exn::bail!(ErrorKind::InvalidArgument(format!("illegal attachment id `{attachment_id}`")));
        }
    }
    for attachment in header.attachments.values() {
        if !is_portable_path(&attachment.path) {
            exn::bail!(ErrorKind::InvalidArgument(format!("non-portable attachment path `{}`", attachment.path)));
        }
    }

    // Stage 1: prior state.
    ensure_live(&cancel)?;
    let mut deps = match &request.previous_version {
        Some(previous) => fetch_previous(&backend, &name, previous).await?,
        None => Dependencies::new(),
    };

    // Stages 2-4: discovery, in parallel per file class.
    let attachment_paths: BTreeMap<String, String> =
        header.attachments.iter().map(|(id, a)| (id.clone(), a.path.clone())).collect();
    let tables = discover_tables(&build_dir, &header)?;
    let media_files = {
        let build_dir = build_dir.clone();
        let attachment_paths = attachment_paths.clone();
        let table_paths: HashSet<String> = tables.values().cloned().collect();
        tokio::task::spawn_blocking(move || walk_media(&build_dir, &table_paths, &attachment_paths))
            .await
            .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))??
    };
    let digests = digest_files(&build_dir, tables.values().chain(media_files.iter()), workers, &progress, &cancel)
        .await?;

    let mut uploads: Vec<Upload> = Vec::new();

    // Tables: one archive per table id, uploaded only when the file changed.
    let current_tables: HashSet<&str> = tables.values().map(String::as_str).collect();
    let stale: Vec<String> = deps.tables().filter(|p| !current_tables.contains(p)).map(str::to_string).collect();
    deps.drop_rows(stale);
    for (table_id, table_path) in &tables {
        let digest = &digests[table_path];
        let unchanged = deps.contains(table_path) && deps.checksum(table_path).map(|c| c == digest.checksum).unwrap_or(false);
        if unchanged {
            continue;
        }
        deps.add_meta(table_path, &version, &digest.checksum);
        uploads.push(Upload {
            repo_key: key::meta(&name, &version, table_id),
            members: vec![table_path.clone()],
        });
    }

    // Attachments: one archive per attachment id, file or whole subtree.
    let current_attachments: HashSet<&str> = attachment_paths.values().map(String::as_str).collect();
    let stale: Vec<String> =
        deps.attachments().filter(|p| !current_attachments.contains(p)).map(str::to_string).collect();
    deps.drop_rows(stale);
    for (attachment_id, attachment_path) in &attachment_paths {
        let members = attachment_members(&build_dir, attachment_path)?;
        let checksum = {
            let build_dir = build_dir.clone();
            let members = members.clone();
            let attachment_path = attachment_path.clone();
            tokio::task::spawn_blocking(move || attachment_checksum(&build_dir, &attachment_path, &members))
                .await
                .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))??
        };
        let unchanged =
            deps.contains(attachment_path) && deps.checksum(attachment_path).map(|c| c == checksum).unwrap_or(false);
        if unchanged {
            continue;
        }
        deps.add_attachment(attachment_path, &version, attachment_id, &checksum);
        uploads.push(Upload {
            repo_key: key::attachment(&name, &version, attachment_id),
            members,
        });
    }

    // Media: classify against the prior table, tombstone what vanished.
    ensure_live(&cancel)?;
    let current_media: HashSet<&str> = media_files.iter().map(String::as_str).collect();
    let vanished: Vec<String> = deps
        .media()
        .filter(|p| !deps.removed(p).unwrap_or(false))
        .filter(|p| !current_media.contains(p))
        .map(str::to_string)
        .collect();
    for path in vanished {
        deps.remove(&path).map_err(ErrorKind::deps)?;
    }
    let mut added = Vec::new();
    let mut updated = Vec::new();
    for path in &media_files {
        let digest = &digests[path];
        let fingerprint = audb_archive::fingerprint(&[path.as_str()], &version);
        let info = digest.info.unwrap_or_default();
        let row = Row::media(
            path.clone(),
            fingerprint.clone(),
            version.clone(),
            digest.checksum.clone(),
            info.bit_depth,
            info.channels,
            info.sampling_rate,
            info.duration,
        );
        if !deps.contains(path) {
            added.push(row);
        } else if deps.checksum(path).map(|c| c != digest.checksum).unwrap_or(true) {
            updated.push(row);
        } else {
            continue;
        }
        uploads.push(Upload {
            repo_key: key::media(&name, &version, &fingerprint),
            members: vec![path.clone()],
        });
    }
    deps.add_media(added).map_err(ErrorKind::deps)?;
    deps.update_media(updated).map_err(ErrorKind::deps)?;

    // Stage 6: pack and upload all archives; any failure aborts before the
    // version becomes visible.
    ensure_live(&cancel)?;
    upload_archives(&backend, &build_dir, uploads, workers, &progress, &cancel).await?;

    // Stage 7: the dependency table...
    ensure_live(&cancel)?;
    let staging = tempfile::tempdir().map_err(ErrorKind::Io)?;
    let deps_file = staging.path().join(key::DEPS_FILE);
    {
        let deps = deps.clone();
        let deps_file = deps_file.clone();
        tokio::task::spawn_blocking(move || deps.save(&deps_file))
            .await
            .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
            .map_err(ErrorKind::deps)?;
    }
    let deps_key = key::deps(&name, &version);
    put_with_retries(&backend, &deps_file, &deps_key).await?;
    progress.event(ProgressEvent::TableUploaded { key: deps_key });

    // Stage 8: ...and the header last. This is the visibility commit.
    let header_key = key::header(&name, &version);
    put_with_retries(&backend, &header_file, &header_key).await?;
    progress.event(ProgressEvent::HeaderPublished { key: header_key });
    progress.event(ProgressEvent::Complete);

    Ok(deps)
}

async fn fetch_previous(backend: &BackendHandle, name: &str, previous: &str) -> Result<Dependencies> {
    let published = backend.exists(&key::header(name, previous)).await.map_err(ErrorKind::storage)?
        && backend.exists(&key::deps(name, previous)).await.map_err(ErrorKind::storage)?;
    if !published {
        exn::bail!(ErrorKind::InvalidArgument(format!(
            "previous version {previous} is not published in this repository"
        )));
    }
    let staging = tempfile::tempdir().map_err(ErrorKind::Io)?;
    let dest = staging.path().join(key::DEPS_FILE);
    with_retries(FETCH_ATTEMPTS, || async {
        match tokio::time::timeout(REQUEST_TIMEOUT, backend.get(&key::deps(name, previous), &dest)).await {
            Ok(result) => result,
            Err(_) => Err(exn::Exn::from(audb_storage::error::ErrorKind::Network("timed out".to_string()))),
        }
    })
    .await
    .map_err(ErrorKind::storage)?;
    tokio::task::spawn_blocking(move || Dependencies::load(&dest))
        .await
        .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
        .map_err(ErrorKind::deps)
}

/// Table id to table file path (`db.<id>.parquet` preferred, CSV accepted).
fn discover_tables(build_dir: &Path, header: &Header) -> Result<BTreeMap<String, String>> {
    let mut tables = BTreeMap::new();
    for table_id in header.table_ids() {
        let parquet = format!("db.{table_id}.parquet");
        let csv = format!("db.{table_id}.csv");
        let file = match (build_dir.join(&parquet).is_file(), build_dir.join(&csv).is_file()) {
            (true, _) => parquet,
            (false, true) => csv,
            (false, false) => {
                exn::bail!(ErrorKind::InvalidArgument(format!("table `{table_id}` has no file in the build directory")))
            },
        };
        tables.insert(table_id.to_string(), file);
    }
    Ok(tables)
}

/// All media files below the build root: everything that is not the header,
/// not a table file, and not part of an attachment payload.
fn walk_media(
    build_dir: &Path,
    table_paths: &HashSet<String>,
    attachments: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let mut media = Vec::new();
    let mut pending = vec![build_dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(ErrorKind::Io)? {
            let entry = entry.map_err(ErrorKind::Io)?;
            let path = entry.path();
            if entry.file_type().map_err(ErrorKind::Io)?.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(relative) = path.strip_prefix(build_dir) else { continue };
            let relative =
                relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
            if relative == key::HEADER_FILE || relative == key::DEPS_FILE {
                continue;
            }
            if table_paths.contains(&relative) {
                continue;
            }
            let in_attachment = attachments
                .values()
                .any(|a| relative == *a || relative.starts_with(&format!("{a}/")));
            if in_attachment {
                continue;
            }
            let extension = Path::new(&relative).extension().map(|e| e.to_string_lossy().into_owned());
            if let Some(extension) = extension {
                if extension != extension.to_lowercase() {
                    exn::bail!(ErrorKind::InvalidArgument(format!(
                        "media extension must be lowercase: {relative}"
                    )));
                }
            }
            media.push(relative);
        }
    }
    media.sort_unstable();
    Ok(media)
}

#[derive(Clone, Debug)]
struct Digest {
    checksum: String,
    info: Option<AudioInfo>,
}

/// Checksum (and probe, for audio) every file, bounded by the worker count.
async fn digest_files(
    build_dir: &Path,
    paths: impl Iterator<Item = &String>,
    workers: usize,
    progress: &Arc<dyn Progress>,
    cancel: &CancellationToken,
) -> Result<HashMap<String, Digest>> {
    let results = futures::stream::iter(paths.cloned())
        .map(|path| {
            let file = build_dir.join(&path);
            let progress = progress.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    exn::bail!(ErrorKind::Cancelled);
                }
                let digest = tokio::task::spawn_blocking(move || -> Result<Digest> {
                    let checksum = audb_archive::md5_file(&file).map_err(ErrorKind::archive)?;
                    let info = AudioInfo::probe(&file).map_err(ErrorKind::flavor)?;
                    Ok(Digest { checksum, info })
                })
                .await
                .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))??;
                progress.event(ProgressEvent::FileDiscovered { path: path.clone() });
                Ok::<_, crate::error::Error>((path, digest))
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<_>>()
        .await;
    results.into_iter().collect()
}

/// Members of an attachment archive: the payload file itself, or every file
/// below the payload directory.
fn attachment_members(build_dir: &Path, attachment_path: &str) -> Result<Vec<String>> {
    let absolute = build_dir.join(attachment_path);
    if absolute.is_file() {
        return Ok(vec![attachment_path.to_string()]);
    }
    if !absolute.is_dir() {
        exn::bail!(ErrorKind::InvalidArgument(format!("attachment payload `{attachment_path}` does not exist")));
    }
    let mut members = Vec::new();
    let mut pending = vec![absolute.clone()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(ErrorKind::Io)? {
            let entry = entry.map_err(ErrorKind::Io)?;
            let path = entry.path();
            if entry.file_type().map_err(ErrorKind::Io)?.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(relative) = path.strip_prefix(build_dir) else { continue };
            members
                .push(relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/"));
        }
    }
    if members.is_empty() {
        exn::bail!(ErrorKind::InvalidArgument(format!("attachment payload `{attachment_path}` is empty")));
    }
    members.sort_unstable();
    Ok(members)
}

/// Content checksum of an attachment payload. For a single file this is its
/// MD5; a directory digests the sorted `path → md5` listing so renames and
/// edits both register.
fn attachment_checksum(build_dir: &Path, attachment_path: &str, members: &[String]) -> Result<String> {
    if members.len() == 1 && members[0] == attachment_path {
        return audb_archive::md5_file(build_dir.join(attachment_path)).map_err(ErrorKind::archive);
    }
    let mut listing = String::new();
    for member in members {
        let digest = audb_archive::md5_file(build_dir.join(member)).map_err(ErrorKind::archive)?;
        listing.push_str(member);
        listing.push('\n');
        listing.push_str(&digest);
        listing.push('\n');
    }
    Ok(audb_archive::md5_bytes(listing))
}

async fn upload_archives(
    backend: &BackendHandle,
    build_dir: &Path,
    uploads: Vec<Upload>,
    workers: usize,
    progress: &Arc<dyn Progress>,
    cancel: &CancellationToken,
) -> Result<()> {
    let results = futures::stream::iter(uploads)
        .map(|upload| {
            let backend = backend.clone();
            let build_dir = build_dir.to_path_buf();
            let progress = progress.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    exn::bail!(ErrorKind::Cancelled);
                }
                // Restartability: a key uploaded by an interrupted earlier
                // run is content-identical (deterministic key, same bytes).
                if backend.exists(&upload.repo_key).await.map_err(ErrorKind::storage)? {
                    tracing::debug!(key = %upload.repo_key, "archive already uploaded, skipping");
                    return Ok(());
                }
                let packed = {
                    let build_dir = build_dir.clone();
                    let members = upload.members.clone();
                    tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
                        let temp = tempfile::NamedTempFile::new().map_err(ErrorKind::Io)?;
                        audb_archive::pack(&build_dir, &members, temp.path()).map_err(ErrorKind::archive)?;
                        Ok(temp)
                    })
                    .await
                    .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))??
                };
                with_retries(FETCH_ATTEMPTS, || async {
                    match tokio::time::timeout(ARCHIVE_TIMEOUT, backend.put(packed.path(), &upload.repo_key)).await {
                        Ok(result) => result,
                        Err(_) => Err(exn::Exn::from(audb_storage::error::ErrorKind::Network(format!(
                            "timed out uploading {}",
                            upload.repo_key
                        )))),
                    }
                })
                .await
                .map_err(ErrorKind::storage)?;
                progress.event(ProgressEvent::ArchiveUploaded { key: upload.repo_key });
                Ok(())
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<Result<()>>>()
        .await;
    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(())
}

async fn put_with_retries(backend: &BackendHandle, src: &Path, repo_key: &str) -> Result<()> {
    with_retries(FETCH_ATTEMPTS, || async {
        match tokio::time::timeout(REQUEST_TIMEOUT, backend.put(src, repo_key)).await {
            Ok(result) => result,
            Err(_) => Err(exn::Exn::from(audb_storage::error::ErrorKind::Network(format!(
                "timed out uploading {repo_key}"
            )))),
        }
    })
    .await
    .map_err(ErrorKind::storage)
}
