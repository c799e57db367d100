//! Row-batched table streaming with on-demand media fetch.
//!
//! Opens one table of a loaded version as a stream of Arrow record batches.
//! Before a batch is handed out, the media files its rows reference are
//! ensured present in the cache, so a consumer can iterate a huge corpus and
//! only ever pay for the media it actually reaches. Dropping the stream
//! cancels pending fetches.

use crate::database::Database;
use crate::error::{ErrorKind, Result};
use crate::load::{LoadRequest, load};
use arrow::array::{Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use audb_config::Config;
use audb_flavor::RefusingConverter;
use audb_storage::BackendRegistry;
use exn::ResultExt;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BATCH_SIZE: usize = 16;

/// Which table to stream and how.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// Database name.
    pub name: String,
    /// Version; latest when unset.
    pub version: Option<String>,
    /// Table id to stream.
    pub table: String,
    /// Rows per emitted batch.
    pub batch_size: usize,
    /// Shuffle window in rows; `None` streams in table order.
    pub buffer_size: Option<usize>,
    /// Seed for the shuffle PRNG; a fixed seed gives a deterministic order.
    pub seed: Option<u64>,
    /// Override the user cache root from the configuration.
    pub cache_root: Option<PathBuf>,
    /// Override the worker count from the configuration.
    pub num_workers: Option<usize>,
}

impl StreamRequest {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            table: table.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_size: None,
            seed: None,
            cache_root: None,
            num_workers: None,
        }
    }
}

/// A running table stream. Obtain with [`stream`].
#[derive(Debug)]
pub struct DatabaseStream {
    database: Database,
    config: Config,
    registry: BackendRegistry,
    request: StreamRequest,
    reader: ParquetRecordBatchReader,
    reader_done: bool,
    buffer: Vec<RecordBatch>,
    buffer_batches: usize,
    rng: Option<StdRng>,
    media_column: Option<String>,
    cancel: CancellationToken,
}

/// Open a table of `(name, version)` as a row-batched stream.
///
/// Loads the table (and only the table) first; media is fetched lazily per
/// emitted batch.
pub async fn stream(config: &Config, registry: &BackendRegistry, request: StreamRequest) -> Result<DatabaseStream> {
    if request.batch_size == 0 {
        exn::bail!(ErrorKind::InvalidArgument("batch size must be positive".to_string()));
    }
    let mut table_only = LoadRequest::new(&request.name);
    table_only.version = request.version.clone();
    table_only.tables = Some(vec![regex::escape(&request.table)]);
    table_only.media = Some(Vec::new());
    table_only.attachments = Some(Vec::new());
    table_only.cache_root = request.cache_root.clone();
    table_only.num_workers = request.num_workers;
    let database = load(config, registry, Arc::new(RefusingConverter), table_only).await?;

    let table_path = database
        .deps()
        .tables()
        .find(|path| database.deps().archive(path).map(|id| id == request.table).unwrap_or(false))
        .map(str::to_string)
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(format!("table `{}`", request.table))))?;
    if !table_path.ends_with(".parquet") {
        exn::bail!(ErrorKind::InvalidArgument(format!(
            "table `{}` is stored as `{table_path}`; streaming requires a parquet table",
            request.table
        )));
    }

    let file = std::fs::File::open(database.root().join(&table_path)).map_err(ErrorKind::Io)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .or_raise(|| ErrorKind::Corrupt(format!("not a parquet table: {table_path}")))?
        .with_batch_size(request.batch_size);
    // Media references live in the `file` column by convention; fall back to
    // the first string column when the convention doesn't hold.
    let media_column = builder
        .schema()
        .fields()
        .iter()
        .find(|f| f.name() == "file" && matches!(f.data_type(), DataType::Utf8 | DataType::LargeUtf8))
        .or_else(|| {
            builder
                .schema()
                .fields()
                .iter()
                .find(|f| matches!(f.data_type(), DataType::Utf8 | DataType::LargeUtf8))
        })
        .map(|f| f.name().clone());
    let reader = builder.build().or_raise(|| ErrorKind::Corrupt(format!("unreadable parquet table: {table_path}")))?;

    let buffer_batches = match request.buffer_size {
        Some(rows) => (rows / request.batch_size).max(1),
        None => 1,
    };
    let rng = request.buffer_size.map(|_| match request.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    });

    Ok(DatabaseStream {
        database,
        config: config.clone(),
        registry: registry.clone(),
        request,
        reader,
        reader_done: false,
        buffer: Vec::new(),
        buffer_batches,
        rng,
        media_column,
        cancel: CancellationToken::new(),
    })
}

impl DatabaseStream {
    /// The loaded (metadata-only) database backing this stream.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Next batch of rows, with its media present in the cache.
    ///
    /// Returns `None` when the table is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        while !self.reader_done && self.buffer.len() < self.buffer_batches {
            match self.reader.next() {
                Some(batch) => {
                    let batch =
                        batch.or_raise(|| ErrorKind::Corrupt(format!("bad record batch in `{}`", self.request.table)))?;
                    self.buffer.push(batch);
                },
                None => self.reader_done = true,
            }
        }
        let Some(batch) = self.take_one() else { return Ok(None) };
        self.ensure_media(&batch).await?;
        Ok(Some(batch))
    }

    fn take_one(&mut self) -> Option<RecordBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        match &mut self.rng {
            Some(rng) => {
                let index = rng.gen_range(0..self.buffer.len());
                Some(self.buffer.swap_remove(index))
            },
            None => Some(self.buffer.remove(0)),
        }
    }

    /// Media paths referenced by a batch.
    fn media_paths(&self, batch: &RecordBatch) -> Result<Vec<String>> {
        let Some(column_name) = &self.media_column else { return Ok(Vec::new()) };
        let Some(column) = batch.column_by_name(column_name) else { return Ok(Vec::new()) };
        let column =
            cast(column, &DataType::Utf8).or_raise(|| ErrorKind::Corrupt(format!("bad `{column_name}` column")))?;
        // Safety: cast() to Utf8 guarantees the concrete array type.
        let column = column.as_any().downcast_ref::<StringArray>().unwrap();
        let deps = self.database.deps();
        let mut paths = Vec::new();
        for i in 0..column.len() {
            if column.is_null(i) {
                continue;
            }
            let value = column.value(i);
            // Only rows the dependency table knows as media trigger fetches;
            // segment tables may reference the same file many times.
            if deps.contains(value) && !paths.iter().any(|p| p == value) {
                paths.push(value.to_string());
            }
        }
        Ok(paths)
    }

    async fn ensure_media(&self, batch: &RecordBatch) -> Result<()> {
        let paths = self.media_paths(batch)?;
        let missing: Vec<String> =
            paths.into_iter().filter(|p| !self.database.root().join(p).is_file()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut fetch = LoadRequest::new(&self.request.name);
        fetch.version = Some(self.database.version().to_string());
        fetch.tables = Some(Vec::new());
        fetch.attachments = Some(Vec::new());
        fetch.media = Some(missing.iter().map(|p| regex::escape(p)).collect());
        fetch.cache_root = self.request.cache_root.clone();
        fetch.num_workers = self.request.num_workers;
        fetch.cancel = self.cancel.child_token();
        load(&self.config, &self.registry, Arc::new(RefusingConverter), fetch).await?;
        Ok(())
    }
}

impl Drop for DatabaseStream {
    fn drop(&mut self) {
        // Cooperative cancellation: pending fetch tasks observe the token at
        // their next boundary and stop.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{PublishRequest, publish};
    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::{Field, Schema};
    use audb_config::{BackendKind, Repository};
    use audb_flavor::write_wav;
    use parquet::arrow::ArrowWriter;
    use std::path::Path;

    fn write_table(path: &Path, files: &[&str]) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("file", DataType::Utf8, false),
            Field::new("age", DataType::Int32, false),
        ]));
        let ages: Vec<i32> = (0..files.len() as i32).map(|i| 20 + i).collect();
        let batch = RecordBatch::try_new(schema.clone(), vec![
            Arc::new(StringArray::from(files.to_vec())) as ArrayRef,
            Arc::new(Int32Array::from(ages)) as ArrayRef,
        ])
        .unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    struct Fixture {
        _repo_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        _build_dir: tempfile::TempDir,
        config: Config,
        registry: BackendRegistry,
    }

    async fn published_fixture(media: &[&str]) -> Fixture {
        let repo_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let build_dir = tempfile::tempdir().unwrap();
        let root = build_dir.path();
        std::fs::write(root.join("db.yaml"), "name: emodb\ntables:\n  age:\n    type: filewise\n").unwrap();
        write_table(&root.join("db.age.parquet"), media);
        std::fs::create_dir_all(root.join("audio")).unwrap();
        for file in media {
            write_wav(root.join(file), 1, 16, 16000, 0.1).unwrap();
        }
        let config = Config {
            repositories: vec![Repository::new("repo", repo_dir.path().to_str().unwrap(), BackendKind::FileSystem)],
            cache_root: Some(cache_dir.path().to_path_buf()),
            shared_cache_root: None,
            num_workers: Some(2),
        };
        let registry = BackendRegistry::builtin();
        publish(&config, &registry, PublishRequest::new(root, "1.0.0", "repo")).await.unwrap();
        Fixture {
            config,
            registry,
            _repo_dir: repo_dir,
            _cache_dir: cache_dir,
            _build_dir: build_dir,
        }
    }

    #[tokio::test]
    async fn test_stream_fetches_media_per_batch() {
        let media = ["audio/001.wav", "audio/002.wav", "audio/003.wav", "audio/004.wav"];
        let fx = published_fixture(&media).await;

        let mut request = StreamRequest::new("emodb", "age");
        request.batch_size = 2;
        let mut rows = stream(&fx.config, &fx.registry, request).await.unwrap();
        // Metadata-only load: nothing fetched yet
        assert!(!rows.database().root().join("audio/001.wav").exists());

        let first = rows.next_batch().await.unwrap().unwrap();
        assert_eq!(first.num_rows(), 2);
        assert!(rows.database().root().join("audio/001.wav").is_file());
        assert!(rows.database().root().join("audio/002.wav").is_file());
        assert!(!rows.database().root().join("audio/003.wav").exists());

        let second = rows.next_batch().await.unwrap().unwrap();
        assert_eq!(second.num_rows(), 2);
        assert!(rows.database().root().join("audio/004.wav").is_file());
        assert!(rows.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seeded_shuffle_is_deterministic() {
        let media = ["audio/001.wav", "audio/002.wav", "audio/003.wav", "audio/004.wav"];
        let fx = published_fixture(&media).await;

        let order = |seed: u64| {
            let config = fx.config.clone();
            let registry = fx.registry.clone();
            async move {
                let mut request = StreamRequest::new("emodb", "age");
                request.batch_size = 1;
                request.buffer_size = Some(4);
                request.seed = Some(seed);
                let mut rows = stream(&config, &registry, request).await.unwrap();
                let mut seen = Vec::new();
                while let Some(batch) = rows.next_batch().await.unwrap() {
                    let column = batch.column_by_name("file").unwrap();
                    let column = column.as_any().downcast_ref::<StringArray>().unwrap();
                    seen.push(column.value(0).to_string());
                }
                seen
            }
        };
        let first = order(7).await;
        let second = order(7).await;
        assert_eq!(first, second, "same seed, same order");
        assert_eq!(first.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_table_is_not_found() {
        let fx = published_fixture(&["audio/001.wav"]).await;
        let err = stream(&fx.config, &fx.registry, StreamRequest::new("emodb", "nope")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }
}
