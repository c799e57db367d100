//! Reading and writing the persisted dependency table.
//!
//! Parquet is canonical. Legacy inputs (CSV exports, pickled caches, older
//! Parquet files with the `file` path column) are recognized by extension and
//! normalized to the canonical columnar form by one central reader, so the
//! rest of the crate only ever sees the canonical schema.

use crate::error::{ErrorKind, Result};
use crate::table::{DepType, Dependencies};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int32Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use exn::ResultExt;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Canonical column order of the persisted table.
const COLUMNS: [&str; 11] = [
    "path",
    "archive",
    "type",
    "format",
    "version",
    "checksum",
    "removed",
    "bit_depth",
    "channels",
    "sampling_rate",
    "duration",
];

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("path", DataType::Utf8, false),
        Field::new("archive", DataType::Utf8, false),
        Field::new("type", DataType::Int32, false),
        Field::new("format", DataType::Utf8, false),
        Field::new("version", DataType::Utf8, false),
        Field::new("checksum", DataType::Utf8, false),
        Field::new("removed", DataType::Boolean, false),
        Field::new("bit_depth", DataType::Int32, false),
        Field::new("channels", DataType::Int32, false),
        Field::new("sampling_rate", DataType::Int32, false),
        Field::new("duration", DataType::Float64, false),
    ])
}

impl Dependencies {
    /// Read a persisted table, dispatching on the file extension.
    ///
    /// - `.parquet`: canonical form (older files naming the path column
    ///   `file` are accepted).
    /// - `.csv`: legacy export layout; the path lives in an unnamed first
    ///   column and numeric columns may carry float formatting.
    /// - `.pkl`: legacy pickled caches are recognized but not decodable
    ///   outside their producer; surfaced as [`ErrorKind::Corrupt`] so the
    ///   caller falls back to re-fetching the Parquet copy.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
        match ext.as_str() {
            "parquet" => read_parquet(path),
            "csv" => read_csv(path),
            "pkl" => {
                exn::bail!(ErrorKind::Corrupt(format!("legacy pickled table is not readable: {}", path.display())))
            },
            other => exn::bail!(ErrorKind::Corrupt(format!("unrecognized dependency table extension: {other}"))),
        }
    }

    /// Persist the table as Parquet, write-to-temp-then-rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(ErrorKind::Io)?;
        write_parquet(self, tmp.as_file())?;
        tmp.persist(path).map_err(|e| ErrorKind::Io(e.error))?;
        Ok(())
    }
}

fn io_other(msg: &str) -> std::io::Error {
    std::io::Error::other(msg.to_string())
}

fn write_parquet(deps: &Dependencies, file: &File) -> Result<()> {
    let schema = Arc::new(schema());
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(deps.paths.clone())),
        Arc::new(StringArray::from(deps.archives.clone())),
        Arc::new(Int32Array::from(deps.kinds.iter().map(|k| k.code()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(deps.formats.clone())),
        Arc::new(StringArray::from(deps.versions.clone())),
        Arc::new(StringArray::from(deps.checksums.clone())),
        Arc::new(BooleanArray::from(deps.removed.clone())),
        Arc::new(Int32Array::from(deps.bit_depths.clone())),
        Arc::new(Int32Array::from(deps.channels.clone())),
        Arc::new(Int32Array::from(deps.sampling_rates.clone())),
        Arc::new(Float64Array::from(deps.durations.clone())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).or_raise(|| ErrorKind::Io(io_other("record batch")))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).or_raise(|| ErrorKind::Io(io_other("parquet writer")))?;
    writer.write(&batch).or_raise(|| ErrorKind::Io(io_other("write parquet")))?;
    writer.close().or_raise(|| ErrorKind::Io(io_other("finish parquet")))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Dependencies> {
    let file = File::open(path).or_raise(|| ErrorKind::Corrupt(format!("cannot open {}", path.display())))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .or_raise(|| ErrorKind::Corrupt(format!("not a parquet file: {}", path.display())))?;
    let reader =
        builder.build().or_raise(|| ErrorKind::Corrupt(format!("unreadable parquet file: {}", path.display())))?;
    let mut deps = Dependencies::default();
    for batch in reader {
        let batch = batch.or_raise(|| ErrorKind::Corrupt(format!("bad record batch in {}", path.display())))?;
        append_batch(&mut deps, &batch)?;
    }
    Ok(deps)
}

/// Fold one Arrow record batch into the columnar form, tolerating legacy
/// column names and widened numeric types.
fn append_batch(deps: &mut Dependencies, batch: &RecordBatch) -> Result<()> {
    let paths = string_column(batch, &["path", "file"])?;
    let archives = string_column(batch, &["archive"])?;
    let kinds = int_column(batch, &["type"])?;
    let formats = string_column(batch, &["format"])?;
    let versions = string_column(batch, &["version"])?;
    let checksums = string_column(batch, &["checksum"])?;
    let removed = bool_column(batch, &["removed"])?;
    let bit_depths = int_column(batch, &["bit_depth"])?;
    let channels = int_column(batch, &["channels"])?;
    let sampling_rates = int_column(batch, &["sampling_rate"])?;
    let durations = float_column(batch, &["duration"])?;

    for i in 0..batch.num_rows() {
        let path = paths.value(i).to_string();
        if path.is_empty() {
            exn::bail!(ErrorKind::Corrupt("empty path in dependency table".to_string()));
        }
        if deps.contains(&path) {
            exn::bail!(ErrorKind::Corrupt(format!("duplicate path in dependency table: {path}")));
        }
        deps.index.insert(path.clone(), deps.paths.len());
        deps.paths.push(path);
        deps.archives.push(value_or_default(&archives, i));
        deps.kinds.push(DepType::from_code(kinds.value(i))?);
        deps.formats.push(value_or_default(&formats, i));
        deps.versions.push(value_or_default(&versions, i));
        deps.checksums.push(value_or_default(&checksums, i));
        deps.removed.push(!removed.is_null(i) && removed.value(i));
        deps.bit_depths.push(if bit_depths.is_null(i) { 0 } else { bit_depths.value(i) });
        deps.channels.push(if channels.is_null(i) { 0 } else { channels.value(i) });
        deps.sampling_rates.push(if sampling_rates.is_null(i) { 0 } else { sampling_rates.value(i) });
        deps.durations.push(if durations.is_null(i) { 0.0 } else { durations.value(i) });
    }
    Ok(())
}

fn value_or_default(col: &StringArray, i: usize) -> String {
    if col.is_null(i) { String::new() } else { col.value(i).to_string() }
}

fn find_column<'a>(batch: &'a RecordBatch, names: &[&str]) -> Result<&'a ArrayRef> {
    names
        .iter()
        .find_map(|name| batch.column_by_name(name))
        .ok_or_else(|| exn::Exn::from(ErrorKind::Corrupt(format!("missing dependency column `{}`", names[0]))))
}

fn string_column(batch: &RecordBatch, names: &[&str]) -> Result<StringArray> {
    let col = find_column(batch, names)?;
    let casted = cast(col, &DataType::Utf8).or_raise(|| ErrorKind::Corrupt(format!("column `{}`", names[0])))?;
    // Safety: cast() to Utf8 guarantees the concrete array type.
    Ok(casted.as_any().downcast_ref::<StringArray>().unwrap().clone())
}

fn int_column(batch: &RecordBatch, names: &[&str]) -> Result<Int32Array> {
    let col = find_column(batch, names)?;
    let casted = cast(col, &DataType::Int32).or_raise(|| ErrorKind::Corrupt(format!("column `{}`", names[0])))?;
    Ok(casted.as_any().downcast_ref::<Int32Array>().unwrap().clone())
}

fn float_column(batch: &RecordBatch, names: &[&str]) -> Result<Float64Array> {
    let col = find_column(batch, names)?;
    let casted = cast(col, &DataType::Float64).or_raise(|| ErrorKind::Corrupt(format!("column `{}`", names[0])))?;
    Ok(casted.as_any().downcast_ref::<Float64Array>().unwrap().clone())
}

/// Legacy files store `removed` as an integer 0/1 column; newer files use a
/// real boolean. Arrow has no numeric-to-boolean cast, so go through Int32.
fn bool_column(batch: &RecordBatch, names: &[&str]) -> Result<BooleanArray> {
    let col = find_column(batch, names)?;
    if col.data_type() == &DataType::Boolean {
        return Ok(col.as_any().downcast_ref::<BooleanArray>().unwrap().clone());
    }
    let ints = cast(col, &DataType::Int32).or_raise(|| ErrorKind::Corrupt(format!("column `{}`", names[0])))?;
    let ints = ints.as_any().downcast_ref::<Int32Array>().unwrap();
    Ok((0..ints.len()).map(|i| if ints.is_null(i) { None } else { Some(ints.value(i) != 0) }).collect())
}

fn read_csv(path: &Path) -> Result<Dependencies> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .or_raise(|| ErrorKind::Corrupt(format!("cannot open {}", path.display())))?;
    let headers =
        reader.headers().or_raise(|| ErrorKind::Corrupt("missing CSV header".to_string()))?.clone();
    let col = |names: &[&str]| -> Result<usize> {
        headers
            .iter()
            .position(|h| names.contains(&h))
            .ok_or_else(|| exn::Exn::from(ErrorKind::Corrupt(format!("missing CSV column `{}`", names[0]))))
    };
    // Pandas exports the index unnamed; accept explicit names too.
    let path_col = col(&["", "file", "path"])?;
    let archive_col = col(&["archive"])?;
    let kind_col = col(&["type"])?;
    let format_col = col(&["format"])?;
    let version_col = col(&["version"])?;
    let checksum_col = col(&["checksum"])?;
    let removed_col = col(&["removed"])?;
    let bit_depth_col = col(&["bit_depth"])?;
    let channels_col = col(&["channels"])?;
    let sampling_rate_col = col(&["sampling_rate"])?;
    let duration_col = col(&["duration"])?;

    let mut deps = Dependencies::default();
    for record in reader.records() {
        let record = record.or_raise(|| ErrorKind::Corrupt(format!("bad CSV record in {}", path.display())))?;
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        let row_path = field(path_col);
        if row_path.is_empty() {
            exn::bail!(ErrorKind::Corrupt("empty path in dependency table".to_string()));
        }
        if deps.contains(&row_path) {
            exn::bail!(ErrorKind::Corrupt(format!("duplicate path in dependency table: {row_path}")));
        }
        deps.index.insert(row_path.clone(), deps.paths.len());
        deps.paths.push(row_path);
        deps.archives.push(field(archive_col));
        deps.kinds.push(DepType::from_code(parse_i32(&field(kind_col))?)?);
        deps.formats.push(field(format_col));
        deps.versions.push(field(version_col));
        deps.checksums.push(field(checksum_col));
        deps.removed.push(parse_bool(&field(removed_col))?);
        deps.bit_depths.push(parse_i32(&field(bit_depth_col))?);
        deps.channels.push(parse_i32(&field(channels_col))?);
        deps.sampling_rates.push(parse_i32(&field(sampling_rate_col))?);
        deps.durations.push(parse_f64(&field(duration_col))?);
    }
    Ok(deps)
}

/// Integers in legacy CSVs may carry float formatting (`16.0`).
fn parse_i32(s: &str) -> Result<i32> {
    if s.is_empty() {
        return Ok(0);
    }
    if let Ok(v) = s.parse::<i32>() {
        return Ok(v);
    }
    let v = s.parse::<f64>().or_raise(|| ErrorKind::Corrupt(format!("bad integer value `{s}`")))?;
    Ok(v as i32)
}

fn parse_f64(s: &str) -> Result<f64> {
    if s.is_empty() {
        return Ok(0.0);
    }
    s.parse::<f64>().or_raise(|| ErrorKind::Corrupt(format!("bad float value `{s}`")))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "" | "0" | "0.0" | "false" | "False" => Ok(false),
        "1" | "1.0" | "true" | "True" => Ok(true),
        other => exn::bail!(ErrorKind::Corrupt(format!("bad boolean value `{other}`"))),
    }
}
