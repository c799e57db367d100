//! Columnar dependency table.
//!
//! One row per artifact of a database version, keyed by the artifact's path
//! relative to the database root. The table is the sole source of truth about
//! what a version contains, which archive holds each file's bytes, and
//! whether those bytes are reused from an earlier version.
//!
//! The layout is struct-of-vectors with a hash index on the path column:
//! read-mostly workloads scan a single column, batch mutations scatter into
//! the column vectors directly instead of paying one lookup per row.

use crate::error::{ErrorKind, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Role of an artifact within a database version.
///
/// The discriminants are the on-disk integer codes used by the `type` column
/// of the persisted table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DepType {
    /// Table file (one per archive)
    Meta = 0,
    /// Media file (one or more per archive)
    Media = 1,
    /// Attachment payload (one per archive)
    Attachment = 2,
}
impl DepType {
    pub(crate) fn code(self) -> i32 {
        self as i32
    }

    pub(crate) fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Meta),
            1 => Ok(Self::Media),
            2 => Ok(Self::Attachment),
            other => exn::bail!(ErrorKind::Corrupt(format!("unknown dependency type code {other}"))),
        }
    }
}

/// Owned snapshot of a single dependency row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Repository-relative path; unique row key.
    pub path: String,
    /// Fingerprint of the archive holding this file's bytes.
    pub archive: String,
    /// Artifact role.
    pub kind: DepType,
    /// Lowercase file extension.
    pub format: String,
    /// Version of the database in which this file's bytes were last written.
    pub version: String,
    /// MD5 hex digest of the file content.
    pub checksum: String,
    /// Tombstone for media that was published and later withdrawn.
    pub removed: bool,
    /// PCM bit depth, `0` when not applicable.
    pub bit_depth: i32,
    /// Audio channel count, `0` when not applicable.
    pub channels: i32,
    /// Audio sample rate in Hz, `0` when not applicable.
    pub sampling_rate: i32,
    /// Duration in seconds, `0.0` when not applicable.
    pub duration: f64,
}
impl Row {
    /// Build a media row. The format is derived from the path's extension.
    #[allow(clippy::too_many_arguments)]
    pub fn media(
        path: impl Into<String>,
        archive: impl Into<String>,
        version: impl Into<String>,
        checksum: impl Into<String>,
        bit_depth: i32,
        channels: i32,
        sampling_rate: i32,
        duration: f64,
    ) -> Self {
        let path = path.into();
        let format = extension(&path);
        Self {
            path,
            archive: archive.into(),
            kind: DepType::Media,
            format,
            version: version.into(),
            checksum: checksum.into(),
            removed: false,
            bit_depth,
            channels,
            sampling_rate,
            duration,
        }
    }
}

/// Lowercase extension of a path, empty string when there is none.
pub(crate) fn extension(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Table id encoded in a table file name (`db.<id>.<ext>` convention).
///
/// Falls back to the file stem when the name doesn't carry the `db.` prefix.
pub(crate) fn table_id(path: &str) -> String {
    let name = std::path::Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = match name.rsplit_once('.') {
        Some((stem, _ext)) => stem.to_string(),
        None => name,
    };
    stem.strip_prefix("db.").map(|s| s.to_string()).unwrap_or(stem)
}

/// Columnar manifest of one database version.
///
/// Rows keep insertion order; [`files()`](Self::files) and the persisted form
/// both iterate in that order, and round-trips must not reorder rows.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    pub(crate) paths: Vec<String>,
    pub(crate) archives: Vec<String>,
    pub(crate) kinds: Vec<DepType>,
    pub(crate) formats: Vec<String>,
    pub(crate) versions: Vec<String>,
    pub(crate) checksums: Vec<String>,
    pub(crate) removed: Vec<bool>,
    pub(crate) bit_depths: Vec<i32>,
    pub(crate) channels: Vec<i32>,
    pub(crate) sampling_rates: Vec<i32>,
    pub(crate) durations: Vec<f64>,
    pub(crate) index: HashMap<String, usize>,
}

impl Dependencies {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows (tombstones included).
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// `true` when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// `true` when a row exists for the given path.
    pub fn contains(&self, path: impl AsRef<str>) -> bool {
        self.index.contains_key(path.as_ref())
    }

    fn idx(&self, path: &str) -> Result<usize> {
        self.index.get(path).copied().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_string())))
    }

    /// Snapshot of the row for the given path.
    pub fn row(&self, path: impl AsRef<str>) -> Result<Row> {
        let i = self.idx(path.as_ref())?;
        Ok(self.row_at(i))
    }

    pub(crate) fn row_at(&self, i: usize) -> Row {
        Row {
            path: self.paths[i].clone(),
            archive: self.archives[i].clone(),
            kind: self.kinds[i],
            format: self.formats[i].clone(),
            version: self.versions[i].clone(),
            checksum: self.checksums[i].clone(),
            removed: self.removed[i],
            bit_depth: self.bit_depths[i],
            channels: self.channels[i],
            sampling_rate: self.sampling_rates[i],
            duration: self.durations[i],
        }
    }

    /* ======= *\
    |  Queries  |
    \* ======= */

    /// All row paths, in insertion order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    fn of_kind(&self, kind: DepType) -> impl Iterator<Item = &str> {
        self.paths.iter().zip(&self.kinds).filter(move |(_, k)| **k == kind).map(|(p, _)| p.as_str())
    }

    /// Paths of all media rows, tombstoned ones included.
    pub fn media(&self) -> impl Iterator<Item = &str> {
        self.of_kind(DepType::Media)
    }

    /// Paths of all table rows.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.of_kind(DepType::Meta)
    }

    /// Paths of all attachment rows.
    pub fn attachments(&self) -> impl Iterator<Item = &str> {
        self.of_kind(DepType::Attachment)
    }

    /// Paths of tombstoned media rows.
    pub fn removed_media(&self) -> impl Iterator<Item = &str> {
        self.paths
            .iter()
            .zip(&self.kinds)
            .zip(&self.removed)
            .filter(|((_, k), r)| **k == DepType::Media && **r)
            .map(|((p, _), _)| p.as_str())
    }

    /// Unique archive fingerprints, sorted.
    pub fn archives(&self) -> Vec<String> {
        self.archives.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Archive fingerprint holding the file's bytes.
    pub fn archive(&self, path: impl AsRef<str>) -> Result<&str> {
        Ok(self.archives[self.idx(path.as_ref())?].as_str())
    }

    /// MD5 hex digest of the file content.
    pub fn checksum(&self, path: impl AsRef<str>) -> Result<&str> {
        Ok(self.checksums[self.idx(path.as_ref())?].as_str())
    }

    /// Version in which the file's bytes were last written.
    pub fn version(&self, path: impl AsRef<str>) -> Result<&str> {
        Ok(self.versions[self.idx(path.as_ref())?].as_str())
    }

    /// Duration in seconds (`0.0` for non-audio rows).
    pub fn duration(&self, path: impl AsRef<str>) -> Result<f64> {
        Ok(self.durations[self.idx(path.as_ref())?])
    }

    /// PCM bit depth (`0` for non-audio rows).
    pub fn bit_depth(&self, path: impl AsRef<str>) -> Result<i32> {
        Ok(self.bit_depths[self.idx(path.as_ref())?])
    }

    /// Channel count (`0` for non-audio rows).
    pub fn channels(&self, path: impl AsRef<str>) -> Result<i32> {
        Ok(self.channels[self.idx(path.as_ref())?])
    }

    /// Sample rate in Hz (`0` for non-audio rows).
    pub fn sampling_rate(&self, path: impl AsRef<str>) -> Result<i32> {
        Ok(self.sampling_rates[self.idx(path.as_ref())?])
    }

    /// Lowercase file extension.
    pub fn format(&self, path: impl AsRef<str>) -> Result<&str> {
        Ok(self.formats[self.idx(path.as_ref())?].as_str())
    }

    /// Artifact role of the row.
    pub fn kind(&self, path: impl AsRef<str>) -> Result<DepType> {
        Ok(self.kinds[self.idx(path.as_ref())?])
    }

    /// Tombstone flag.
    pub fn removed(&self, path: impl AsRef<str>) -> Result<bool> {
        Ok(self.removed[self.idx(path.as_ref())?])
    }

    /* ============= *\
    |  Batch getters  |
    \* ============= */

    fn map_column<T, F>(&self, paths: impl IntoIterator<Item = impl AsRef<str>>, get: F) -> Result<HashMap<String, T>>
    where
        F: Fn(usize) -> T,
    {
        let mut out = HashMap::new();
        for path in paths {
            let path = path.as_ref();
            out.insert(path.to_string(), get(self.idx(path)?));
        }
        Ok(out)
    }

    /// Archive fingerprints for a set of paths.
    ///
    /// Batch variant of [`archive`](Self::archive); one hash lookup per path,
    /// no per-row clone of the whole table.
    pub fn archive_map(&self, paths: impl IntoIterator<Item = impl AsRef<str>>) -> Result<HashMap<String, String>> {
        self.map_column(paths, |i| self.archives[i].clone())
    }

    /// Checksums for a set of paths.
    pub fn checksum_map(&self, paths: impl IntoIterator<Item = impl AsRef<str>>) -> Result<HashMap<String, String>> {
        self.map_column(paths, |i| self.checksums[i].clone())
    }

    /// Last-write versions for a set of paths.
    pub fn version_map(&self, paths: impl IntoIterator<Item = impl AsRef<str>>) -> Result<HashMap<String, String>> {
        self.map_column(paths, |i| self.versions[i].clone())
    }

    /// Durations for a set of paths.
    pub fn duration_map(&self, paths: impl IntoIterator<Item = impl AsRef<str>>) -> Result<HashMap<String, f64>> {
        self.map_column(paths, |i| self.durations[i])
    }

    /// Semantic equality: same row set regardless of insertion order.
    pub fn equal(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.paths.iter().all(|path| match other.index.get(path) {
            Some(&j) => self.row_at(self.index[path]) == other.row_at(j),
            None => false,
        })
    }

    /* ========= *\
    |  Mutations  |
    \* ========= */

    fn push(&mut self, row: Row) {
        self.index.insert(row.path.clone(), self.paths.len());
        self.paths.push(row.path);
        self.archives.push(row.archive);
        self.kinds.push(row.kind);
        self.formats.push(row.format);
        self.versions.push(row.version);
        self.checksums.push(row.checksum);
        self.removed.push(row.removed);
        self.bit_depths.push(row.bit_depth);
        self.channels.push(row.channels);
        self.sampling_rates.push(row.sampling_rate);
        self.durations.push(row.duration);
    }

    fn overwrite(&mut self, i: usize, row: Row) {
        self.archives[i] = row.archive;
        self.kinds[i] = row.kind;
        self.formats[i] = row.format;
        self.versions[i] = row.version;
        self.checksums[i] = row.checksum;
        self.removed[i] = row.removed;
        self.bit_depths[i] = row.bit_depth;
        self.channels[i] = row.channels;
        self.sampling_rates[i] = row.sampling_rate;
        self.durations[i] = row.duration;
    }

    /// Bulk-insert media rows. Every row must be new.
    pub fn add_media(&mut self, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        for mut row in rows {
            if self.contains(&row.path) {
                exn::bail!(ErrorKind::Duplicate(row.path));
            }
            row.kind = DepType::Media;
            self.push(row);
        }
        Ok(())
    }

    /// Insert or overwrite a table row.
    ///
    /// The archive id of a table is its stable table id, taken from the
    /// `db.<id>.<ext>` file name.
    pub fn add_meta(&mut self, path: impl Into<String>, version: impl Into<String>, checksum: impl Into<String>) {
        let path = path.into();
        let row = Row {
            archive: table_id(&path),
            kind: DepType::Meta,
            format: extension(&path),
            version: version.into(),
            checksum: checksum.into(),
            removed: false,
            bit_depth: 0,
            channels: 0,
            sampling_rate: 0,
            duration: 0.0,
            path,
        };
        match self.index.get(&row.path) {
            Some(&i) => self.overwrite(i, row),
            None => self.push(row),
        }
    }

    /// Insert or overwrite an attachment row. The archive id is the stable
    /// attachment id chosen by the caller.
    pub fn add_attachment(
        &mut self,
        path: impl Into<String>,
        version: impl Into<String>,
        archive: impl Into<String>,
        checksum: impl Into<String>,
    ) {
        let path = path.into();
        let row = Row {
            archive: archive.into(),
            kind: DepType::Attachment,
            format: extension(&path),
            version: version.into(),
            checksum: checksum.into(),
            removed: false,
            bit_depth: 0,
            channels: 0,
            sampling_rate: 0,
            duration: 0.0,
            path,
        };
        match self.index.get(&row.path) {
            Some(&i) => self.overwrite(i, row),
            None => self.push(row),
        }
    }

    /// Replace existing media rows whose bytes changed.
    ///
    /// Each row must already exist as media; its archive, checksum, version
    /// and audio metadata are taken from the incoming row.
    pub fn update_media(&mut self, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        for mut row in rows {
            let i = self.idx(&row.path)?;
            if self.kinds[i] != DepType::Media {
                exn::bail!(ErrorKind::KindMismatch(row.path));
            }
            row.kind = DepType::Media;
            row.removed = self.removed[i];
            self.overwrite(i, row);
        }
        Ok(())
    }

    /// Bump the last-write version of existing media rows without touching
    /// their content metadata.
    pub fn update_media_version(
        &mut self,
        paths: impl IntoIterator<Item = impl AsRef<str>>,
        version: impl AsRef<str>,
    ) -> Result<()> {
        let version = version.as_ref();
        for path in paths {
            let i = self.idx(path.as_ref())?;
            self.versions[i] = version.to_string();
        }
        Ok(())
    }

    /// Tombstone a media row. The row stays in the table forever.
    pub fn remove(&mut self, path: impl AsRef<str>) -> Result<()> {
        let path = path.as_ref();
        let i = self.idx(path)?;
        if self.kinds[i] != DepType::Media {
            exn::bail!(ErrorKind::KindMismatch(path.to_string()));
        }
        self.removed[i] = true;
        Ok(())
    }

    /// Physically delete rows. Only used while synthesizing a new version
    /// during publish; loaded tables are never shrunk.
    pub fn drop_rows(&mut self, paths: impl IntoIterator<Item = impl AsRef<str>>) {
        let victims: HashSet<String> = paths.into_iter().map(|p| p.as_ref().to_string()).collect();
        if victims.is_empty() {
            return;
        }
        let keep: Vec<bool> = self.paths.iter().map(|p| !victims.contains(p)).collect();
        retain_by_mask(&mut self.paths, &keep);
        retain_by_mask(&mut self.archives, &keep);
        retain_by_mask(&mut self.kinds, &keep);
        retain_by_mask(&mut self.formats, &keep);
        retain_by_mask(&mut self.versions, &keep);
        retain_by_mask(&mut self.checksums, &keep);
        retain_by_mask(&mut self.removed, &keep);
        retain_by_mask(&mut self.bit_depths, &keep);
        retain_by_mask(&mut self.channels, &keep);
        retain_by_mask(&mut self.sampling_rates, &keep);
        retain_by_mask(&mut self.durations, &keep);
        self.index = self.paths.iter().enumerate().map(|(i, p)| (p.clone(), i)).collect();
    }
}

fn retain_by_mask<T>(column: &mut Vec<T>, keep: &[bool]) {
    let mut it = keep.iter();
    column.retain(|_| *it.next().unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_row(path: &str, version: &str, checksum: &str) -> Row {
        Row::media(path, format!("fp-{path}"), version, checksum, 16, 1, 16000, 1.0)
    }

    #[test]
    fn test_insert_and_query() {
        let mut deps = Dependencies::new();
        deps.add_meta("db.age.parquet", "1.0.0", "aaaa");
        deps.add_media([media_row("audio/001.wav", "1.0.0", "bbbb")]).unwrap();
        deps.add_attachment("docs/readme.txt", "1.0.0", "readme", "cccc");

        assert_eq!(deps.len(), 3);
        assert!(deps.contains("audio/001.wav"));
        assert_eq!(deps.kind("db.age.parquet").unwrap(), DepType::Meta);
        assert_eq!(deps.archive("db.age.parquet").unwrap(), "age");
        assert_eq!(deps.archive("docs/readme.txt").unwrap(), "readme");
        assert_eq!(deps.format("audio/001.wav").unwrap(), "wav");
        assert_eq!(deps.checksum("audio/001.wav").unwrap(), "bbbb");
        assert_eq!(deps.bit_depth("audio/001.wav").unwrap(), 16);
        assert_eq!(deps.duration("db.age.parquet").unwrap(), 0.0);
        assert!(!deps.removed("audio/001.wav").unwrap());
    }

    #[test]
    fn test_missing_row_is_not_found() {
        let deps = Dependencies::new();
        let err = deps.row("nope.wav").unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_duplicate_media_rejected() {
        let mut deps = Dependencies::new();
        deps.add_media([media_row("a.wav", "1.0.0", "aa")]).unwrap();
        let err = deps.add_media([media_row("a.wav", "1.0.0", "aa")]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Duplicate(_)));
    }

    #[test]
    fn test_files_preserve_insertion_order() {
        let mut deps = Dependencies::new();
        deps.add_media([
            media_row("c.wav", "1.0.0", "cc"),
            media_row("a.wav", "1.0.0", "aa"),
            media_row("b.wav", "1.0.0", "bb"),
        ])
        .unwrap();
        let files: Vec<_> = deps.files().collect();
        assert_eq!(files, vec!["c.wav", "a.wav", "b.wav"]);
    }

    #[test]
    fn test_kind_filters() {
        let mut deps = Dependencies::new();
        deps.add_meta("db.age.parquet", "1.0.0", "aa");
        deps.add_media([media_row("x.wav", "1.0.0", "bb")]).unwrap();
        deps.add_attachment("notes.pdf", "1.0.0", "notes", "cc");
        assert_eq!(deps.tables().collect::<Vec<_>>(), vec!["db.age.parquet"]);
        assert_eq!(deps.media().collect::<Vec<_>>(), vec!["x.wav"]);
        assert_eq!(deps.attachments().collect::<Vec<_>>(), vec!["notes.pdf"]);
    }

    #[test]
    fn test_archives_unique_sorted() {
        let mut deps = Dependencies::new();
        deps.add_media([
            Row::media("b.wav", "zz", "1.0.0", "b", 0, 0, 0, 0.0),
            Row::media("a.wav", "aa", "1.0.0", "a", 0, 0, 0, 0.0),
            Row::media("c.wav", "zz", "1.0.0", "c", 0, 0, 0, 0.0),
        ])
        .unwrap();
        assert_eq!(deps.archives(), vec!["aa".to_string(), "zz".to_string()]);
    }

    #[test]
    fn test_tombstone_media_only() {
        let mut deps = Dependencies::new();
        deps.add_meta("db.age.parquet", "1.0.0", "aa");
        deps.add_media([media_row("x.wav", "1.0.0", "bb")]).unwrap();

        deps.remove("x.wav").unwrap();
        assert!(deps.removed("x.wav").unwrap());
        assert_eq!(deps.removed_media().collect::<Vec<_>>(), vec!["x.wav"]);

        let err = deps.remove("db.age.parquet").unwrap_err();
        assert!(matches!(&*err, ErrorKind::KindMismatch(_)));
    }

    #[test]
    fn test_update_media_bumps_content_but_keeps_tombstone() {
        let mut deps = Dependencies::new();
        deps.add_media([media_row("x.wav", "1.0.0", "old")]).unwrap();
        deps.remove("x.wav").unwrap();
        deps.update_media([Row::media("x.wav", "fp-new", "1.1.0", "new", 24, 2, 44100, 2.5)]).unwrap();
        assert_eq!(deps.checksum("x.wav").unwrap(), "new");
        assert_eq!(deps.version("x.wav").unwrap(), "1.1.0");
        assert_eq!(deps.archive("x.wav").unwrap(), "fp-new");
        // Tombstone state is not content, it survives the update
        assert!(deps.removed("x.wav").unwrap());
    }

    #[test]
    fn test_update_media_version_only() {
        let mut deps = Dependencies::new();
        deps.add_media([media_row("x.wav", "1.0.0", "aa"), media_row("y.wav", "1.0.0", "bb")]).unwrap();
        deps.update_media_version(["x.wav"], "2.0.0").unwrap();
        assert_eq!(deps.version("x.wav").unwrap(), "2.0.0");
        assert_eq!(deps.version("y.wav").unwrap(), "1.0.0");
        assert_eq!(deps.checksum("x.wav").unwrap(), "aa");
    }

    #[test]
    fn test_drop_rows_rebuilds_index() {
        let mut deps = Dependencies::new();
        deps.add_media([
            media_row("a.wav", "1.0.0", "aa"),
            media_row("b.wav", "1.0.0", "bb"),
            media_row("c.wav", "1.0.0", "cc"),
        ])
        .unwrap();
        deps.drop_rows(["b.wav"]);
        assert_eq!(deps.len(), 2);
        assert!(!deps.contains("b.wav"));
        assert_eq!(deps.checksum("c.wav").unwrap(), "cc");
        assert_eq!(deps.files().collect::<Vec<_>>(), vec!["a.wav", "c.wav"]);
    }

    #[test]
    fn test_equal_ignores_order() {
        let mut left = Dependencies::new();
        left.add_media([media_row("a.wav", "1.0.0", "aa"), media_row("b.wav", "1.0.0", "bb")]).unwrap();
        let mut right = Dependencies::new();
        right.add_media([media_row("b.wav", "1.0.0", "bb"), media_row("a.wav", "1.0.0", "aa")]).unwrap();
        assert!(left.equal(&right));

        right.update_media_version(["a.wav"], "1.1.0").unwrap();
        assert!(!left.equal(&right));
    }

    #[test]
    fn test_batch_maps() {
        let mut deps = Dependencies::new();
        deps.add_media([media_row("a.wav", "1.0.0", "aa"), media_row("b.wav", "1.1.0", "bb")]).unwrap();
        let checksums = deps.checksum_map(["a.wav", "b.wav"]).unwrap();
        assert_eq!(checksums["a.wav"], "aa");
        assert_eq!(checksums["b.wav"], "bb");
        let versions = deps.version_map(["b.wav"]).unwrap();
        assert_eq!(versions["b.wav"], "1.1.0");
        assert!(deps.checksum_map(["missing.wav"]).is_err());
    }

    #[test]
    fn test_table_id_extraction() {
        assert_eq!(table_id("db.age.parquet"), "age");
        assert_eq!(table_id("db.speaker.gender.csv"), "speaker.gender");
        assert_eq!(table_id("age.parquet"), "age");
    }
}
