//! The database header collaborator.
//!
//! `db.yaml` is owned by the audformat layer; the core only needs a narrow
//! window into it: the database name, the table and attachment listings, and
//! a handful of descriptive fields for the info queries. Everything else is
//! carried as opaque YAML values and round-trips untouched.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// One attachment declaration: a payload file or directory below the
/// database root.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed database header.
///
/// Loosely typed on purpose: schemes, raters, splits and table bodies are
/// audformat's business and stay opaque [`serde_yaml::Value`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub organization: Option<String>,
    pub license: Option<String>,
    pub source: Option<String>,
    pub usage: Option<String>,
    pub languages: Vec<String>,
    pub media: BTreeMap<String, serde_yaml::Value>,
    pub raters: BTreeMap<String, serde_yaml::Value>,
    pub schemes: BTreeMap<String, serde_yaml::Value>,
    pub splits: BTreeMap<String, serde_yaml::Value>,
    pub tables: BTreeMap<String, serde_yaml::Value>,
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Header {
    /// Parse a header file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(ErrorKind::Io)?;
        serde_yaml::from_str(&raw).or_raise(|| ErrorKind::Corrupt(format!("bad database header: {}", path.display())))
    }

    /// Table ids declared by the header, sorted.
    pub fn table_ids(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Attachment ids declared by the header, sorted.
    pub fn attachment_ids(&self) -> Vec<&str> {
        self.attachments.keys().map(String::as_str).collect()
    }

    /// Scheme ids declared by the header, sorted.
    pub fn scheme_ids(&self) -> Vec<&str> {
        self.schemes.keys().map(String::as_str).collect()
    }

    /// Split ids declared by the header, sorted.
    pub fn split_ids(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    /// Rater ids declared by the header, sorted.
    pub fn rater_ids(&self) -> Vec<&str> {
        self.raters.keys().map(String::as_str).collect()
    }
}

/// Check that a repository-relative path stays below the database root.
///
/// Used by the publish preconditions: a *portable* database has no absolute
/// paths and none that climb out of the build directory.
pub fn is_portable_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let path = Path::new(path);
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"
name: emodb
description: Berlin Database of Emotional Speech
languages:
  - deu
schemes:
  emotion:
    dtype: str
    labels: [anger, boredom, neutral]
  age:
    dtype: int
raters:
  gold:
    type: human
splits:
  test:
    type: test
tables:
  emotion:
    type: filewise
    columns:
      emotion: {scheme_id: emotion, rater_id: gold}
attachments:
  licence:
    path: docs/licence.txt
"#;

    #[test]
    fn test_parse_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.yaml");
        std::fs::write(&path, HEADER).unwrap();
        let header = Header::load(&path).unwrap();
        assert_eq!(header.name.as_deref(), Some("emodb"));
        assert_eq!(header.languages, vec!["deu".to_string()]);
        assert_eq!(header.table_ids(), vec!["emotion"]);
        assert_eq!(header.scheme_ids(), vec!["age", "emotion"]);
        assert_eq!(header.rater_ids(), vec!["gold"]);
        assert_eq!(header.split_ids(), vec!["test"]);
        assert_eq!(header.attachments["licence"].path, "docs/licence.txt");
    }

    #[test]
    fn test_unknown_fields_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.yaml");
        std::fs::write(&path, "name: emodb\nfuture_field: 42\n").unwrap();
        let header = Header::load(&path).unwrap();
        assert!(header.extra.contains_key("future_field"));
    }

    #[test]
    fn test_bad_yaml_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.yaml");
        std::fs::write(&path, "{not yaml: [").unwrap();
        let err = Header::load(&path).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_portable_paths() {
        assert!(is_portable_path("audio/001.wav"));
        assert!(is_portable_path("./docs/licence.txt"));
        assert!(!is_portable_path("/etc/passwd"));
        assert!(!is_portable_path("../outside"));
        assert!(!is_portable_path("a/../../b"));
        assert!(!is_portable_path(""));
    }
}
