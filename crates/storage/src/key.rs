//! Repository key validation and the canonical key naming scheme.
//!
//! Every object a repository holds is addressed by a slash-separated key
//! relative to the repository root. The layout is fixed:
//!
//! | Object            | Key                                          |
//! |-------------------|----------------------------------------------|
//! | Database header   | `<name>/<version>/db.yaml`                   |
//! | Dependency table  | `<name>/<version>/db.parquet`                |
//! | Table archive     | `<name>/meta/<version>/<table_id>.zip`       |
//! | Media archive     | `<name>/media/<version>/<fingerprint>.zip`   |
//! | Attachment archive| `<name>/attachment/<version>/<attachment_id>.zip` |
//!
//! A version is *published* once both `db.yaml` and `db.parquet` exist under
//! `<name>/<version>/`. Publishers upload these two last.

use crate::backend::Backend;
use crate::error::{ErrorKind, Result};
use std::collections::BTreeSet;

/// File name of the database header within a version.
pub const HEADER_FILE: &str = "db.yaml";
/// File name of the dependency table within a version.
pub const DEPS_FILE: &str = "db.parquet";

/// Key of the database header, the visibility commit of a version.
pub fn header(name: &str, version: &str) -> String {
    format!("{name}/{version}/{HEADER_FILE}")
}

/// Key of the dependency table.
pub fn deps(name: &str, version: &str) -> String {
    format!("{name}/{version}/{DEPS_FILE}")
}

/// Key of a table archive.
pub fn meta(name: &str, version: &str, table_id: &str) -> String {
    format!("{name}/meta/{version}/{table_id}.zip")
}

/// Key of a media archive.
pub fn media(name: &str, version: &str, fingerprint: &str) -> String {
    format!("{name}/media/{version}/{fingerprint}.zip")
}

/// Key of an attachment archive.
pub fn attachment(name: &str, version: &str, attachment_id: &str) -> String {
    format!("{name}/attachment/{version}/{attachment_id}.zip")
}

/// Validate a repository key: slash-separated, no traversal, no null bytes.
pub fn validate(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\0') {
            exn::bail!(ErrorKind::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

/// List the published versions of a database at one repository, sorted by
/// semver order.
///
/// A version counts only when the listing shows both its header and its
/// dependency table; half-uploaded versions stay invisible.
pub async fn ls_versions(backend: &dyn Backend, name: &str) -> Result<Vec<semver::Version>> {
    let keys = backend.list(&format!("{name}/")).await?;
    let keys: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
    let mut versions = BTreeSet::new();
    for key in &keys {
        let Some(rest) = key.strip_prefix(&format!("{name}/")) else { continue };
        let Some((segment, file)) = rest.split_once('/') else { continue };
        if file != HEADER_FILE {
            continue;
        }
        let Ok(version) = semver::Version::parse(segment) else { continue };
        if keys.contains(deps(name, segment).as_str()) {
            versions.insert(version);
        }
    }
    Ok(versions.into_iter().collect())
}
