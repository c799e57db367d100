//! Packing and unpacking ZIP containers.
//!
//! Archives use deflate compression and may hold nested relative paths. The
//! archive identifier (fingerprint) is chosen by the caller and never appears
//! inside the container.

use crate::checksum::{md5_bytes, md5_file};
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Pack an ordered set of files into a ZIP container at `dest`.
///
/// `members` are paths relative to `root`; they are stored under those
/// relative names. Parent directories of `dest` must already exist.
pub fn pack(root: impl AsRef<Path>, members: &[impl AsRef<str>], dest: impl AsRef<Path>) -> Result<()> {
    let root = root.as_ref();
    let file = File::create(dest.as_ref()).map_err(ErrorKind::Io)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for member in members {
        let member = member.as_ref();
        let source = root.join(member);
        if !source.is_file() {
            exn::bail!(ErrorKind::MissingMember(source));
        }
        // ZIP entry names always use forward slashes, which `member` already
        // does (repository-relative paths are slash-separated everywhere).
        writer.start_file(member, options).or_raise(|| ErrorKind::Io(other("start zip entry")))?;
        let mut input = File::open(&source).map_err(ErrorKind::Io)?;
        std::io::copy(&mut input, &mut writer).map_err(ErrorKind::Io)?;
    }
    writer.finish().or_raise(|| ErrorKind::Io(other("finish zip container")))?;
    Ok(())
}

/// Unpack a ZIP container into `dest`, preserving relative paths.
///
/// Unpacking is idempotent: an entry whose destination file already exists
/// with identical bytes (checked by MD5) is left untouched, so re-running an
/// interrupted unpack never rewrites good files.
pub fn unpack(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<Vec<String>> {
    let src = src.as_ref();
    let dest = dest.as_ref();
    let file = File::open(src).map_err(ErrorKind::Io)?;
    let mut archive = ZipArchive::new(file).or_raise(|| ErrorKind::Corrupt(src.to_path_buf()))?;
    let mut unpacked = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).or_raise(|| ErrorKind::Corrupt(src.to_path_buf()))?;
        let relative = entry.enclosed_name().ok_or_raise(|| ErrorKind::UnsafeEntry(entry.name().to_string()))?;
        let target = dest.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(ErrorKind::Io)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(ErrorKind::Io)?;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).or_raise(|| ErrorKind::Corrupt(src.to_path_buf()))?;
        let fresh = match target.is_file() {
            true => md5_file(&target)? != md5_bytes(&bytes),
            false => true,
        };
        if fresh {
            let mut out = File::create(&target).map_err(ErrorKind::Io)?;
            out.write_all(&bytes).map_err(ErrorKind::Io)?;
        }
        unpacked.push(relative.to_string_lossy().into_owned());
    }
    Ok(unpacked)
}

fn other(msg: &str) -> std::io::Error {
    std::io::Error::other(msg.to_string())
}
