//! MD5 content checksums.
//!
//! Every artifact in a dependency table is identified by the MD5 hex digest
//! of its bytes. Files are digested in 64 KiB chunks so media files never
//! need to fit in memory.

use crate::error::{ErrorKind, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK: usize = 64 * 1024;

/// MD5 hex digest of a file's content.
pub fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path.as_ref()).map_err(ErrorKind::Io)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let read = file.read(&mut buf).map_err(ErrorKind::Io)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// MD5 hex digest of a byte slice.
pub fn md5_bytes(bytes: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(bytes.as_ref()))
}
