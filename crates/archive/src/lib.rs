//! Archive codec for audb.
//!
//! Packs artifacts into content-addressed ZIP containers and unpacks them
//! into cache directories, plus the MD5 checksum and UUIDv5 fingerprint
//! helpers the publish pipeline builds archive identities from.

mod checksum;
mod codec;
pub mod error;
mod fingerprint;

pub use crate::checksum::{md5_bytes, md5_file};
pub use crate::codec::{pack, unpack};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::fingerprint::fingerprint;
