//! Two-tier cache and locking for audb.
//!
//! Materialized database versions live under
//! `<root>/<name>/<version>/<flavor_id>/` in a shared (read-first) and a
//! user (writable) tier. Flavor directories are mutated concurrently by
//! multiple processes, so every mutation happens under the directory's
//! [`FlavorLock`]; completed materializations carry a `.complete` sentinel;
//! and unchanged files are hard-linked across versions through the
//! [`ReusePool`] instead of being fetched again.

pub mod error;
mod lock;
mod reuse;
mod tiers;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::lock::FlavorLock;
pub use crate::reuse::ReusePool;
pub use crate::tiers::{COMPLETE_FILE, CacheTiers, LOCK_FILE, clear_complete, is_marked_complete, mark_complete};
