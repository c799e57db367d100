//! Media flavors for audb.
//!
//! A flavor is a value object describing the audio transformation a consumer
//! wants applied on load (format, sample rate, bit depth, channel selection,
//! mixdown). This crate owns the flavor identity (a short stable hash of the
//! normalized spec), the decision of which files need converting, and the
//! narrow [`AudioConverter`] interface the actual audio stack plugs into.

mod audio;
mod engine;
pub mod error;
mod spec;

pub use crate::audio::{AudioInfo, write_wav};
#[cfg(feature = "mock")]
pub use crate::engine::MockConverter;
pub use crate::engine::{AudioConverter, RefusingConverter, materialize, needs_conversion};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::spec::{
    ALLOWED_BIT_DEPTHS, ALLOWED_SAMPLING_RATES, AudioFormat, DEFAULT_FLAVOR_ID, Flavor, is_audio_path,
};
