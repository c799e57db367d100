//! The flavor value object.
//!
//! A flavor describes the media transformation a consumer wants applied on
//! load: target container format, sample rate, bit depth, channel selection
//! and mixdown. The *default* flavor leaves every field unset and applies no
//! transformation at all.

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Identifier of the default (untransformed) flavor.
pub const DEFAULT_FLAVOR_ID: &str = "default";

/// Sample rates a flavor may request, in Hz.
pub const ALLOWED_SAMPLING_RATES: [u32; 6] = [8000, 16000, 22050, 24000, 44100, 48000];
/// Bit depths a flavor may request. 32 bit requires the `wav` format.
pub const ALLOWED_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];

/// Target audio container of a flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[display("wav")]
    Wav,
    #[display("flac")]
    Flac,
}
impl AudioFormat {
    /// Lowercase file extension of the format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }
}
impl std::str::FromStr for AudioFormat {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            other => exn::bail!(ErrorKind::InvalidFlavor(format!("unknown format `{other}`"))),
        }
    }
}

/// Media transformation specification.
///
/// Construct with struct update syntax from [`Flavor::default`], then call
/// [`normalize`](Self::normalize) once before use; the pipelines only accept
/// normalized flavors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    /// Target PCM bit depth.
    pub bit_depth: Option<u16>,
    /// Ordered channel selection; negative indices count from the last
    /// channel.
    pub channels: Option<Vec<i32>>,
    /// Target container format.
    pub format: Option<AudioFormat>,
    /// Mix the (selected) channels down to mono.
    pub mixdown: bool,
    /// Target sample rate in Hz.
    pub sampling_rate: Option<u32>,
}

impl Flavor {
    /// `true` when no transformation is requested.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Validate the specification and canonicalize it.
    ///
    /// - `22500` Hz is accepted as a deprecated alias for 22050 (warned).
    /// - `mixdown` is forced to `false` when the channel selection is
    ///   already mono.
    pub fn normalize(mut self) -> Result<Self> {
        if let Some(rate) = self.sampling_rate {
            if rate == 22500 {
                tracing::warn!("sampling rate 22500 is a deprecated alias, using 22050");
                self.sampling_rate = Some(22050);
            } else if !ALLOWED_SAMPLING_RATES.contains(&rate) {
                exn::bail!(ErrorKind::InvalidFlavor(format!("sampling rate {rate} not in {ALLOWED_SAMPLING_RATES:?}")));
            }
        }
        if let Some(depth) = self.bit_depth {
            if !ALLOWED_BIT_DEPTHS.contains(&depth) {
                exn::bail!(ErrorKind::InvalidFlavor(format!("bit depth {depth} not in {ALLOWED_BIT_DEPTHS:?}")));
            }
            if depth == 32 && self.format != Some(AudioFormat::Wav) {
                exn::bail!(ErrorKind::InvalidFlavor("bit depth 32 requires format `wav`".to_string()));
            }
        }
        if let Some(channels) = &self.channels {
            if channels.is_empty() {
                exn::bail!(ErrorKind::InvalidFlavor("channel selection must not be empty".to_string()));
            }
            if channels.len() == 1 {
                self.mixdown = false;
            }
        }
        Ok(self)
    }

    /// Short stable identifier of the flavor.
    ///
    /// The default flavor maps to the designated string `"default"`; any
    /// other flavor hashes its canonical form, with unset fields encoded
    /// distinctly from every concrete value.
    pub fn id(&self) -> String {
        if self.is_default() {
            return DEFAULT_FLAVOR_ID.to_string();
        }
        let canonical = self.canonical();
        blake3::hash(canonical.as_bytes()).to_hex()[..8].to_string()
    }

    fn canonical(&self) -> String {
        let channels = self
            .channels
            .as_ref()
            .map(|c| c.iter().map(ToString::to_string).collect::<Vec<_>>().join(","))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "bit_depth={}\nchannels={}\nformat={}\nmixdown={}\nsampling_rate={}",
            self.bit_depth.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
            channels,
            self.format.map(|f| f.to_string()).unwrap_or_else(|| "-".to_string()),
            self.mixdown,
            self.sampling_rate.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
        )
    }

    /// Destination path of a media file under this flavor.
    ///
    /// Rewrites the extension when a target format is set; non-audio files
    /// and the default flavor keep their path.
    pub fn destination(&self, path: &str) -> String {
        let Some(format) = self.format else { return path.to_string() };
        if !is_audio_path(path) {
            return path.to_string();
        }
        match path.rsplit_once('.') {
            Some((stem, _ext)) => format!("{stem}.{}", format.extension()),
            None => path.to_string(),
        }
    }
}

/// Extensions the flavor engine treats as audio. Everything else passes
/// through untouched.
const AUDIO_EXTENSIONS: [&str; 4] = ["wav", "flac", "mp3", "ogg"];

/// `true` when the path's extension marks an audio container.
pub fn is_audio_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}
