//! Driving the audio transform collaborator.
//!
//! The engine owns the *decision*: compare a file's measured properties
//! against the requested flavor and either hand the file to the converter or
//! hard-link/copy it through untouched. The conversion itself (decoding,
//! resampling, remixing, re-encoding) is entirely the collaborator's
//! problem.

use crate::audio::AudioInfo;
use crate::error::{ErrorKind, Result};
use crate::spec::Flavor;
use std::path::Path;

/// Audio transform collaborator.
///
/// `convert` receives the source file, the destination path (extension
/// already mapped to the flavor's format), the measured source properties
/// and the requested flavor. Implementations fail with
/// [`UnsupportedConversion`](crate::error::ErrorKind::UnsupportedConversion)
/// for transformations they cannot express, or with `Io` errors.
pub trait AudioConverter: Send + Sync {
    fn convert(&self, src: &Path, dst: &Path, info: &AudioInfo, flavor: &Flavor) -> Result<()>;
}

/// Converter used when no real audio stack is wired in: every actual
/// conversion is refused, pass-through still works.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefusingConverter;
impl AudioConverter for RefusingConverter {
    fn convert(&self, src: &Path, _dst: &Path, _info: &AudioInfo, _flavor: &Flavor) -> Result<()> {
        exn::bail!(ErrorKind::UnsupportedConversion(format!("no audio converter configured for {}", src.display())))
    }
}

/// Resolve a channel selection against a concrete channel count. Negative
/// indices count from the last channel.
fn resolve_channels(selection: &[i32], count: i32) -> Vec<i32> {
    selection.iter().map(|&c| if c < 0 { count + c } else { c }).collect()
}

/// `true` when the file's properties diverge from the flavor and the
/// converter has to run.
pub fn needs_conversion(path: &str, info: &AudioInfo, flavor: &Flavor) -> bool {
    if let Some(format) = flavor.format {
        let ext = std::path::Path::new(path).extension().map(|e| e.to_string_lossy().to_lowercase());
        if ext.as_deref() != Some(format.extension()) {
            return true;
        }
    }
    if let Some(rate) = flavor.sampling_rate {
        if info.sampling_rate != rate as i32 {
            return true;
        }
    }
    if let Some(depth) = flavor.bit_depth {
        if info.bit_depth != i32::from(depth) {
            return true;
        }
    }
    if let Some(selection) = &flavor.channels {
        let identity: Vec<i32> = (0..info.channels).collect();
        if resolve_channels(selection, info.channels) != identity {
            return true;
        }
    }
    if flavor.mixdown && info.channels > 1 {
        return true;
    }
    false
}

/// Materialize one media file of a non-default flavor inside a flavor
/// directory.
///
/// `media_path` is the artifact's repository-relative path; the original
/// bytes are expected at `dir/media_path`. Returns the relative path the
/// flavor maps the file to (unchanged for pass-through files).
pub fn materialize(
    converter: &dyn AudioConverter,
    flavor: &Flavor,
    dir: &Path,
    media_path: &str,
) -> Result<String> {
    let src = dir.join(media_path);
    // Non-audio media passes through under its original name, and so do
    // audio containers the probe can't measure: without source properties
    // the converter has nothing trustworthy to compare against.
    let Some(info) = AudioInfo::probe(&src)? else {
        return Ok(media_path.to_string());
    };

    let destination = flavor.destination(media_path);
    let dst = dir.join(&destination);
    if needs_conversion(media_path, &info, flavor) {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(ErrorKind::Io)?;
        }
        converter.convert(&src, &dst, &info, flavor)?;
        if dst != src {
            std::fs::remove_file(&src).map_err(ErrorKind::Io)?;
        }
    } else if dst != src {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(ErrorKind::Io)?;
        }
        if std::fs::hard_link(&src, &dst).is_err() {
            std::fs::copy(&src, &dst).map_err(ErrorKind::Io)?;
        }
    }
    Ok(destination)
}

#[cfg(feature = "mock")]
pub use self::mock::MockConverter;

#[cfg(feature = "mock")]
mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Recording converter for tests.
    ///
    /// Copies source bytes to the destination (so "converted" files exist
    /// and are non-empty) and records every conversion request. Specific
    /// source paths can be poisoned to fail.
    #[derive(Debug, Default)]
    pub struct MockConverter {
        converted: Mutex<Vec<(String, String)>>,
        poisoned: Mutex<Vec<String>>,
    }

    impl MockConverter {
        /// Make conversions fail for any source path ending in `suffix`.
        pub fn poison(&self, suffix: impl Into<String>) {
            self.poisoned.lock().unwrap().push(suffix.into());
        }

        /// All `(src, dst)` pairs converted so far.
        pub fn conversions(&self) -> Vec<(String, String)> {
            self.converted.lock().unwrap().clone()
        }
    }

    impl AudioConverter for MockConverter {
        fn convert(&self, src: &Path, dst: &Path, _info: &AudioInfo, _flavor: &Flavor) -> Result<()> {
            let src_str = src.to_string_lossy().into_owned();
            if self.poisoned.lock().unwrap().iter().any(|s| src_str.ends_with(s.as_str())) {
                exn::bail!(ErrorKind::UnsupportedConversion(format!("poisoned: {src_str}")));
            }
            std::fs::copy(src, dst).map_err(ErrorKind::Io)?;
            self.converted.lock().unwrap().push((src_str, dst.to_string_lossy().into_owned()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use crate::spec::AudioFormat;

    fn wav_info() -> AudioInfo {
        AudioInfo { bit_depth: 16, channels: 1, sampling_rate: 16000, duration: 1.0 }
    }

    #[test]
    fn test_needs_conversion_on_format_change() {
        let flavor = Flavor { format: Some(AudioFormat::Flac), ..Flavor::default() };
        assert!(needs_conversion("a.wav", &wav_info(), &flavor));
        assert!(!needs_conversion("a.flac", &wav_info(), &flavor));
    }

    #[test]
    fn test_needs_conversion_on_rate_and_depth() {
        let flavor = Flavor { sampling_rate: Some(16000), bit_depth: Some(16), ..Flavor::default() };
        assert!(!needs_conversion("a.wav", &wav_info(), &flavor));
        let flavor = Flavor { sampling_rate: Some(44100), ..Flavor::default() };
        assert!(needs_conversion("a.wav", &wav_info(), &flavor));
    }

    #[test]
    fn test_identity_channel_selection_passes_through() {
        let two_channel = AudioInfo { channels: 2, ..wav_info() };
        let identity = Flavor { channels: Some(vec![0, 1]), ..Flavor::default() };
        assert!(!needs_conversion("a.wav", &two_channel, &identity));
        // Negative index resolving to the identity still passes
        let negative = Flavor { channels: Some(vec![0, -1]), ..Flavor::default() };
        assert!(!needs_conversion("a.wav", &two_channel, &negative));
        let swap = Flavor { channels: Some(vec![1, 0]), ..Flavor::default() };
        assert!(needs_conversion("a.wav", &two_channel, &swap));
    }

    #[test]
    fn test_mixdown_only_matters_for_multichannel() {
        let flavor = Flavor { mixdown: true, ..Flavor::default() };
        assert!(!needs_conversion("a.wav", &wav_info(), &flavor));
        let stereo = AudioInfo { channels: 2, ..wav_info() };
        assert!(needs_conversion("a.wav", &stereo, &flavor));
    }

    #[test]
    fn test_refusing_converter_surfaces_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(dir.path().join("a.wav"), 1, 16, 16000, 0.1).unwrap();
        let flavor = Flavor { sampling_rate: Some(44100), ..Flavor::default() };
        let err = materialize(&RefusingConverter, &flavor, dir.path(), "a.wav").unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedConversion(_)));
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_materialize_converts_and_drops_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("audio")).unwrap();
        write_wav(dir.path().join("audio/001.wav"), 1, 16, 16000, 0.1).unwrap();
        let converter = MockConverter::default();
        let flavor = Flavor { format: Some(AudioFormat::Flac), ..Flavor::default() };
        let result = materialize(&converter, &flavor, dir.path(), "audio/001.wav").unwrap();
        assert_eq!(result, "audio/001.flac");
        assert!(dir.path().join("audio/001.flac").is_file());
        assert!(!dir.path().join("audio/001.wav").exists());
        assert_eq!(converter.conversions().len(), 1);
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_materialize_passes_matching_files_through() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(dir.path().join("a.wav"), 1, 16, 16000, 0.1).unwrap();
        let converter = MockConverter::default();
        let flavor = Flavor { sampling_rate: Some(16000), ..Flavor::default() };
        let result = materialize(&converter, &flavor, dir.path(), "a.wav").unwrap();
        assert_eq!(result, "a.wav");
        assert!(converter.conversions().is_empty());
    }

    #[test]
    fn test_non_audio_media_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video.mp4"), b"mp4").unwrap();
        let flavor = Flavor { format: Some(AudioFormat::Flac), ..Flavor::default() };
        let result = materialize(&RefusingConverter, &flavor, dir.path(), "video.mp4").unwrap();
        assert_eq!(result, "video.mp4");
    }
}
