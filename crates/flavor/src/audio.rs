//! Audio properties and the WAV header probe.
//!
//! Publish records bit depth, channel count, sample rate and duration for
//! every audio file; the flavor engine compares the same properties against
//! a requested flavor to decide whether a file needs converting. Reading a
//! RIFF `fmt ` chunk is plain container metadata and lives here; anything
//! that touches samples (decoding, resampling, remixing) belongs to the
//! [`AudioConverter`](crate::AudioConverter) collaborator.

use crate::error::{ErrorKind, Result};
use crate::spec::is_audio_path;
use std::io::Read;
use std::path::Path;

/// Measured properties of one audio file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioInfo {
    /// PCM bit depth.
    pub bit_depth: i32,
    /// Channel count.
    pub channels: i32,
    /// Sample rate in Hz.
    pub sampling_rate: i32,
    /// Duration in seconds.
    pub duration: f64,
}

impl AudioInfo {
    /// Probe a media file's properties from its container header.
    ///
    /// Returns `None` for non-audio paths and for audio containers the probe
    /// doesn't understand (their dependency rows carry zeros, exactly like
    /// non-audio media). A recognizably-WAV file with a broken header is
    /// [`Corrupt`](crate::error::ErrorKind::Corrupt).
    pub fn probe(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !is_audio_path(&path.to_string_lossy()) {
            return Ok(None);
        }
        let is_wav = path.extension().map(|e| e.to_string_lossy().to_lowercase() == "wav").unwrap_or(false);
        if !is_wav {
            return Ok(None);
        }
        let mut file = std::fs::File::open(path).map_err(ErrorKind::Io)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(ErrorKind::Io)?;
        parse_wav(&bytes, path).map(Some)
    }
}

/// Minimal RIFF/WAVE walk: find the `fmt ` and `data` chunks, nothing more.
fn parse_wav(bytes: &[u8], path: &Path) -> Result<AudioInfo> {
    let corrupt = || ErrorKind::Corrupt(format!("bad WAV header: {}", path.display()));
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        exn::bail!(corrupt());
    }
    let mut info: Option<(u16, u16, u32, u32)> = None;
    let mut data_len: Option<u32> = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let chunk_id = &bytes[offset..offset + 4];
        let chunk_len = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let body = offset + 8;
        match chunk_id {
            b"fmt " => {
                if body + 16 > bytes.len() {
                    exn::bail!(corrupt());
                }
                let channels = u16::from_le_bytes(bytes[body + 2..body + 4].try_into().unwrap());
                let sampling_rate = u32::from_le_bytes(bytes[body + 4..body + 8].try_into().unwrap());
                let byte_rate = u32::from_le_bytes(bytes[body + 8..body + 12].try_into().unwrap());
                let bit_depth = u16::from_le_bytes(bytes[body + 14..body + 16].try_into().unwrap());
                info = Some((channels, bit_depth, sampling_rate, byte_rate));
            },
            b"data" => {
                data_len = Some(chunk_len);
            },
            _ => {},
        }
        // Chunks are word-aligned
        offset = body + chunk_len as usize + (chunk_len as usize & 1);
    }
    let Some((channels, bit_depth, sampling_rate, byte_rate)) = info else {
        exn::bail!(corrupt());
    };
    if channels == 0 || sampling_rate == 0 {
        exn::bail!(corrupt());
    }
    let duration = match (data_len, byte_rate) {
        (Some(len), rate) if rate > 0 => f64::from(len) / f64::from(rate),
        _ => 0.0,
    };
    Ok(AudioInfo {
        bit_depth: i32::from(bit_depth),
        channels: i32::from(channels),
        sampling_rate: sampling_rate as i32,
        duration,
    })
}

/// Serialize a minimal PCM WAV file; shared by tests across the workspace.
pub fn write_wav(path: impl AsRef<Path>, channels: u16, bit_depth: u16, sampling_rate: u32, seconds: f64) -> Result<()> {
    let bytes_per_sample = u32::from(bit_depth) / 8;
    let byte_rate = sampling_rate * u32::from(channels) * bytes_per_sample;
    let data_len = (f64::from(byte_rate) * seconds).round() as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sampling_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&((bytes_per_sample as u16) * channels).to_le_bytes());
    out.extend_from_slice(&bit_depth.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    std::fs::write(path.as_ref(), out).map_err(ErrorKind::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 2, 16, 44100, 1.5).unwrap();
        let info = AudioInfo::probe(&path).unwrap().unwrap();
        assert_eq!(info.channels, 2);
        assert_eq!(info.bit_depth, 16);
        assert_eq!(info.sampling_rate, 44100);
        assert!((info.duration - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_probe_non_audio_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert!(AudioInfo::probe(&path).unwrap().is_none());
    }

    #[test]
    fn test_probe_unknown_audio_container_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.ogg");
        std::fs::write(&path, b"OggS").unwrap();
        assert!(AudioInfo::probe(&path).unwrap().is_none());
    }

    #[test]
    fn test_probe_broken_wav_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"RIFFxxxxNOPE").unwrap();
        let err = AudioInfo::probe(&path).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }
}
