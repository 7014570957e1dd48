//! Debug WAV capture: when `GHOSTTYPE_DUMP_WAV` is set, every decoded
//! utterance is additionally written to `GHOSTTYPE_DUMP_WAV_DIR` as a
//! mono 16-bit PCM WAV file for offline inspection. This never affects
//! the `PcmAudio` handed back to the caller — a failure here is logged
//! and otherwise swallowed.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

fn dump_enabled() -> bool {
    std::env::var("GHOSTTYPE_DUMP_WAV")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

fn dump_dir() -> Option<PathBuf> {
    std::env::var("GHOSTTYPE_DUMP_WAV_DIR").ok().map(PathBuf::from)
}

/// Writes `pcm` to a fresh timestamped WAV file if capture is enabled.
/// No-op when `GHOSTTYPE_DUMP_WAV` is unset.
pub fn maybe_dump(pcm_s16le: &[i16], sample_rate: u32) {
    if !dump_enabled() {
        return;
    }
    let Some(dir) = dump_dir() else {
        tracing::warn!("GHOSTTYPE_DUMP_WAV set without GHOSTTYPE_DUMP_WAV_DIR; skipping capture");
        return;
    };
    if let Err(e) = write_dump(&dir, pcm_s16le, sample_rate) {
        tracing::warn!(error = %e, "failed to write wav dump");
    }
}

fn write_dump(dir: &Path, pcm: &[i16], sample_rate: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(dump_filename());
    write_wav(&path, pcm, sample_rate)
}

fn dump_filename() -> String {
    format!("ghosttype_{}.wav", Local::now().format("%Y%m%d_%H%M%S_%6f"))
}

/// Writes a minimal RIFF/WAVE container: one `fmt ` chunk describing
/// mono 16-bit PCM at `sample_rate`, followed by one `data` chunk.
fn write_wav(path: &Path, pcm: &[i16], sample_rate: u32) -> std::io::Result<()> {
    const CHANNELS: u16 = 1;
    const BITS_PER_SAMPLE: u16 = 16;
    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = (pcm.len() * 2) as u32;

    let mut file = std::fs::File::create(path)?;
    file.write_all(b"RIFF")?;
    file.write_all(&(36 + data_len).to_le_bytes())?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?; // PCM
    file.write_all(&CHANNELS.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;
    file.write_all(&byte_rate.to_le_bytes())?;
    file.write_all(&block_align.to_le_bytes())?;
    file.write_all(&BITS_PER_SAMPLE.to_le_bytes())?;
    file.write_all(b"data")?;
    file.write_all(&data_len.to_le_bytes())?;
    for &sample in pcm {
        file.write_all(&sample.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_wav_should_produce_valid_riff_header_and_sized_data_chunk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.wav");
        let pcm = vec![1i16, -1, 2, -2, 3];
        write_wav(&path, &pcm, 16000).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 1); // mono
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            16000
        );
        assert_eq!(&bytes[36..40], b"data");
        let data_len = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]) as usize;
        assert_eq!(data_len, pcm.len() * 2);
        assert_eq!(bytes.len(), 44 + data_len);
    }

    #[test]
    fn maybe_dump_should_be_a_no_op_when_disabled() {
        std::env::remove_var("GHOSTTYPE_DUMP_WAV");
        // Should not panic or touch the filesystem.
        maybe_dump(&[0i16; 10], 16000);
    }

    #[test]
    fn dump_filename_should_match_the_expected_pattern() {
        let name = dump_filename();
        assert!(name.starts_with("ghosttype_"));
        assert!(name.ends_with(".wav"));
        // ghosttype_ + YYYYMMDD_HHMMSS_ffffff + .wav
        let stem = name.trim_start_matches("ghosttype_").trim_end_matches(".wav");
        assert_eq!(stem.len(), 8 + 1 + 6 + 1 + 6);
    }
}
