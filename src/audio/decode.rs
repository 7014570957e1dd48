use ogg::reading::PacketReader;
use opus::{Channels, Decoder as OpusDecoder};

use super::resample::PolyphaseResampler;
use super::PcmAudio;
use crate::audio::mux::{self, MuxError};

/// Errors raised while demuxing and decoding an Ogg-Opus bitstream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{0}")]
    Mux(#[from] MuxError),

    #[error("malformed ogg stream: {0}")]
    Malformed(String),

    #[error("opus decode failed: {0}")]
    Opus(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

const MAX_FRAME_SAMPLES: usize = 5760; // 120ms at 48kHz, the largest Opus frame.
const TARGET_SAMPLE_RATE: u32 = 16000;

/// Demuxes raw Opus packets (wrapped on the fly into Ogg via [`mux`]),
/// decodes them, downmixes to mono, and resamples to
/// [`TARGET_SAMPLE_RATE`]. An empty packet list yields an empty buffer,
/// not an error.
pub fn decode_opus_packets_to_pcm(
    packets: &[Vec<u8>],
    input_sample_rate: u32,
) -> Result<PcmAudio> {
    if packets.is_empty() {
        return Ok(PcmAudio {
            pcm_s16le: Vec::new(),
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
        });
    }

    let ogg_bytes = mux::packets_to_ogg_opus(packets, input_sample_rate)?;
    decode_ogg_opus(&ogg_bytes, TARGET_SAMPLE_RATE)
}

/// Demuxes a complete Ogg-Opus byte stream and resamples the decoded
/// PCM to `output_sample_rate`.
pub fn decode_ogg_opus(ogg_bytes: &[u8], output_sample_rate: u32) -> Result<PcmAudio> {
    let mut reader = PacketReader::new(std::io::Cursor::new(ogg_bytes));

    let id_packet = reader
        .read_packet()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
        .ok_or_else(|| DecodeError::Malformed("stream has no identification header".into()))?;
    let (channels, native_rate, pre_skip) = parse_opus_head(&id_packet.data)?;

    let tags_packet = reader
        .read_packet()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
        .ok_or_else(|| DecodeError::Malformed("stream has no comment header".into()))?;
    if tags_packet.data.len() < 8 || &tags_packet.data[..8] != b"OpusTags" {
        return Err(DecodeError::Malformed("missing OpusTags header".into()));
    }

    let channel_count = match channels {
        1 => Channels::Mono,
        2 => Channels::Stereo,
        n => return Err(DecodeError::Malformed(format!("unsupported channel count: {n}"))),
    };

    let mut decoder =
        OpusDecoder::new(native_rate, channel_count).map_err(|e| DecodeError::Opus(e.to_string()))?;

    let mut interleaved: Vec<i16> = Vec::new();
    let mut scratch = vec![0i16; MAX_FRAME_SAMPLES * channels as usize];
    while let Some(packet) = reader
        .read_packet()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
    {
        let produced = decoder
            .decode(&packet.data, &mut scratch, false)
            .map_err(|e| DecodeError::Opus(e.to_string()))?;
        interleaved.extend_from_slice(&scratch[..produced * channels as usize]);
    }

    let mono = downmix_to_mono(&interleaved, channels as usize);
    let trimmed = skip_leading(&mono, pre_skip_to_native_samples(pre_skip, native_rate));

    let as_f64: Vec<f64> = trimmed.iter().map(|&s| s as f64).collect();
    let mut resampler = PolyphaseResampler::new(native_rate, output_sample_rate);
    let resampled = resampler.process(&as_f64);

    let pcm_s16le: Vec<i16> = resampled
        .iter()
        .map(|&s| s.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect();

    super::wavdump::maybe_dump(&pcm_s16le, output_sample_rate);

    Ok(PcmAudio {
        pcm_s16le,
        sample_rate: output_sample_rate,
        channels: 1,
    })
}

fn parse_opus_head(data: &[u8]) -> Result<(u8, u32, u16)> {
    if data.len() < 19 || &data[..8] != b"OpusHead" {
        return Err(DecodeError::Malformed("missing OpusHead header".into()));
    }
    if data[8] != 1 {
        return Err(DecodeError::Malformed(format!(
            "unsupported OpusHead version: {}",
            data[8]
        )));
    }
    let channels = data[9];
    let pre_skip = u16::from_le_bytes([data[10], data[11]]);
    let declared_rate = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

    // The Opus decoder only accepts a handful of native rates; snap the
    // declared input rate to the nearest one it supports.
    let native_rate = nearest_supported_rate(declared_rate);
    Ok((channels, native_rate, pre_skip))
}

/// `pre_skip` is an RFC 7845 OpusHead field, always expressed in 48kHz
/// ticks regardless of the stream's native sample rate; convert before
/// trimming samples that are already at `native_rate`.
fn pre_skip_to_native_samples(pre_skip: u16, native_rate: u32) -> usize {
    (pre_skip as u64 * native_rate as u64 / 48000) as usize
}

fn nearest_supported_rate(declared: u32) -> u32 {
    const RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];
    if RATES.contains(&declared) {
        return declared;
    }
    *RATES
        .iter()
        .min_by_key(|&&r| (r as i64 - declared as i64).abs())
        .unwrap_or(&48000)
}

fn downmix_to_mono(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

fn skip_leading(samples: &[i16], n: usize) -> Vec<i16> {
    if n >= samples.len() {
        return Vec::new();
    }
    samples[n..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_packets(count: usize) -> Vec<Vec<u8>> {
        // A single-byte Opus packet (TOC-only, silence/DTX-like) decodes
        // cleanly and is enough to exercise the full demux/decode path.
        vec![vec![0x00u8]; count]
    }

    #[test]
    fn decode_should_return_empty_pcm_for_empty_packet_list() {
        let pcm = decode_opus_packets_to_pcm(&[], 16000).unwrap();
        assert!(pcm.pcm_s16le.is_empty());
        assert_eq!(pcm.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(pcm.channels, 1);
    }

    #[test]
    fn decode_should_round_trip_silence() {
        let packets = silent_packets(10);
        let pcm = decode_opus_packets_to_pcm(&packets, 16000).unwrap();
        assert_eq!(pcm.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(pcm.channels, 1);
        // 10 * 20ms @ 16kHz native minus pre-skip, resampled to 16kHz: roughly
        // the original duration, well short of a full second.
        assert!(pcm.pcm_s16le.len() < TARGET_SAMPLE_RATE as usize);
    }

    #[test]
    fn decode_should_reject_malformed_ogg_bytes() {
        let err = decode_ogg_opus(b"not an ogg stream", TARGET_SAMPLE_RATE).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn decode_should_downmix_stereo_to_mono() {
        let interleaved = vec![100i16, -100, 200, -200];
        let mono = downmix_to_mono(&interleaved, 2);
        assert_eq!(mono, vec![0, 0]);
    }

    #[test]
    fn nearest_supported_rate_should_snap_to_known_opus_rates() {
        assert_eq!(nearest_supported_rate(44100), 48000);
        assert_eq!(nearest_supported_rate(16000), 16000);
    }

    #[test]
    fn pre_skip_to_native_samples_should_scale_from_48k_ticks() {
        // pre_skip is always in 48kHz ticks regardless of native_rate.
        assert_eq!(pre_skip_to_native_samples(312, 48000), 312);
        assert_eq!(pre_skip_to_native_samples(312, 16000), 104);
        assert_eq!(pre_skip_to_native_samples(312, 8000), 52);
        assert_eq!(pre_skip_to_native_samples(312, 24000), 156);
        assert_eq!(pre_skip_to_native_samples(312, 12000), 78);
    }
}
