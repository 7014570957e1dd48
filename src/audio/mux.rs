use ogg::writing::{PacketWriteEndInfo, PacketWriter};

/// Errors raised while repacketizing raw Opus frames into an Ogg bitstream.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("packet too large for a single Ogg page ({len} bytes)")]
    PacketTooLarge { len: usize },

    #[error("ogg write failed: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, MuxError>;

const SUPPORTED_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];
const PRE_SKIP: u16 = 312;
const OGG_OPUS_GRANULE_RATE: u32 = 48000;
/// Ogg limits a page's segment table to 255 entries of 255 bytes each.
const MAX_SINGLE_PAGE_PACKET: usize = 255 * 255;

fn build_opus_head(input_sample_rate: u32) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(1); // channels (mono)
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&input_sample_rate.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn build_opus_tags() -> Vec<u8> {
    let vendor = b"GhostType";
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes()); // 0 user comments
    tags
}

/// Wraps a sequence of raw 20ms Opus packets, captured at `input_sample_rate`,
/// into a single-logical-stream Ogg container (RFC 7845).
///
/// The stream serial is drawn at random per call; this service never
/// multiplexes more than one logical stream per physical Ogg stream, so
/// uniqueness across concurrent streams is the only property that matters.
pub fn packets_to_ogg_opus(packets: &[Vec<u8>], input_sample_rate: u32) -> Result<Vec<u8>> {
    if !SUPPORTED_RATES.contains(&input_sample_rate) {
        return Err(MuxError::UnsupportedSampleRate(input_sample_rate));
    }
    for packet in packets {
        if packet.len() > MAX_SINGLE_PAGE_PACKET {
            return Err(MuxError::PacketTooLarge { len: packet.len() });
        }
    }

    let frame_samples = input_sample_rate / 50;
    let granule_step = frame_samples as u64 * (OGG_OPUS_GRANULE_RATE / input_sample_rate) as u64;

    let serial: u32 = rand_serial();

    let mut out = Vec::new();
    {
        let mut writer = PacketWriter::new(&mut out);

        writer
            .write_packet(
                build_opus_head(input_sample_rate),
                serial,
                PacketWriteEndInfo::EndPage,
                0,
            )
            .map_err(|e| MuxError::Write(format!("OpusHead: {e}")))?;

        writer
            .write_packet(build_opus_tags(), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| MuxError::Write(format!("OpusTags: {e}")))?;

        let mut granule: u64 = 0;
        let last_index = packets.len().saturating_sub(1);
        for (i, packet) in packets.iter().enumerate() {
            granule += granule_step;
            let effective_granule = granule.saturating_sub(PRE_SKIP as u64);

            let end_info = if i == last_index {
                PacketWriteEndInfo::EndStream
            } else {
                PacketWriteEndInfo::NormalPacket
            };

            writer
                .write_packet(packet.clone(), serial, end_info, effective_granule)
                .map_err(|e| MuxError::Write(format!("audio page: {e}")))?;
        }
    }

    Ok(out)
}

fn rand_serial() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ (std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc_table() -> [u32; 256] {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut r = (i as u32) << 24;
            for _ in 0..8 {
                r = if r & 0x8000_0000 != 0 {
                    (r << 1) ^ 0x04c1_1db7
                } else {
                    r << 1
                };
            }
            *entry = r;
        }
        table
    }

    fn ogg_crc(page: &[u8]) -> u32 {
        let table = crc_table();
        let mut crc: u32 = 0;
        for &b in page {
            crc = (crc << 8) ^ table[(((crc >> 24) ^ b as u32) & 0xff) as usize];
        }
        crc
    }

    /// Walks the raw Ogg byte stream page by page, verifying magic, recomputing
    /// CRC with the field zeroed, and recording header types in order.
    fn verify_pages(bytes: &[u8]) -> Vec<u8> {
        let mut header_types = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            assert_eq!(&bytes[pos..pos + 4], b"OggS", "page must start with OggS");
            let header_type = bytes[pos + 5];
            header_types.push(header_type);

            let num_segments = bytes[pos + 26] as usize;
            let seg_table = &bytes[pos + 27..pos + 27 + num_segments];
            let body_len: usize = seg_table.iter().map(|&s| s as usize).sum();
            let page_len = 27 + num_segments + body_len;

            let mut page = bytes[pos..pos + page_len].to_vec();
            let stored_crc = u32::from_le_bytes(page[22..26].try_into().unwrap());
            page[22..26].copy_from_slice(&[0, 0, 0, 0]);
            assert_eq!(ogg_crc(&page), stored_crc, "page CRC must verify");

            pos += page_len;
        }
        header_types
    }

    #[test]
    fn mux_should_produce_valid_ogg_with_magic_bytes() {
        let packets = vec![vec![0xAA; 40]; 3];
        let bytes = packets_to_ogg_opus(&packets, 16000).unwrap();
        assert_eq!(&bytes[..4], b"OggS");
    }

    #[test]
    fn mux_should_mark_only_last_page_end_of_stream() {
        let packets = vec![vec![0xAA; 40]; 5];
        let bytes = packets_to_ogg_opus(&packets, 48000).unwrap();
        let header_types = verify_pages(&bytes);

        // id header, comment header, then one audio page per packet.
        assert_eq!(header_types.len(), 2 + 5);
        assert_eq!(header_types[0] & 0x02, 0x02);
        for t in &header_types[1..header_types.len() - 1] {
            assert_eq!(t & 0x04, 0, "only the last page may carry end-of-stream");
        }
        assert_eq!(header_types[header_types.len() - 1] & 0x04, 0x04);
    }

    #[test]
    fn mux_should_accept_all_supported_sample_rates() {
        for &rate in &SUPPORTED_RATES {
            let packets = vec![vec![0xAA; 10]];
            assert!(packets_to_ogg_opus(&packets, rate).is_ok(), "rate {rate}");
        }
    }

    #[test]
    fn mux_should_reject_unsupported_sample_rate() {
        let err = packets_to_ogg_opus(&[vec![0xAA; 10]], 44100).unwrap_err();
        assert!(matches!(err, MuxError::UnsupportedSampleRate(44100)));
    }

    #[test]
    fn mux_should_handle_empty_packet_list() {
        let bytes = packets_to_ogg_opus(&[], 16000).unwrap();
        let header_types = verify_pages(&bytes);
        assert_eq!(header_types.len(), 2);
    }

    #[test]
    fn mux_should_reject_oversized_packet() {
        let huge = vec![0u8; MAX_SINGLE_PAGE_PACKET + 1];
        let err = packets_to_ogg_opus(&[huge], 16000).unwrap_err();
        assert!(matches!(err, MuxError::PacketTooLarge { .. }));
    }
}
