//! Cassandra Framer (§4.9). Per-channel state: legacy (v3/v4) 9-byte-header
//! framing and v5+ segmented framing with CRC24 (header) / CRC32 (payload),
//! self-contained vs fragmented inner frames, and a swappable compressor.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const LEGACY_HEADER_LEN: usize = 9;
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;
pub const MAX_SEGMENT_PAYLOAD: usize = 128 * 1024;

const SEGMENT_HEADER_LEN: usize = 3;
const SEGMENT_CRC24_LEN: usize = 3;
const SEGMENT_CRC32_LEN: usize = 4;
const SELF_CONTAINED_BIT: u32 = 1 << 18;
const PAYLOAD_LEN_MASK: u32 = 0x3FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid frame: body length {0} exceeds 256 MiB")]
    BodyTooLarge(usize),
    #[error("invalid segment: payload length {0} exceeds 128 KiB")]
    PayloadTooLarge(usize),
    #[error("framing corruption: CRC24 header mismatch")]
    HeaderCrcMismatch,
    #[error("framing corruption: CRC32 payload mismatch")]
    PayloadCrcMismatch,
    #[error("compression error: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Snappy,
}

impl Compression {
    pub fn from_negotiated(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "lz4" => Compression::Lz4,
            "snappy" => Compression::Snappy,
            _ => Compression::None,
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(&lz4_flex::block::compress(data));
                Ok(out)
            }
            Compression::Snappy => Ok(snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| FramingError::Compression(e.to_string()))?),
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => {
                if data.len() < 4 {
                    return Err(FramingError::Compression("lz4 prefix truncated".into()));
                }
                let uncompressed_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                lz4_flex::block::decompress(&data[4..], uncompressed_len)
                    .map_err(|e| FramingError::Compression(e.to_string()))
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| FramingError::Compression(e.to_string())),
        }
    }
}

/// CRC-24/OPENPGP: poly 0x1864CFB, init 0xB704CE, no input/output reflection.
fn crc24(data: &[u8]) -> u32 {
    const POLY: u32 = 0x0186_4CFB;
    let mut crc: u32 = 0x00B7_04CE;
    for &b in data {
        crc ^= (b as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

#[derive(Debug, Clone, Default)]
pub struct CassandraFramer {
    pub modern_framing_read: bool,
    pub modern_framing_write: bool,
    compression: Compression,
    fragment_acc: BytesMut,
}

impl CassandraFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports_modern_framing(version: u8) -> bool {
        version >= 5
    }

    pub fn switch_to_modern_framing_read(&mut self, version: u8) {
        if Self::supports_modern_framing(version) {
            self.modern_framing_read = true;
        }
    }

    pub fn switch_to_modern_framing_write(&mut self, version: u8) {
        if Self::supports_modern_framing(version) {
            self.modern_framing_write = true;
        }
    }

    pub fn update_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Read one legacy (9-byte header) frame. Decompresses the body and
    /// clears the COMPRESSION flag (bit 0) if it was set.
    pub fn read_legacy(&self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        if buf.len() < LEGACY_HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(FramingError::BodyTooLarge(body_len));
        }
        let total = LEGACY_HEADER_LEN + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        let flags = frame[1];
        if flags & 0x01 != 0 && self.compression != Compression::None {
            let decompressed = self.compression.decompress(&frame[LEGACY_HEADER_LEN..])?;
            let mut rebuilt = BytesMut::with_capacity(LEGACY_HEADER_LEN + decompressed.len());
            rebuilt.extend_from_slice(&frame[..LEGACY_HEADER_LEN]);
            rebuilt[1] &= !0x01;
            let new_len = decompressed.len() as u32;
            rebuilt[5..9].copy_from_slice(&new_len.to_be_bytes());
            rebuilt.extend_from_slice(&decompressed);
            frame = rebuilt;
        }
        Ok(Some(frame))
    }

    /// Encode a legacy frame, compressing the body and setting the
    /// COMPRESSION flag if a compressor is active.
    pub fn write_legacy(
        &self,
        version: u8,
        mut flags: u8,
        stream_id: i16,
        opcode: u8,
        body: &[u8],
    ) -> Result<Bytes, FramingError> {
        let body_out = if self.compression != Compression::None {
            flags |= 0x01;
            self.compression.compress(body)?
        } else {
            body.to_vec()
        };
        let mut buf = BytesMut::with_capacity(LEGACY_HEADER_LEN + body_out.len());
        buf.extend_from_slice(&[version, flags]);
        buf.extend_from_slice(&stream_id.to_be_bytes());
        buf.extend_from_slice(&[opcode]);
        buf.extend_from_slice(&(body_out.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body_out);
        Ok(buf.freeze())
    }

    /// Read and validate one v5+ segment, returning zero or more whole
    /// legacy-shaped inner frames. Self-contained segments may carry more
    /// than one inner frame; fragmented segments accumulate across calls.
    pub fn read_modern(&mut self, buf: &mut BytesMut) -> Result<Vec<BytesMut>, FramingError> {
        if buf.len() < SEGMENT_HEADER_LEN + SEGMENT_CRC24_LEN {
            return Ok(Vec::new());
        }
        let header = [buf[0], buf[1], buf[2]];
        let packed = u32::from_le_bytes([header[0], header[1], header[2], 0]);
        let payload_len = (packed & PAYLOAD_LEN_MASK) as usize;
        let self_contained = packed & SELF_CONTAINED_BIT != 0;

        let expected_header_crc =
            u32::from_le_bytes([buf[3], buf[4], buf[5], 0]);
        if crc24(&header) != expected_header_crc {
            return Err(FramingError::HeaderCrcMismatch);
        }
        if payload_len > MAX_SEGMENT_PAYLOAD {
            return Err(FramingError::PayloadTooLarge(payload_len));
        }

        let total = SEGMENT_HEADER_LEN + SEGMENT_CRC24_LEN + payload_len + SEGMENT_CRC32_LEN;
        if buf.len() < total {
            return Ok(Vec::new());
        }

        let segment = buf.split_to(total);
        let payload_start = SEGMENT_HEADER_LEN + SEGMENT_CRC24_LEN;
        let payload = &segment[payload_start..payload_start + payload_len];
        let trailer = &segment[payload_start + payload_len..];
        let expected_payload_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(payload) != expected_payload_crc {
            return Err(FramingError::PayloadCrcMismatch);
        }

        if self_contained {
            Ok(split_inner_frames(payload))
        } else {
            self.fragment_acc.extend_from_slice(payload);
            Ok(drain_complete_fragments(&mut self.fragment_acc))
        }
    }

    /// Wrap a whole legacy-shaped inner frame as one self-contained v5+
    /// segment.
    pub fn write_modern(&self, inner_frame: &[u8]) -> Result<Bytes, FramingError> {
        if inner_frame.len() > MAX_SEGMENT_PAYLOAD {
            return Err(FramingError::PayloadTooLarge(inner_frame.len()));
        }
        let packed = (inner_frame.len() as u32 & PAYLOAD_LEN_MASK) | SELF_CONTAINED_BIT;
        let header_bytes = packed.to_le_bytes();
        let header = [header_bytes[0], header_bytes[1], header_bytes[2]];
        let header_crc = crc24(&header).to_le_bytes();

        let mut buf = BytesMut::with_capacity(
            SEGMENT_HEADER_LEN + SEGMENT_CRC24_LEN + inner_frame.len() + SEGMENT_CRC32_LEN,
        );
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&header_crc[..3]);
        buf.extend_from_slice(inner_frame);
        buf.extend_from_slice(&crc32fast::hash(inner_frame).to_be_bytes());
        Ok(buf.freeze())
    }
}

fn split_inner_frames(mut payload: &[u8]) -> Vec<BytesMut> {
    let mut frames = Vec::new();
    while payload.len() >= LEGACY_HEADER_LEN {
        let body_len = u32::from_be_bytes([payload[5], payload[6], payload[7], payload[8]]) as usize;
        let total = LEGACY_HEADER_LEN + body_len;
        if payload.len() < total {
            break;
        }
        frames.push(BytesMut::from(&payload[..total]));
        payload = &payload[total..];
    }
    frames
}

fn drain_complete_fragments(acc: &mut BytesMut) -> Vec<BytesMut> {
    let mut frames = Vec::new();
    loop {
        if acc.len() < LEGACY_HEADER_LEN {
            break;
        }
        let body_len = u32::from_be_bytes([acc[5], acc[6], acc[7], acc[8]]) as usize;
        let total = LEGACY_HEADER_LEN + body_len;
        if acc.len() < total {
            break;
        }
        frames.push(acc.split_to(total));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn legacy_frame(opcode: u8, body: &[u8]) -> BytesMut {
        let mut f = BytesMut::new();
        f.put_u8(4);
        f.put_u8(0);
        f.put_i16(1);
        f.put_u8(opcode);
        f.put_u32(body.len() as u32);
        f.extend_from_slice(body);
        f
    }

    #[test]
    fn legacy_round_trip_without_compression() {
        let framer = CassandraFramer::new();
        let mut buf = legacy_frame(0x07, b"SELECT 1");
        let frame = framer.read_legacy(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[9..], b"SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn legacy_waits_for_full_frame() {
        let framer = CassandraFramer::new();
        let full = legacy_frame(0x07, b"abcdef");
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert_eq!(framer.read_legacy(&mut partial).unwrap(), None);
    }

    #[test]
    fn modern_framing_requires_version_5() {
        let mut framer = CassandraFramer::new();
        framer.switch_to_modern_framing_read(4);
        assert!(!framer.modern_framing_read);
        framer.switch_to_modern_framing_read(5);
        assert!(framer.modern_framing_read);
    }

    #[test]
    fn modern_self_contained_round_trip() {
        let mut framer = CassandraFramer::new();
        framer.switch_to_modern_framing_read(5);
        let inner = legacy_frame(0x02, &[]);
        let segment = framer.write_modern(&inner).unwrap();
        let mut buf = BytesMut::from(&segment[..]);
        let frames = framer.read_modern(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], inner);
        assert!(buf.is_empty());
    }

    #[test]
    fn modern_header_crc_mismatch_is_detected() {
        let mut framer = CassandraFramer::new();
        let inner = legacy_frame(0x02, &[]);
        let mut segment = BytesMut::from(&framer.write_modern(&inner).unwrap()[..]);
        segment[0] ^= 0xFF;
        let err = framer.read_modern(&mut segment).unwrap_err();
        assert_eq!(err, FramingError::HeaderCrcMismatch);
    }

    #[test]
    fn modern_payload_crc_mismatch_is_detected() {
        let mut framer = CassandraFramer::new();
        let inner = legacy_frame(0x02, &[]);
        let mut segment = BytesMut::from(&framer.write_modern(&inner).unwrap()[..]);
        let last = segment.len() - 1;
        segment[last] ^= 0xFF;
        let err = framer.read_modern(&mut segment).unwrap_err();
        assert_eq!(err, FramingError::PayloadCrcMismatch);
    }

    #[test]
    fn fragmented_segment_reassembles_across_calls() {
        let mut framer = CassandraFramer::new();
        framer.switch_to_modern_framing_read(5);
        let inner = legacy_frame(0x08, b"0123456789");

        let split_at = 6; // inside the inner frame's header
        let (first_half, second_half) = inner.split_at(split_at);

        let packed = (inner.len() as u32 & PAYLOAD_LEN_MASK) as u32; // fragmented, bit 18 unset
        let header_bytes = packed.to_le_bytes();
        let header = [header_bytes[0], header_bytes[1], header_bytes[2]];

        let mut seg1 = BytesMut::new();
        seg1.extend_from_slice(&header);
        seg1.extend_from_slice(&crc24(&header).to_le_bytes()[..3]);
        seg1.extend_from_slice(first_half);
        seg1.extend_from_slice(&crc32fast::hash(first_half).to_be_bytes());

        let mut seg2 = BytesMut::new();
        seg2.extend_from_slice(&header);
        seg2.extend_from_slice(&crc24(&header).to_le_bytes()[..3]);
        seg2.extend_from_slice(second_half);
        seg2.extend_from_slice(&crc32fast::hash(second_half).to_be_bytes());

        // Mismatched header/payload lengths intentionally: this test only
        // exercises the fragment accumulator, not CRC of a shortened payload,
        // so rebuild headers sized to each half instead.
        let mut seg1 = seg1;
        let mut seg2 = seg2;
        {
            let p1 = (first_half.len() as u32) & PAYLOAD_LEN_MASK;
            let h1 = p1.to_le_bytes();
            let h1 = [h1[0], h1[1], h1[2]];
            seg1[0..3].copy_from_slice(&h1);
            seg1[3..6].copy_from_slice(&crc24(&h1).to_le_bytes()[..3]);
        }
        {
            let p2 = (second_half.len() as u32) & PAYLOAD_LEN_MASK;
            let h2 = p2.to_le_bytes();
            let h2 = [h2[0], h2[1], h2[2]];
            seg2[0..3].copy_from_slice(&h2);
            seg2[3..6].copy_from_slice(&crc24(&h2).to_le_bytes()[..3]);
        }

        let mut buf1 = seg1;
        let frames = framer.read_modern(&mut buf1).unwrap();
        assert!(frames.is_empty());

        let mut buf2 = seg2;
        let frames = framer.read_modern(&mut buf2).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], inner);
    }

    #[test]
    fn lz4_compression_round_trips_through_legacy_framing() {
        let mut framer = CassandraFramer::new();
        framer.update_compression(Compression::Lz4);
        let body = b"SELECT * FROM keyspace.table WHERE id = 1";
        let frame = framer.write_legacy(4, 0, 7, 0x07, body).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = framer.read_legacy(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[9..], body);
        assert_eq!(decoded[1] & 0x01, 0); // flag cleared after decompression
    }

    #[test]
    fn snappy_compression_round_trips_through_legacy_framing() {
        let mut framer = CassandraFramer::new();
        framer.update_compression(Compression::Snappy);
        let body = b"SELECT * FROM keyspace.table WHERE id = 1";
        let frame = framer.write_legacy(4, 0, 7, 0x07, body).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = framer.read_legacy(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[9..], body);
    }
}
