//! Multipart MJPEG wire format.
//!
//! A stream is the fixed `STREAM_HEADER` followed by one envelope per frame:
//! a part header, the frame bytes and `PART_TRAILER`. Frame bytes are never
//! copied; an envelope is a list of `Chunk`s that either point into the
//! capture buffer or at static data.
//!
//! Many UVC cameras emit "MJPEG" frames without Huffman tables, relying on the
//! decoder to assume the standard ones. Browsers don't, so an envelope can
//! splice the standard DHT segment in front of the frame header.

use anyhow::{bail, Result};
use std::ops::Range;
use std::sync::OnceLock;

use crate::capture::FrameTimestamp;

pub const BOUNDARY: &str = "BoundaryDoNotCross";

pub const STREAM_HEADER: &[u8] = concat!(
    "HTTP/1.0 200 OK\r\n",
    "Connection: close\r\n",
    "Server: uvc-streamer/0.3\r\n",
    "Content-Type: multipart/x-mixed-replace; boundary=BoundaryDoNotCross\r\n",
    "Cache-Control: no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0\r\n",
    "Pragma: no-cache\r\n",
    "Expires: Thu, 1 Jan 1970 00:00:01 GMT\r\n",
    "\r\n",
    "--BoundaryDoNotCross\r\n",
)
.as_bytes();

pub const PART_TRAILER: &[u8] = b"\r\n--BoundaryDoNotCross\r\n";

/// One contiguous piece of an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    /// The frame's rendered part header.
    PartHeader,
    /// Byte range of the capture buffer.
    Frame(Range<usize>),
    Static(&'static [u8]),
    Trailer,
}

/// Wire layout of one frame.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub part_header: Vec<u8>,
    pub chunks: Vec<Chunk>,
    /// Sum of the payload chunk lengths, as announced in `Content-Length`.
    pub content_length: usize,
}

impl Envelope {
    pub fn build(data: &[u8], timestamp: FrameTimestamp, insert_huffman: bool) -> Result<Self> {
        let payload = payload_chunks(data, insert_huffman);
        let content_length = payload.iter().map(chunk_len).sum();
        let part_header = render_part_header(content_length, timestamp)?;

        let mut chunks = Vec::with_capacity(payload.len() + 2);
        chunks.push(Chunk::PartHeader);
        chunks.extend(payload);
        chunks.push(Chunk::Trailer);

        Ok(Self {
            part_header,
            chunks,
            content_length,
        })
    }

    /// Total bytes this envelope puts on the wire.
    pub fn wire_len(&self) -> usize {
        self.part_header.len() + self.content_length + PART_TRAILER.len()
    }
}

fn chunk_len(chunk: &Chunk) -> usize {
    match chunk {
        Chunk::Frame(range) => range.len(),
        Chunk::Static(bytes) => bytes.len(),
        Chunk::PartHeader | Chunk::Trailer => 0,
    }
}

/// Renders the per-frame part header.
///
/// Fails for timestamps that cannot be written as `<sec>.<usec>`.
pub fn render_part_header(content_length: usize, timestamp: FrameTimestamp) -> Result<Vec<u8>> {
    if timestamp.secs < 0 || !(0..1_000_000).contains(&timestamp.micros) {
        bail!(
            "unrepresentable capture timestamp {}s {}us",
            timestamp.secs,
            timestamp.micros
        );
    }
    Ok(format!(
        "Content-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {}\r\n\r\n",
        content_length, timestamp
    )
    .into_bytes())
}

/// Splits a frame into payload chunks, inserting the standard Huffman
/// tables when the frame is a JPEG that lacks them.
pub fn payload_chunks(data: &[u8], insert_huffman: bool) -> Vec<Chunk> {
    if data.is_empty() {
        return Vec::new();
    }
    let whole = vec![Chunk::Frame(0..data.len())];
    if !insert_huffman {
        return whole;
    }
    match huffman_insert_point(data) {
        Some(at) => vec![
            Chunk::Frame(0..at),
            Chunk::Static(dht_segment()),
            Chunk::Frame(at..data.len()),
        ],
        None => whole,
    }
}

/// Offset at which a DHT segment must be inserted, or `None` if the frame
/// already carries tables or is not a well-formed JPEG header.
fn huffman_insert_point(data: &[u8]) -> Option<usize> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }
    let mut frame_header = None;
    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xC4 => return None,
            0xDA => return Some(frame_header.unwrap_or(pos)),
            0xC0..=0xC3 => {
                frame_header.get_or_insert(pos);
            }
            _ => {}
        }
        if pos + 3 >= data.len() {
            return None;
        }
        let segment = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        pos += 2 + segment;
    }
    None
}

const DC_LUMA_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const DC_CHROMA_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const DC_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const AC_LUMA_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
const AC_LUMA_VALUES: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61,
    0x07, 0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52,
    0xd1, 0xf0, 0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25,
    0x26, 0x27, 0x28, 0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45,
    0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64,
    0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83,
    0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99,
    0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3,
    0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8,
    0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
];

const AC_CHROMA_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
const AC_CHROMA_VALUES: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61,
    0x71, 0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33,
    0x52, 0xf0, 0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18,
    0x19, 0x1a, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44,
    0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63,
    0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
    0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97,
    0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca,
    0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
    0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
];

/// Standard JPEG Huffman tables (ITU T.81 Annex K.3) as one DHT segment.
pub fn dht_segment() -> &'static [u8] {
    static SEGMENT: OnceLock<Vec<u8>> = OnceLock::new();
    SEGMENT.get_or_init(|| {
        let tables: [(u8, &[u8; 16], &[u8]); 4] = [
            (0x00, &DC_LUMA_BITS, &DC_VALUES),
            (0x10, &AC_LUMA_BITS, &AC_LUMA_VALUES),
            (0x01, &DC_CHROMA_BITS, &DC_VALUES),
            (0x11, &AC_CHROMA_BITS, &AC_CHROMA_VALUES),
        ];
        let body: usize = tables.iter().map(|(_, bits, values)| 1 + bits.len() + values.len()).sum();
        let mut segment = Vec::with_capacity(4 + body);
        segment.extend_from_slice(&[0xFF, 0xC4]);
        segment.extend_from_slice(&((body + 2) as u16).to_be_bytes());
        for (class_id, bits, values) in tables {
            segment.push(class_id);
            segment.extend_from_slice(bits);
            segment.extend_from_slice(values);
        }
        segment
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI, DQT, SOF0, SOS, two bytes of scan data, EOI.
    fn jpeg_without_tables() -> Vec<u8> {
        vec![
            0xFF, 0xD8, // SOI
            0xFF, 0xDB, 0x00, 0x04, 0x00, 0x01, // DQT
            0xFF, 0xC0, 0x00, 0x05, 0x08, 0x00, 0x10, // SOF0
            0xFF, 0xDA, 0x00, 0x03, 0x01, // SOS
            0x12, 0x34, // scan
            0xFF, 0xD9, // EOI
        ]
    }

    #[test]
    fn stream_header_is_fixed() {
        let header = std::str::from_utf8(STREAM_HEADER).unwrap();
        assert!(header.starts_with("HTTP/1.0 200 OK\r\nConnection: close\r\n"));
        assert!(header.contains("multipart/x-mixed-replace; boundary=BoundaryDoNotCross\r\n"));
        assert!(header.ends_with("\r\n\r\n--BoundaryDoNotCross\r\n"));
        assert!(header.contains(BOUNDARY));
    }

    #[test]
    fn part_header_formats_timestamp_with_six_digit_micros() {
        let header = render_part_header(1234, FrameTimestamp::new(42, 7)).unwrap();
        assert_eq!(
            header,
            b"Content-Type: image/jpeg\r\nContent-Length: 1234\r\nX-Timestamp: 42.000007\r\n\r\n"
                .to_vec()
        );
    }

    #[test]
    fn malformed_timestamp_fails_envelope() {
        assert!(render_part_header(1, FrameTimestamp::new(1, 1_000_000)).is_err());
        assert!(render_part_header(1, FrameTimestamp::new(-1, 0)).is_err());
        assert!(Envelope::build(b"abc", FrameTimestamp::new(0, -5), true).is_err());
    }

    #[test]
    fn dht_segment_is_well_formed() {
        let segment = dht_segment();
        assert_eq!(segment.len(), 420);
        assert_eq!(&segment[..4], &[0xFF, 0xC4, 0x01, 0xA2]);
        let counted: usize = DC_LUMA_BITS.iter().map(|&b| b as usize).sum();
        assert_eq!(counted, DC_VALUES.len());
        assert_eq!(AC_LUMA_BITS.iter().map(|&b| b as usize).sum::<usize>(), 162);
        assert_eq!(AC_CHROMA_BITS.iter().map(|&b| b as usize).sum::<usize>(), 162);
    }

    #[test]
    fn tables_are_spliced_before_frame_header() {
        let data = jpeg_without_tables();
        let chunks = payload_chunks(&data, true);
        assert_eq!(
            chunks,
            vec![
                Chunk::Frame(0..8),
                Chunk::Static(dht_segment()),
                Chunk::Frame(8..data.len()),
            ]
        );
        let envelope = Envelope::build(&data, FrameTimestamp::new(1, 0), true).unwrap();
        assert_eq!(envelope.content_length, data.len() + 420);
        assert_eq!(envelope.chunks.first(), Some(&Chunk::PartHeader));
        assert_eq!(envelope.chunks.last(), Some(&Chunk::Trailer));
    }

    #[test]
    fn frames_with_tables_or_non_jpeg_pass_through() {
        let mut with_tables = jpeg_without_tables();
        with_tables.splice(2..2, [0xFF, 0xC4, 0x00, 0x02]);
        assert_eq!(payload_chunks(&with_tables, true), vec![Chunk::Frame(0..with_tables.len())]);

        let opaque = b"not a jpeg at all";
        assert_eq!(payload_chunks(opaque, true), vec![Chunk::Frame(0..opaque.len())]);
        assert!(payload_chunks(&[], true).is_empty());

        let data = jpeg_without_tables();
        assert_eq!(payload_chunks(&data, false), vec![Chunk::Frame(0..data.len())]);
    }

    #[test]
    fn envelope_wire_length_adds_header_and_trailer() {
        let envelope = Envelope::build(b"frame", FrameTimestamp::new(3, 500_000), false).unwrap();
        assert_eq!(envelope.content_length, 5);
        assert_eq!(
            envelope.wire_len(),
            envelope.part_header.len() + 5 + PART_TRAILER.len()
        );
    }
}
