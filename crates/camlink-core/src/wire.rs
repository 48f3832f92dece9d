//! Stream wire format: the chunk header that precedes every datagram.
//!
//! A captured frame is split into fixed-size chunks; each chunk travels in
//! its own datagram, prefixed by this header. All multi-byte fields are in
//! network byte order. The receiver reassembles by `chunk_idx` and knows a
//! frame is complete once `total_chunks` distinct chunks have arrived.
//!
//! The header carries no integrity field. Loss is tolerated, corruption is
//! left to the datagram checksum of the underlying transport.

use std::ops::Range;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Identifies a datagram as a stream chunk.
pub const CHUNK_MAGIC: u32 = 0xABCD_EF01;

/// Header size in bytes.
pub const HEADER_LEN: usize = 18;

/// Default payload bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 768;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

// ── Chunk Header ──────────────────────────────────────────────────────────────

/// On-wire chunk header.
///
/// Wire size: 18 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChunkHeader {
    /// Always `CHUNK_MAGIC`.
    magic: U32<NetworkEndian>,
    /// Monotonically increasing frame counter.
    frame_id: U32<NetworkEndian>,
    /// Full frame length in bytes.
    total_size: U32<NetworkEndian>,
    /// Zero-based index of this chunk.
    chunk_idx: U16<NetworkEndian>,
    /// Chunk count for this frame.
    total_chunks: U16<NetworkEndian>,
    /// Frame bytes following this header.
    payload_len: U16<NetworkEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; HEADER_LEN]);

impl ChunkHeader {
    pub fn new(
        frame_id: u32,
        total_size: u32,
        chunk_idx: u16,
        total_chunks: u16,
        payload_len: u16,
    ) -> Self {
        Self {
            magic: U32::new(CHUNK_MAGIC),
            frame_id: U32::new(frame_id),
            total_size: U32::new(total_size),
            chunk_idx: U16::new(chunk_idx),
            total_chunks: U16::new(total_chunks),
            payload_len: U16::new(payload_len),
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic.get()
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id.get()
    }

    pub fn total_size(&self) -> u32 {
        self.total_size.get()
    }

    pub fn chunk_idx(&self) -> u16 {
        self.chunk_idx.get()
    }

    pub fn total_chunks(&self) -> u16 {
        self.total_chunks.get()
    }

    pub fn payload_len(&self) -> u16 {
        self.payload_len.get()
    }

    /// Structural checks that need no knowledge of the chunk size.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic() != CHUNK_MAGIC {
            return Err(WireError::BadMagic(self.magic()));
        }
        if self.total_chunks() == 0 || self.chunk_idx() >= self.total_chunks() {
            return Err(WireError::IndexOutOfRange {
                idx: self.chunk_idx(),
                total: self.total_chunks(),
            });
        }
        if u32::from(self.payload_len()) > self.total_size() {
            return Err(WireError::PayloadExceedsFrame {
                payload_len: self.payload_len(),
                total_size: self.total_size(),
            });
        }
        Ok(())
    }
}

/// Split a datagram into its header and payload slice.
pub fn decode_chunk(datagram: &[u8]) -> Result<(ChunkHeader, &[u8]), WireError> {
    let header = ChunkHeader::read_from_prefix(datagram).ok_or(WireError::Truncated {
        needed: HEADER_LEN,
        got: datagram.len(),
    })?;
    header.validate()?;
    let body = &datagram[HEADER_LEN..];
    let len = header.payload_len() as usize;
    if body.len() < len {
        return Err(WireError::Truncated {
            needed: HEADER_LEN + len,
            got: datagram.len(),
        });
    }
    Ok((header, &body[..len]))
}

// ── Chunk planning ────────────────────────────────────────────────────────────

/// Number of chunks needed for a frame: `ceil(total_size / chunk_size)`.
pub fn chunk_count(total_size: usize, chunk_size: usize) -> Result<u16, WireError> {
    if chunk_size == 0 || chunk_size > u16::MAX as usize {
        return Err(WireError::BadChunkSize(chunk_size));
    }
    if total_size == 0 {
        return Err(WireError::EmptyFrame);
    }
    if total_size > u32::MAX as usize {
        return Err(WireError::FrameTooLarge(total_size));
    }
    let count = total_size.div_ceil(chunk_size);
    u16::try_from(count).map_err(|_| WireError::FrameTooLarge(total_size))
}

/// Byte range of one chunk within the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub idx: u16,
    pub range: Range<usize>,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// The chunks of one frame, in index order.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_size: usize,
    chunk_size: usize,
    total_chunks: u16,
}

impl ChunkPlan {
    pub fn new(total_size: usize, chunk_size: usize) -> Result<Self, WireError> {
        let total_chunks = chunk_count(total_size, chunk_size)?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_chunks(&self) -> u16 {
        self.total_chunks
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn span(&self, idx: u16) -> Option<ChunkSpan> {
        if idx >= self.total_chunks {
            return None;
        }
        let start = idx as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(ChunkSpan {
            idx,
            range: start..end,
        })
    }

    pub fn spans(&self) -> impl Iterator<Item = ChunkSpan> + '_ {
        (0..self.total_chunks).filter_map(move |idx| self.span(idx))
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Reusable datagram buffer sized for one header plus one full chunk.
///
/// Allocated once per stream and reused for every chunk of every frame.
#[derive(Debug)]
pub struct ChunkEncoder {
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChunkEncoder {
    pub fn new(chunk_size: usize) -> Result<Self, WireError> {
        if chunk_size == 0 || chunk_size > u16::MAX as usize || HEADER_LEN + chunk_size > MAX_DATAGRAM
        {
            return Err(WireError::BadChunkSize(chunk_size));
        }
        Ok(Self {
            buf: Vec::with_capacity(HEADER_LEN + chunk_size),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write header + payload into the buffer and return the datagram.
    pub fn encode(&mut self, header: &ChunkHeader, payload: &[u8]) -> Result<&[u8], WireError> {
        if payload.len() > self.chunk_size {
            return Err(WireError::PayloadTooLarge {
                len: payload.len(),
                max: self.chunk_size,
            });
        }
        if payload.len() != header.payload_len() as usize {
            return Err(WireError::LengthMismatch {
                header: header.payload_len(),
                actual: payload.len(),
            });
        }
        self.buf.clear();
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(payload);
        Ok(&self.buf)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or interpreting chunk datagrams.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("chunk index {idx} out of range for {total} chunks")]
    IndexOutOfRange { idx: u16, total: u16 },

    #[error("payload length {payload_len} exceeds frame size {total_size}")]
    PayloadExceedsFrame { payload_len: u16, total_size: u32 },

    #[error("payload of {len} bytes exceeds chunk size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("header says {header} payload bytes, buffer holds {actual}")]
    LengthMismatch { header: u16, actual: usize },

    #[error("invalid chunk size {0}")]
    BadChunkSize(usize),

    #[error("frame is empty")]
    EmptyFrame,

    #[error("frame of {0} bytes cannot be addressed by the header")]
    FrameTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_network_order() {
        let header = ChunkHeader::new(0x0102_0304, 2000, 1, 3, 768);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &[0xAB, 0xCD, 0xEF, 0x01]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..12], &2000u32.to_be_bytes());
        assert_eq!(&bytes[12..14], &1u16.to_be_bytes());
        assert_eq!(&bytes[14..16], &3u16.to_be_bytes());
        assert_eq!(&bytes[16..18], &768u16.to_be_bytes());
    }

    #[test]
    fn two_thousand_bytes_in_768_byte_chunks() {
        let plan = ChunkPlan::new(2000, 768).unwrap();
        assert_eq!(plan.total_chunks(), 3);
        let lens: Vec<usize> = plan.spans().map(|s| s.len()).collect();
        assert_eq!(lens, vec![768, 768, 464]);
    }

    #[test]
    fn chunk_count_matches_ceiling_division() {
        for total in [1usize, 2, 767, 768, 769, 1535, 1536, 1537, 50_000] {
            for size in [1usize, 7, 250, 768, 1400] {
                if total.div_ceil(size) > u16::MAX as usize {
                    continue;
                }
                let plan = ChunkPlan::new(total, size).unwrap();
                let n = plan.total_chunks() as usize;
                assert_eq!(n, total.div_ceil(size));
                let spans: Vec<ChunkSpan> = plan.spans().collect();
                assert_eq!(spans.len(), n);
                for (i, span) in spans.iter().enumerate() {
                    assert_eq!(span.idx as usize, i);
                }
                let last = spans.last().unwrap();
                assert_eq!(last.len(), total - (n - 1) * size);
                assert_eq!(last.range.end, total);
            }
        }
    }

    #[test]
    fn planning_rejects_degenerate_input() {
        assert_eq!(chunk_count(0, 768), Err(WireError::EmptyFrame));
        assert_eq!(chunk_count(10, 0), Err(WireError::BadChunkSize(0)));
        assert!(matches!(
            chunk_count(70_000 * 2, 1),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn encoder_reuses_its_buffer() {
        let mut enc = ChunkEncoder::new(768).unwrap();
        let cap = enc.buf.capacity();
        for idx in 0..3u16 {
            let payload = vec![idx as u8; 100];
            let header = ChunkHeader::new(9, 300, idx, 3, 100);
            let datagram = enc.encode(&header, &payload).unwrap();
            assert_eq!(datagram.len(), HEADER_LEN + 100);
        }
        assert_eq!(enc.buf.capacity(), cap);
    }

    #[test]
    fn encoder_bounds_checks_payload() {
        let mut enc = ChunkEncoder::new(4).unwrap();
        let header = ChunkHeader::new(1, 10, 0, 3, 5);
        assert!(matches!(
            enc.encode(&header, &[0u8; 5]),
            Err(WireError::PayloadTooLarge { .. })
        ));
        let header = ChunkHeader::new(1, 10, 0, 3, 4);
        assert!(matches!(
            enc.encode(&header, &[0u8; 3]),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_recovers_header_and_payload() {
        let mut enc = ChunkEncoder::new(768).unwrap();
        let header = ChunkHeader::new(42, 2000, 2, 3, 464);
        let payload = vec![7u8; 464];
        let datagram = enc.encode(&header, &payload).unwrap().to_vec();
        let (h, p) = decode_chunk(&datagram).unwrap();
        assert_eq!(h.frame_id(), 42);
        assert_eq!(h.total_size(), 2000);
        assert_eq!(h.chunk_idx(), 2);
        assert_eq!(h.total_chunks(), 3);
        assert_eq!(p, &payload[..]);
    }

    #[test]
    fn decode_rejects_bad_datagrams() {
        assert!(matches!(
            decode_chunk(&[0u8; 5]),
            Err(WireError::Truncated { .. })
        ));

        let mut bad_magic = ChunkHeader::new(1, 10, 0, 1, 10).as_bytes().to_vec();
        bad_magic[0] = 0;
        bad_magic.extend_from_slice(&[0u8; 10]);
        assert!(matches!(decode_chunk(&bad_magic), Err(WireError::BadMagic(_))));

        let out_of_range = ChunkHeader::new(1, 10, 3, 3, 1).as_bytes().to_vec();
        assert!(matches!(
            decode_chunk(&out_of_range),
            Err(WireError::IndexOutOfRange { .. })
        ));

        let short_payload = ChunkHeader::new(1, 10, 0, 1, 10).as_bytes().to_vec();
        assert!(matches!(
            decode_chunk(&short_payload),
            Err(WireError::Truncated { .. })
        ));
    }
}
