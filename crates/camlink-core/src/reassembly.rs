//! Receiver-side frame reassembly.
//!
//! Datagrams arrive in any order, possibly duplicated, possibly never. Each
//! chunk is placed by `chunk_idx` into the buffer of its frame; the frame is
//! complete once every index has been seen. Frames older than the last
//! completed one are dropped (live video favours the newest frame), and at
//! most `max_pending` frames are held at once. A frame buffer is only
//! allocated for headers whose size is within `max_frame_bytes` and
//! reachable with `total_chunks` chunks.

use std::collections::BTreeMap;

use crate::wire::{ChunkHeader, WireError};

/// Largest frame the assembler buffers unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// A fully reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub frame_id: u32,
    pub data: Vec<u8>,
}

/// What happened to one accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Stored; the frame still misses chunks.
    Pending { frame_id: u32, missing: u16 },
    /// Already had this chunk.
    Duplicate,
    /// The chunk belongs to a frame that is already superseded.
    Stale,
    /// The frame is now complete.
    Complete(CompletedFrame),
}

#[derive(Debug)]
struct PartialFrame {
    total_size: u32,
    total_chunks: u16,
    /// Payload size of every chunk except the last, learned from the
    /// first non-final chunk seen, or from the final chunk when the frame
    /// has a single chunk.
    stride: Option<usize>,
    data: Vec<u8>,
    /// Chunks whose offset is not known yet (final chunk seen before any
    /// other chunk).
    deferred_last: Option<Vec<u8>>,
    received: Vec<bool>,
    missing: u16,
}

impl PartialFrame {
    fn new(header: &ChunkHeader) -> Self {
        Self {
            total_size: header.total_size(),
            total_chunks: header.total_chunks(),
            stride: None,
            data: vec![0u8; header.total_size() as usize],
            deferred_last: None,
            received: vec![false; header.total_chunks() as usize],
            missing: header.total_chunks(),
        }
    }

    fn matches(&self, header: &ChunkHeader) -> bool {
        self.total_size == header.total_size() && self.total_chunks == header.total_chunks()
    }

    fn insert(&mut self, header: &ChunkHeader, payload: &[u8]) -> Result<bool, ReassemblyError> {
        let idx = header.chunk_idx() as usize;
        if self.received[idx] {
            return Ok(false);
        }
        let is_last = idx + 1 == self.total_chunks as usize;

        if !is_last {
            match self.stride {
                None => self.learn_stride(payload.len())?,
                Some(stride) if stride != payload.len() => {
                    return Err(ReassemblyError::InconsistentChunk {
                        frame_id: header.frame_id(),
                        chunk_idx: header.chunk_idx(),
                    })
                }
                Some(_) => {}
            }
        } else if self.total_chunks == 1 {
            if payload.len() != self.total_size as usize {
                return Err(ReassemblyError::InconsistentChunk {
                    frame_id: header.frame_id(),
                    chunk_idx: header.chunk_idx(),
                });
            }
            self.stride = Some(payload.len());
        } else if self.stride.is_none() {
            self.deferred_last = Some(payload.to_vec());
            self.received[idx] = true;
            self.missing -= 1;
            return Ok(true);
        }

        self.place(idx, payload, header)?;
        self.received[idx] = true;
        self.missing -= 1;
        Ok(true)
    }

    fn learn_stride(&mut self, stride: usize) -> Result<(), ReassemblyError> {
        self.stride = Some(stride);
        if let Some(last) = self.deferred_last.take() {
            let idx = self.total_chunks as usize - 1;
            let start = idx * stride;
            if start + last.len() != self.total_size as usize {
                return Err(ReassemblyError::OffsetOutOfBounds {
                    offset: start,
                    len: last.len(),
                    total: self.total_size,
                });
            }
            self.data[start..].copy_from_slice(&last);
        }
        Ok(())
    }

    fn place(
        &mut self,
        idx: usize,
        payload: &[u8],
        header: &ChunkHeader,
    ) -> Result<(), ReassemblyError> {
        let stride = self.stride.unwrap_or(payload.len());
        let start = idx * stride;
        let end = start + payload.len();
        let is_last = idx + 1 == self.total_chunks as usize;
        if end > self.data.len() || (is_last && end != self.data.len()) {
            return Err(ReassemblyError::OffsetOutOfBounds {
                offset: start,
                len: payload.len(),
                total: header.total_size(),
            });
        }
        self.data[start..end].copy_from_slice(payload);
        Ok(())
    }
}

/// Reassembles frames from one sender.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: BTreeMap<u32, PartialFrame>,
    max_pending: usize,
    max_frame_bytes: usize,
    last_completed: Option<u32>,
}

impl FrameAssembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            last_completed: None,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Reject sizes that could not be sent or that we refuse to buffer.
    fn check_size(&self, header: &ChunkHeader) -> Result<(), ReassemblyError> {
        let total = header.total_size() as usize;
        if total > self.max_frame_bytes {
            return Err(ReassemblyError::FrameTooLarge {
                frame_id: header.frame_id(),
                total_size: header.total_size(),
                limit: self.max_frame_bytes,
            });
        }
        if total > header.total_chunks() as usize * u16::MAX as usize {
            return Err(ReassemblyError::UnreachableSize {
                frame_id: header.frame_id(),
                total_size: header.total_size(),
                total_chunks: header.total_chunks(),
            });
        }
        Ok(())
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn last_completed(&self) -> Option<u32> {
        self.last_completed
    }

    /// Feed one decoded chunk.
    pub fn accept(
        &mut self,
        header: &ChunkHeader,
        payload: &[u8],
    ) -> Result<Accepted, ReassemblyError> {
        header.validate()?;
        if payload.len() != header.payload_len() as usize {
            return Err(ReassemblyError::Wire(WireError::LengthMismatch {
                header: header.payload_len(),
                actual: payload.len(),
            }));
        }

        let frame_id = header.frame_id();
        if let Some(done) = self.last_completed {
            // A sender restart resets frame ids; a large backwards jump is
            // treated as a new stream rather than as stale data.
            if frame_id <= done && done - frame_id < RESTART_GAP {
                return Ok(Accepted::Stale);
            }
            if frame_id <= done {
                tracing::debug!(frame_id, last = done, "frame id reset, new stream");
                self.pending.clear();
                self.last_completed = None;
            }
        }

        if !self.pending.contains_key(&frame_id) {
            self.check_size(header)?;
            while self.pending.len() >= self.max_pending {
                if let Some((&oldest, _)) = self.pending.iter().next() {
                    tracing::debug!(frame_id = oldest, "evicting incomplete frame");
                    self.pending.remove(&oldest);
                }
            }
            self.pending.insert(frame_id, PartialFrame::new(header));
        }

        let frame = self
            .pending
            .get_mut(&frame_id)
            .ok_or(ReassemblyError::UnknownFrame(frame_id))?;

        if !frame.matches(header) {
            return Err(ReassemblyError::InconsistentChunk {
                frame_id,
                chunk_idx: header.chunk_idx(),
            });
        }

        if !frame.insert(header, payload)? {
            return Ok(Accepted::Duplicate);
        }

        if frame.missing > 0 {
            return Ok(Accepted::Pending {
                frame_id,
                missing: frame.missing,
            });
        }

        let frame = self
            .pending
            .remove(&frame_id)
            .ok_or(ReassemblyError::UnknownFrame(frame_id))?;
        // Anything older than the completed frame can never be shown.
        self.pending.retain(|&id, _| id > frame_id);
        self.last_completed = Some(frame_id);
        Ok(Accepted::Complete(CompletedFrame {
            frame_id,
            data: frame.data,
        }))
    }
}

/// Backwards jump in frame id beyond which the sender is assumed to have
/// restarted.
const RESTART_GAP: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("chunk {chunk_idx} of frame {frame_id} disagrees with earlier chunks")]
    InconsistentChunk { frame_id: u32, chunk_idx: u16 },

    #[error("chunk at offset {offset} (+{len}) does not fit a {total}-byte frame")]
    OffsetOutOfBounds { offset: usize, len: usize, total: u32 },

    #[error("frame {0} is not pending")]
    UnknownFrame(u32),

    #[error("frame {frame_id} claims {total_size} bytes, limit is {limit}")]
    FrameTooLarge {
        frame_id: u32,
        total_size: u32,
        limit: usize,
    },

    #[error("frame {frame_id} claims {total_size} bytes in only {total_chunks} chunks")]
    UnreachableSize {
        frame_id: u32,
        total_size: u32,
        total_chunks: u16,
    },
}
