//! Chunked frame transport.
//!
//! A captured frame is cut into fixed-size chunks, each sent as one datagram
//! behind a `ChunkHeader`. Chunks are offered strictly in index order; the
//! receiver reassembles by index. Sends that hit a full socket buffer are
//! retried with exponential backoff; an unreachable destination abandons the
//! rest of the frame. Frames are never retried as a whole.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use camlink_core::config::StreamConfig;
use camlink_core::wire::{ChunkEncoder, ChunkHeader, ChunkPlan, WireError};

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Camera capture contract.
pub trait FrameSource: Send {
    /// Grab one JPEG frame. `None` when the sensor has nothing.
    fn capture(&mut self) -> Option<Bytes>;

    /// Hand a frame back once its transmission attempt is over.
    fn release(&mut self, frame: Bytes);

    fn set_quality(&mut self, quality: u8);
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera source {0} unavailable: {1}")]
    Unavailable(PathBuf, io::Error),
    #[error("camera source {0} holds no frames")]
    Empty(PathBuf),
}

/// How one datagram send failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Outbound buffer full; worth retrying shortly.
    #[error("send buffer full")]
    WouldBlock,
    /// Destination gone for now.
    #[error("destination unreachable: {0}")]
    Unreachable(io::Error),
    #[error("send failed: {0}")]
    Failed(io::Error),
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            return SendError::WouldBlock;
        }
        if e.kind() == io::ErrorKind::ConnectionRefused {
            return SendError::Unreachable(e);
        }
        match e.raw_os_error() {
            Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => SendError::Unreachable(e),
            Some(libc::ENOBUFS) => SendError::WouldBlock,
            _ => SendError::Failed(e),
        }
    }
}

/// Non-blocking datagram send.
pub trait DatagramSink: Send + Sync {
    fn try_send(&self, datagram: &[u8]) -> Result<usize, SendError>;
}

/// Datagram sink over a UDP socket with a fixed destination.
pub struct UdpSink {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: UdpSocket, dest: SocketAddr) -> Self {
        Self { socket, dest }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}

impl DatagramSink for UdpSink {
    fn try_send(&self, datagram: &[u8]) -> Result<usize, SendError> {
        self.socket
            .try_send_to(datagram, self.dest)
            .map_err(SendError::from)
    }
}

// ── Sending ───────────────────────────────────────────────────────────────────

/// One captured frame, owned by the stream loop.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: Bytes,
    pub frame_id: u32,
    pub captured_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Retries after the first attempt for a would-block send.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub pace_every: u16,
    pub pace_delay: Duration,
    pub yield_every: u16,
}

impl From<&StreamConfig> for SendPolicy {
    fn from(c: &StreamConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            pace_every: c.pace_every,
            pace_delay: Duration::from_millis(c.pace_delay_ms),
            yield_every: c.yield_every,
        }
    }
}

impl SendPolicy {
    /// Delay before retry number `retry` (1-based): base, 2·base, 4·base...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Outcome of one frame's transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame_id: u32,
    pub total_size: usize,
    pub total_chunks: u16,
    /// Chunks the socket accepted.
    pub chunks_sent: u16,
    /// Chunks attempted and permanently lost.
    pub chunks_lost: u16,
    /// True if an unreachable destination cut the frame short.
    pub aborted: bool,
    pub bytes_sent: usize,
    pub retries: u32,
}

impl FrameReport {
    fn empty(frame_id: u32, total_size: usize) -> Self {
        Self {
            frame_id,
            total_size,
            total_chunks: 0,
            chunks_sent: 0,
            chunks_lost: 0,
            aborted: false,
            bytes_sent: 0,
            retries: 0,
        }
    }

    /// Chunks that did not go out, attempted or not.
    pub fn chunks_failed(&self) -> u16 {
        self.total_chunks - self.chunks_sent
    }

    pub fn delivered(&self) -> bool {
        frame_delivered(self.chunks_sent, self.total_chunks)
    }
}

/// A frame counts as delivered when strictly more than three quarters of
/// its chunks went out.
pub fn frame_delivered(chunks_ok: u16, total_chunks: u16) -> bool {
    total_chunks > 0 && u32::from(chunks_ok) * 4 > u32::from(total_chunks) * 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Sent { bytes: usize, retries: u32 },
    Lost { retries: u32 },
    Unreachable,
}

/// Fragments frames and pushes the chunks through a sink.
///
/// Holds the one datagram buffer reused for every chunk.
pub struct ChunkSender {
    encoder: ChunkEncoder,
    policy: SendPolicy,
}

impl ChunkSender {
    pub fn new(chunk_size: usize, policy: SendPolicy) -> Result<Self, WireError> {
        Ok(Self {
            encoder: ChunkEncoder::new(chunk_size)?,
            policy,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.encoder.chunk_size()
    }

    pub async fn send_frame(&mut self, sink: &dyn DatagramSink, frame: &FrameBuffer) -> FrameReport {
        let frame_id = frame.frame_id;
        let total_size = frame.data.len();
        let mut report = FrameReport::empty(frame_id, total_size);

        let plan = match ChunkPlan::new(total_size, self.encoder.chunk_size()) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(frame_id, total_size, error = %e, "frame cannot be chunked");
                return report;
            }
        };
        report.total_chunks = plan.total_chunks();
        tracing::debug!(frame_id, total_size, chunks = report.total_chunks, "sending frame");

        let policy = &self.policy;
        for span in plan.spans() {
            let idx = span.idx;
            let header = ChunkHeader::new(
                frame_id,
                total_size as u32,
                idx,
                report.total_chunks,
                span.len() as u16,
            );
            let outcome = match self.encoder.encode(&header, &frame.data[span.range]) {
                Ok(datagram) => send_with_retry(sink, datagram, policy, frame_id, idx).await,
                Err(e) => {
                    tracing::warn!(frame_id, chunk_idx = idx, error = %e, "chunk encode failed");
                    ChunkOutcome::Lost { retries: 0 }
                }
            };

            match outcome {
                ChunkOutcome::Sent { bytes, retries } => {
                    report.chunks_sent += 1;
                    report.bytes_sent += bytes;
                    report.retries += retries;
                }
                ChunkOutcome::Lost { retries } => {
                    report.chunks_lost += 1;
                    report.retries += retries;
                }
                ChunkOutcome::Unreachable => {
                    report.chunks_lost += 1;
                    report.aborted = true;
                    break;
                }
            }

            if policy.pace_every > 0 && idx > 0 && idx % policy.pace_every == 0 {
                let delay = if report.chunks_lost > idx / 4 {
                    policy.pace_delay * 2
                } else {
                    policy.pace_delay
                };
                tokio::time::sleep(delay).await;
            }
            if policy.yield_every > 0 && idx % policy.yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }

        if report.chunks_failed() > 0 {
            tracing::warn!(
                frame_id,
                sent = report.chunks_sent,
                total = report.total_chunks,
                aborted = report.aborted,
                "frame degraded"
            );
        } else {
            tracing::trace!(frame_id, chunks = report.chunks_sent, "frame sent");
        }
        report
    }
}

async fn send_with_retry(
    sink: &dyn DatagramSink,
    datagram: &[u8],
    policy: &SendPolicy,
    frame_id: u32,
    chunk_idx: u16,
) -> ChunkOutcome {
    let mut retry = 0;
    loop {
        match sink.try_send(datagram) {
            Ok(bytes) => {
                if retry > 0 {
                    tracing::debug!(frame_id, chunk_idx, retry, "chunk sent after retry");
                }
                return ChunkOutcome::Sent {
                    bytes,
                    retries: retry,
                };
            }
            Err(SendError::WouldBlock) => {
                retry += 1;
                if retry > policy.max_retries {
                    tracing::debug!(frame_id, chunk_idx, "chunk dropped, send buffer stayed full");
                    return ChunkOutcome::Lost {
                        retries: retry - 1,
                    };
                }
                tokio::time::sleep(policy.backoff(retry)).await;
            }
            Err(SendError::Unreachable(e)) => {
                tracing::error!(frame_id, chunk_idx, error = %e, "destination unreachable, abandoning frame");
                return ChunkOutcome::Unreachable;
            }
            Err(SendError::Failed(e)) => {
                tracing::warn!(frame_id, chunk_idx, error = %e, "chunk send failed");
                return ChunkOutcome::Lost { retries: retry };
            }
        }
    }
}

// ── Double buffer ─────────────────────────────────────────────────────────────

/// Result of one streaming step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStep {
    /// The sensor produced nothing; nothing was sent.
    CaptureFailed,
    /// First frame captured; no completed frame to send yet.
    Primed { frame_id: u32 },
    /// The previous frame was transmitted.
    Transmitted(FrameReport),
}

impl StreamStep {
    /// Delivery result for the quality controller. `None` when there is
    /// nothing to judge.
    pub fn success(&self) -> Option<bool> {
        match self {
            StreamStep::CaptureFailed => Some(false),
            StreamStep::Primed { .. } => None,
            StreamStep::Transmitted(report) => Some(report.delivered()),
        }
    }
}

/// Capture into one slot while the other, fully captured, goes out.
pub struct FrameStreamer<S> {
    source: S,
    sender: ChunkSender,
    slots: [Option<FrameBuffer>; 2],
    current: usize,
    next_frame_id: u32,
}

impl<S: FrameSource> FrameStreamer<S> {
    pub fn new(source: S, sender: ChunkSender) -> Self {
        Self {
            source,
            sender,
            slots: [None, None],
            current: 0,
            next_frame_id: 0,
        }
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.source.set_quality(quality);
    }

    pub async fn stream_one_frame(&mut self, sink: &dyn DatagramSink) -> StreamStep {
        let data = match self.source.capture() {
            Some(data) if !data.is_empty() => data,
            Some(empty) => {
                self.source.release(empty);
                tracing::warn!("camera returned an empty frame");
                return StreamStep::CaptureFailed;
            }
            None => {
                tracing::warn!("frame capture failed");
                return StreamStep::CaptureFailed;
            }
        };

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        self.slots[self.current] = Some(FrameBuffer {
            data,
            frame_id,
            captured_at: Instant::now(),
        });

        let previous = 1 - self.current;
        let step = match self.slots[previous].take() {
            Some(frame) => {
                let report = self.sender.send_frame(sink, &frame).await;
                self.source.release(frame.data);
                StreamStep::Transmitted(report)
            }
            None => StreamStep::Primed { frame_id },
        };
        self.current = previous;
        step
    }

    /// Return any held frames to the source.
    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            if let Some(frame) = slot.take() {
                self.source.release(frame.data);
            }
        }
    }
}
