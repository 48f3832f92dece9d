//! Collector mode: receive chunk streams and rebuild frames.
//!
//! One task per listen port, each with its own assembler, since master and
//! slave stream to different ports.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use camlink_core::reassembly::{Accepted, CompletedFrame, FrameAssembler};
use camlink_core::wire::{decode_chunk, MAX_DATAGRAM};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
struct CollectorStats {
    datagrams: u64,
    malformed: u64,
    duplicates: u64,
    stale: u64,
    frames: u64,
    bytes: u64,
}

pub struct Collector {
    socket: UdpSocket,
    port: u16,
    assembler: FrameAssembler,
    output_dir: Option<PathBuf>,
    stats: CollectorStats,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Collector {
    pub async fn bind(
        port: u16,
        max_pending: usize,
        max_frame_bytes: usize,
        output_dir: Option<PathBuf>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed to bind collector port {port}"))?;
        let port = socket.local_addr()?.port();
        if let Some(dir) = &output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        tracing::info!(port, "collector listening");
        Ok(Self {
            socket,
            port,
            assembler: FrameAssembler::new(max_pending).with_max_frame_bytes(max_frame_bytes),
            output_dir,
            stats: CollectorStats::default(),
            shutdown_rx,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
        summary.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!(port = self.port, frames = self.stats.frames, "collector stopping");
                    return Ok(());
                }
                _ = summary.tick() => self.log_summary(),
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok((len, from)) => {
                        tracing::trace!(port = self.port, %from, len, "chunk datagram");
                        self.on_datagram(&buf[..len]);
                    }
                    Err(e) => tracing::warn!(port = self.port, error = %e, "collector recv failed"),
                },
            }
        }
    }

    fn on_datagram(&mut self, datagram: &[u8]) {
        self.stats.datagrams += 1;
        let accepted = decode_chunk(datagram)
            .map_err(Into::into)
            .and_then(|(header, payload)| self.assembler.accept(&header, payload));
        match accepted {
            Ok(Accepted::Complete(frame)) => self.on_frame(frame),
            Ok(Accepted::Duplicate) => self.stats.duplicates += 1,
            Ok(Accepted::Stale) => self.stats.stale += 1,
            Ok(Accepted::Pending { .. }) => {}
            Err(e) => {
                self.stats.malformed += 1;
                tracing::debug!(port = self.port, error = %e, "dropping chunk");
            }
        }
    }

    fn on_frame(&mut self, frame: CompletedFrame) {
        self.stats.frames += 1;
        self.stats.bytes += frame.data.len() as u64;
        tracing::debug!(port = self.port, frame_id = frame.frame_id, bytes = frame.data.len(), "frame complete");
        if let Some(dir) = &self.output_dir {
            if let Err(e) = write_latest(dir, self.port, &frame.data) {
                tracing::warn!(port = self.port, error = %e, "failed to write frame");
            }
        }
    }

    fn log_summary(&self) {
        let s = self.stats;
        tracing::info!(
            port = self.port,
            frames = s.frames,
            bytes = s.bytes,
            datagrams = s.datagrams,
            duplicates = s.duplicates,
            stale = s.stale,
            malformed = s.malformed,
            pending = self.assembler.pending_frames(),
            "collector summary"
        );
    }
}

/// Replace `<dir>/latest-<port>.jpg` atomically.
fn write_latest(dir: &Path, port: u16, data: &[u8]) -> std::io::Result<()> {
    let path = dir.join(format!("latest-{port}.jpg"));
    let tmp = dir.join(format!(".latest-{port}.jpg.tmp"));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::wire::{ChunkEncoder, ChunkHeader, ChunkPlan};

    #[tokio::test]
    async fn rebuilds_frames_and_writes_latest() {
        let dir = std::env::temp_dir().join(format!("camlink-collector-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let collector = Collector::bind(0, 4, 1 << 20, Some(dir.clone()), shutdown_rx)
            .await
            .unwrap();
        let port = collector.port;
        let task = tokio::spawn(collector.run());

        let frame: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let plan = ChunkPlan::new(frame.len(), 768).unwrap();
        let mut encoder = ChunkEncoder::new(768).unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for span in plan.spans().collect::<Vec<_>>().into_iter().rev() {
            let header = ChunkHeader::new(
                3,
                frame.len() as u32,
                span.idx,
                plan.total_chunks(),
                span.len() as u16,
            );
            let datagram = encoder.encode(&header, &frame[span.range]).unwrap();
            sender.send_to(datagram, ("127.0.0.1", port)).unwrap();
        }

        let path = dir.join(format!("latest-{port}.jpg"));
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read(&path).unwrap(), frame);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
