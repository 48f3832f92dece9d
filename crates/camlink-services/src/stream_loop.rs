//! The capture/stream task.
//!
//! Ticks at a fixed frame period against absolute deadlines, skips frames
//! while the link is down, adapts quality from the previous result, and
//! feeds the monitor. Runs until the shutdown broadcast fires.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::monitor::{MonitorReport, NetworkMonitor};
use crate::quality::{Adjustment, QualityController};
use crate::stream::{DatagramSink, FrameReport, FrameSource, FrameStreamer, StreamStep};

/// Published after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatus {
    pub link_up: bool,
    pub quality: u8,
    pub frames_captured: u64,
    pub frames_transmitted: u64,
    pub frames_delivered: u64,
    pub capture_failures: u64,
    pub skipped_ticks: u64,
    pub last_frame: Option<FrameReport>,
    pub last_window: Option<MonitorReport>,
}

pub struct StreamLoop<S> {
    streamer: FrameStreamer<S>,
    sink: Arc<dyn DatagramSink>,
    quality: QualityController,
    monitor: NetworkMonitor,
    period: Duration,
    link_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<StreamStatus>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S: FrameSource> StreamLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        streamer: FrameStreamer<S>,
        sink: Arc<dyn DatagramSink>,
        quality: QualityController,
        monitor: NetworkMonitor,
        period: Duration,
        link_rx: watch::Receiver<bool>,
        status_tx: watch::Sender<StreamStatus>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            streamer,
            sink,
            quality,
            monitor,
            period,
            link_rx,
            status_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let initial = self.quality.quality();
        self.streamer.set_quality(initial);
        self.status_tx.send_modify(|s| s.quality = initial);

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(period_ms = self.period.as_millis() as u64, quality = initial, "stream loop started");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("stream loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.streamer.shutdown();
        Ok(())
    }

    async fn tick(&mut self) {
        let link_up = *self.link_rx.borrow();
        if !link_up {
            tracing::trace!("link down, skipping frame");
            self.status_tx.send_modify(|s| {
                s.link_up = false;
                s.skipped_ticks += 1;
            });
            return;
        }

        if let Adjustment::Raised { to, .. } | Adjustment::Relaxed { to, .. } = self.quality.adjust() {
            self.streamer.set_quality(to);
        }

        let step = self.streamer.stream_one_frame(self.sink.as_ref()).await;
        if let Some(success) = step.success() {
            self.quality.record(success);
        }

        let window = match &step {
            StreamStep::Transmitted(report) => self.monitor.record_frame(
                report.bytes_sent,
                u32::from(report.chunks_failed()),
                u32::from(report.total_chunks),
            ),
            _ => None,
        };

        let quality = self.quality.quality();
        self.status_tx.send_modify(|s| {
            s.link_up = true;
            s.quality = quality;
            match step {
                StreamStep::CaptureFailed => s.capture_failures += 1,
                StreamStep::Primed { .. } => s.frames_captured += 1,
                StreamStep::Transmitted(report) => {
                    s.frames_captured += 1;
                    s.frames_transmitted += 1;
                    if report.delivered() {
                        s.frames_delivered += 1;
                    }
                    s.last_frame = Some(report);
                }
            }
            if window.is_some() {
                s.last_window = window;
            }
        });
    }
}
