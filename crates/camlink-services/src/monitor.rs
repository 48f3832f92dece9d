//! Rolling-window stream telemetry.
//!
//! Advisory only: reports are logged and published, nothing here changes
//! how frames are sent.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use camlink_core::config::MonitorConfig;

/// Figures for one completed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub window_secs: f64,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub chunks_failed: u64,
    pub chunks_total: u64,
    pub mbps: f64,
    pub fps: f64,
    pub failure_pct: f64,
    pub warnings: Vec<MonitorWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorWarning {
    HighFailureRate,
    LowFrameRate,
    HighBandwidth,
}

#[derive(Debug, Clone)]
struct Thresholds {
    max_failure_pct: f64,
    min_fps: f64,
    max_mbps: f64,
}

#[derive(Debug)]
pub struct NetworkMonitor {
    window: Duration,
    thresholds: Thresholds,
    window_start: Instant,
    bytes_sent: u64,
    frames_sent: u64,
    chunks_failed: u64,
    chunks_total: u64,
}

impl NetworkMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub fn starting_at(config: &MonitorConfig, start: Instant) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            thresholds: Thresholds {
                max_failure_pct: config.max_failure_pct,
                min_fps: config.min_fps,
                max_mbps: config.max_mbps,
            },
            window_start: start,
            bytes_sent: 0,
            frames_sent: 0,
            chunks_failed: 0,
            chunks_total: 0,
        }
    }

    pub fn record_frame(&mut self, bytes: usize, chunks_failed: u32, chunks_total: u32) -> Option<MonitorReport> {
        self.record_frame_at(Instant::now(), bytes, chunks_failed, chunks_total)
    }

    /// Accumulate one frame; when the window has elapsed, emit a report and
    /// start a new window at `now`.
    pub fn record_frame_at(
        &mut self,
        now: Instant,
        bytes: usize,
        chunks_failed: u32,
        chunks_total: u32,
    ) -> Option<MonitorReport> {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
        self.chunks_failed += u64::from(chunks_failed);
        self.chunks_total += u64::from(chunks_total);

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let report = self.report(elapsed);
        self.reset(now);
        Some(report)
    }

    fn report(&self, elapsed: Duration) -> MonitorReport {
        let secs = elapsed.as_secs_f64();
        let mbps = (self.bytes_sent as f64 * 8.0) / secs / 1_000_000.0;
        let fps = self.frames_sent as f64 / secs;
        let failure_pct = if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_failed as f64 * 100.0 / self.chunks_total as f64
        };

        let mut warnings = Vec::new();
        if failure_pct > self.thresholds.max_failure_pct {
            warnings.push(MonitorWarning::HighFailureRate);
        }
        if fps < self.thresholds.min_fps {
            warnings.push(MonitorWarning::LowFrameRate);
        }
        if mbps > self.thresholds.max_mbps {
            warnings.push(MonitorWarning::HighBandwidth);
        }

        tracing::info!(mbps, fps, failure_pct, "stream window");
        for warning in &warnings {
            match warning {
                MonitorWarning::HighFailureRate => {
                    tracing::warn!(failure_pct, "high chunk failure rate, consider lowering image quality")
                }
                MonitorWarning::LowFrameRate => {
                    tracing::warn!(fps, "low frame rate, check processing time or network")
                }
                MonitorWarning::HighBandwidth => {
                    tracing::warn!(mbps, "high bandwidth usage, watch network capacity")
                }
            }
        }

        MonitorReport {
            window_secs: secs,
            bytes_sent: self.bytes_sent,
            frames_sent: self.frames_sent,
            chunks_failed: self.chunks_failed,
            chunks_total: self.chunks_total,
            mbps,
            fps,
            failure_pct,
            warnings,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.bytes_sent = 0;
        self.frames_sent = 0;
        self.chunks_failed = 0;
        self.chunks_total = 0;
    }
}
