//! Adaptive JPEG quality.
//!
//! Quality here is the sensor's JPEG quality number: higher means stronger
//! compression and smaller frames. The controller reacts only to the
//! previous frame's delivery result and runs inline with the frame cadence.

use camlink_core::config::QualityConfig;

#[derive(Debug, Clone)]
pub struct QualityController {
    quality: u8,
    min: u8,
    max: u8,
    raise_step: u8,
    relax_step: u8,
    failure_threshold: u32,
    consecutive_failures: u32,
    last_success: Option<bool>,
}

/// What `adjust` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Unchanged,
    Raised { from: u8, to: u8 },
    Relaxed { from: u8, to: u8 },
}

impl QualityController {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            quality: config.initial.clamp(config.min, config.max),
            min: config.min,
            max: config.max,
            raise_step: config.raise_step,
            relax_step: config.relax_step,
            failure_threshold: config.failure_threshold,
            consecutive_failures: 0,
            last_success: None,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feed one frame's delivery result.
    pub fn record(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.last_success = Some(success);
    }

    /// Apply the adaptation rule before the next capture.
    pub fn adjust(&mut self) -> Adjustment {
        let from = self.quality;
        if self.consecutive_failures > self.failure_threshold {
            self.consecutive_failures = 0;
            self.quality = from.saturating_add(self.raise_step).min(self.max);
            if self.quality != from {
                tracing::warn!(from, to = self.quality, "raising compression after repeated failures");
                return Adjustment::Raised {
                    from,
                    to: self.quality,
                };
            }
            return Adjustment::Unchanged;
        }
        if self.last_success == Some(true) && from > self.min {
            self.quality = from.saturating_sub(self.relax_step).max(self.min);
            tracing::debug!(from, to = self.quality, "relaxing compression");
            return Adjustment::Relaxed {
                from,
                to: self.quality,
            };
        }
        Adjustment::Unchanged
    }
}
