//! Frame sources standing in for the camera sensor.

use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use camlink_core::config::CameraConfig;
use camlink_services::stream::{CaptureError, FrameSource};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Highest JPEG quality number the sensor accepts.
const MAX_QUALITY: u8 = 63;

pub enum CameraSource {
    Directory(DirectorySource),
    Synthetic(SyntheticSource),
}

impl CameraSource {
    /// Open the configured source. A configured directory must exist and
    /// hold at least one JPEG.
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        if config.source_dir.as_os_str().is_empty() {
            tracing::info!(base_bytes = config.synthetic_base_bytes, "using synthetic camera");
            return Ok(CameraSource::Synthetic(SyntheticSource::new(
                config.synthetic_base_bytes,
            )));
        }
        DirectorySource::open(&config.source_dir).map(CameraSource::Directory)
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Option<Bytes> {
        match self {
            CameraSource::Directory(s) => s.capture(),
            CameraSource::Synthetic(s) => s.capture(),
        }
    }

    fn release(&mut self, frame: Bytes) {
        match self {
            CameraSource::Directory(s) => s.release(frame),
            CameraSource::Synthetic(s) => s.release(frame),
        }
    }

    fn set_quality(&mut self, quality: u8) {
        match self {
            CameraSource::Directory(s) => s.set_quality(quality),
            CameraSource::Synthetic(s) => s.set_quality(quality),
        }
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

/// Replays the JPEG files of a directory in name order, looping.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| CaptureError::Unavailable(dir.to_path_buf(), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|x| x.to_str())
                    .is_some_and(|x| x.eq_ignore_ascii_case("jpg") || x.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        if files.is_empty() {
            return Err(CaptureError::Empty(dir.to_path_buf()));
        }
        files.sort();
        tracing::info!(dir = %dir.display(), frames = files.len(), "camera directory opened");
        Ok(Self { files, next: 0 })
    }
}

impl FrameSource for DirectorySource {
    fn capture(&mut self) -> Option<Bytes> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        match std::fs::read(path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "frame read failed");
                None
            }
        }
    }

    fn release(&mut self, _frame: Bytes) {}

    fn set_quality(&mut self, quality: u8) {
        tracing::trace!(quality, "recorded frames ignore quality");
    }
}

// ── Synthetic ─────────────────────────────────────────────────────────────────

/// JPEG-framed filler whose size shrinks as the quality number rises.
pub struct SyntheticSource {
    base_bytes: usize,
    quality: u8,
    counter: u32,
    spare: Option<BytesMut>,
}

impl SyntheticSource {
    pub fn new(base_bytes: usize) -> Self {
        Self {
            base_bytes,
            quality: 0,
            counter: 0,
            spare: None,
        }
    }

    pub fn frame_len(&self) -> usize {
        let scale = usize::from(MAX_QUALITY + 1 - self.quality.min(MAX_QUALITY));
        (self.base_bytes * scale / usize::from(MAX_QUALITY + 1)).max(JPEG_SOI.len() + JPEG_EOI.len())
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Option<Bytes> {
        let len = self.frame_len();
        let mut buf = self.spare.take().unwrap_or_default();
        buf.clear();
        buf.reserve(len);
        buf.put_slice(&JPEG_SOI);
        let body = len - JPEG_SOI.len() - JPEG_EOI.len();
        let seed = self.counter.to_be_bytes();
        for i in 0..body {
            buf.put_u8(seed[i % 4] ^ (i as u8));
        }
        buf.put_slice(&JPEG_EOI);
        self.counter = self.counter.wrapping_add(1);
        Some(buf.freeze())
    }

    fn release(&mut self, frame: Bytes) {
        // Reclaim the allocation when nothing else holds the frame.
        if let Ok(buf) = frame.try_into_mut() {
            self.spare = Some(buf);
        }
    }

    fn set_quality(&mut self, quality: u8) {
        self.quality = quality.min(MAX_QUALITY);
    }
}
