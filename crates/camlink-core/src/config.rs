//! Configuration system for camlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAMLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/camlink/config.toml
//!   3. ~/.config/camlink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::message::MAX_RADIO_PAYLOAD;
use crate::reassembly::DEFAULT_MAX_FRAME_BYTES;
use crate::wire::{DEFAULT_CHUNK_SIZE, HEADER_LEN, MAX_DATAGRAM};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamlinkConfig {
    pub identity: IdentityConfig,
    pub radio: RadioConfig,
    pub discovery: DiscoveryConfig,
    pub handoff: HandoffConfig,
    pub credentials: CredentialsConfig,
    pub stream: StreamConfig,
    pub quality: QualityConfig,
    pub monitor: MonitorConfig,
    pub camera: CameraConfig,
    pub storage: StorageConfig,
    pub collector: CollectorConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hardware address override ("A4:CF:12:05:9E:01"). Empty = derive.
    pub mac: String,
    /// Interface whose hardware address is used when `mac` is empty.
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// UDP port carrying the simulated link layer.
    pub port: u16,
    /// Broadcast address for link-layer frames.
    pub broadcast: String,
    /// Largest radio payload accepted for sending.
    pub max_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Announce attempts before giving up (one per interval).
    pub timeout_secs: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Total send+wait attempts by the master.
    pub attempts: u32,
    pub ack_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// Pause before the process restarts after a handoff.
    pub restart_delay_ms: u64,
    /// How long a slave waits for credentials. 0 = forever.
    pub slave_wait_secs: u64,
}

/// Operator-provided credentials, persisted only if the store has none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Collector host receiving the frame stream.
    pub collector: String,
    /// Default remote port for the master (used when none is persisted).
    pub master_port: u16,
    /// Default remote port for the slave and for standalone nodes.
    pub slave_port: u16,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    pub frame_interval_ms: u64,
    /// Retries for a chunk refused by a full send buffer.
    pub max_retries: u32,
    /// First retry delay; doubles on every further retry.
    pub backoff_base_ms: u64,
    /// Pause every N chunks.
    pub pace_every: u16,
    pub pace_delay_ms: u64,
    /// Yield to other tasks every N chunks.
    pub yield_every: u16,
    /// SO_SNDBUF for the stream socket.
    pub send_buffer_bytes: usize,
}

/// JPEG quality bounds. Lower value = better image, larger frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub initial: u8,
    /// Best quality the controller relaxes to.
    pub min: u8,
    /// Strongest compression the controller raises to.
    pub max: u8,
    pub raise_step: u8,
    pub relax_step: u8,
    /// Consecutive failed frames tolerated before compression is raised.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_secs: u64,
    pub max_failure_pct: f64,
    pub min_fps: f64,
    pub max_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Directory of JPEG files to replay. Empty = synthetic frames.
    pub source_dir: PathBuf,
    /// Synthetic frame size at quality 0.
    pub synthetic_base_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the persisted namespaces.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub listen_ports: Vec<u16>,
    /// Where the latest frame per port is written. Empty = do not write.
    pub output_dir: PathBuf,
    pub max_pending_frames: usize,
    /// Frames claiming more bytes than this are dropped unbuffered.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Status endpoint port on 127.0.0.1. 0 = disabled.
    pub api_port: u16,
    /// Connectivity check interval.
    pub link_check_secs: u64,
}

/// Minimum announce interval.
const MIN_DISCOVERY_INTERVAL_MS: u64 = 10;

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: 4210,
            broadcast: "255.255.255.255".to_string(),
            max_payload: MAX_RADIO_PAYLOAD,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            interval_ms: 1000,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            ack_timeout_ms: 5000,
            retry_delay_ms: 1000,
            restart_delay_ms: 3000,
            slave_wait_secs: 0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            collector: "10.99.7.87".to_string(),
            master_port: 12345,
            slave_port: 12346,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_interval_ms: 100,
            max_retries: 3,
            backoff_base_ms: 1,
            pace_every: 10,
            pace_delay_ms: 1,
            yield_every: 20,
            send_buffer_bytes: 128 * 1024,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial: 20,
            min: 15,
            max: 30,
            raise_step: 3,
            relax_step: 1,
            failure_threshold: 2,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            max_failure_pct: 10.0,
            min_fps: 14.5,
            max_mbps: 5.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            synthetic_base_bytes: 12_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: data_dir() }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_ports: vec![12345, 12346],
            output_dir: PathBuf::new(),
            max_pending_frames: 4,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_port: 9100,
            link_check_secs: 5,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("camlink")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("camlink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CamlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CamlinkConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAMLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CamlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the protocol cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.stream.chunk_size;
        if chunk == 0 || chunk > u16::MAX as usize || chunk + HEADER_LEN > MAX_DATAGRAM {
            return Err(ConfigError::Invalid(format!(
                "stream.chunk_size {chunk} must be in 1..={}",
                MAX_DATAGRAM - HEADER_LEN
            )));
        }
        if self.quality.min > self.quality.max {
            return Err(ConfigError::Invalid(format!(
                "quality.min {} exceeds quality.max {}",
                self.quality.min, self.quality.max
            )));
        }
        if self.radio.max_payload == 0 || self.radio.max_payload > MAX_RADIO_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "radio.max_payload {} must be in 1..={MAX_RADIO_PAYLOAD}",
                self.radio.max_payload
            )));
        }
        if self.handoff.attempts == 0 {
            return Err(ConfigError::Invalid("handoff.attempts must be > 0".into()));
        }
        if self.stream.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.frame_interval_ms must be > 0".into(),
            ));
        }
        if self.monitor.window_secs == 0 {
            return Err(ConfigError::Invalid("monitor.window_secs must be > 0".into()));
        }
        if self.network.link_check_secs == 0 {
            return Err(ConfigError::Invalid(
                "network.link_check_secs must be > 0".into(),
            ));
        }
        if self.discovery.interval_ms < MIN_DISCOVERY_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "discovery.interval_ms must be >= {MIN_DISCOVERY_INTERVAL_MS}"
            )));
        }
        if self.collector.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "collector.max_frame_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Apply CAMLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAMLINK_IDENTITY__MAC") {
            self.identity.mac = v;
        }
        if let Ok(v) = std::env::var("CAMLINK_STREAM__COLLECTOR") {
            self.stream.collector = v;
        }
        if let Ok(v) = std::env::var("CAMLINK_STREAM__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.stream.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("CAMLINK_STORAGE__DIR") {
            self.storage.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAMLINK_DISCOVERY__TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.discovery.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CAMLINK_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("CAMLINK_CAMERA__SOURCE_DIR") {
            self.camera.source_dir = PathBuf::from(v);
        }
    }
}
