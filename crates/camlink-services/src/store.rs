//! Durable key-value persistence and the typed gateway the protocol uses.
//!
//! Everything the pairing protocol remembers across restarts lives in one
//! namespace ("wifi"): peer address, credentials, negotiated stream port and
//! the master's handoff-acknowledged flag. Store failures never surface to
//! the protocol; they read as "not configured yet".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use camlink_core::{CredentialSet, NodeIdentity, PeerRecord};

pub const NAMESPACE: &str = "wifi";

pub const KEY_SSID: &str = "ssid";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_PEER: &str = "peer_mac";
pub const KEY_REMOTE_PORT: &str = "remote";
pub const KEY_ACK: &str = "ack_slave";

/// A typed value as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    Str(String),
    U8(u8),
    U16(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("corrupt store {0}: {1}")]
    Corrupt(PathBuf, serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Key-typed get/set over one durable namespace.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;
    fn set(&self, key: &str, value: StoredValue) -> Result<(), StoreError>;
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

/// Volatile store. Contents vanish with the process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ── FileStore ─────────────────────────────────────────────────────────────────

/// One JSON document per namespace at `<dir>/<namespace>.json`.
///
/// The whole document is rewritten on every `set` through a temp file and
/// rename, so a crash mid-write leaves the previous contents intact.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileStore {
    pub fn open(dir: &Path, namespace: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(dir.to_path_buf(), e))?;
        let path = dir.join(format!("{namespace}.json"));
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(path.clone(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(path, e)),
        };
        tracing::debug!(path = %path.display(), keys = entries.len(), "store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, StoredValue>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StoreError::Corrupt(self.path.clone(), e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(self.path.clone(), e))
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }
}

// ── Persistence gateway ───────────────────────────────────────────────────────

/// Typed access to the keys the pairing protocol consumes and produces.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn Store>,
}

impl Persistence {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn peer(&self) -> Option<PeerRecord> {
        let raw = self.get_str(KEY_PEER)?;
        match raw.parse::<NodeIdentity>() {
            Ok(address) => Some(PeerRecord::new(address)),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed persisted peer");
                None
            }
        }
    }

    pub fn set_peer(&self, peer: &PeerRecord) {
        self.set(KEY_PEER, StoredValue::Str(peer.address.canonical()));
    }

    /// Both ssid and password must be present; an empty ssid counts as absent.
    pub fn credentials(&self) -> Option<CredentialSet> {
        let ssid = self.get_str(KEY_SSID).filter(|s| !s.is_empty())?;
        let password = self.get_str(KEY_PASSWORD)?;
        Some(CredentialSet::new(ssid, password))
    }

    pub fn store_credentials(&self, creds: &CredentialSet) {
        self.set(KEY_SSID, StoredValue::Str(creds.ssid.clone()));
        self.set(KEY_PASSWORD, StoredValue::Str(creds.password.clone()));
    }

    /// Persist `creds` unless credentials are already stored. Returns true if
    /// they were written.
    pub fn store_credentials_if_absent(&self, creds: &CredentialSet) -> bool {
        if self.credentials().is_some() {
            return false;
        }
        self.store_credentials(creds);
        true
    }

    pub fn ack_flag(&self) -> bool {
        matches!(self.get(KEY_ACK), Some(StoredValue::U8(v)) if v != 0)
    }

    pub fn set_ack_flag(&self) {
        self.set(KEY_ACK, StoredValue::U8(1));
    }

    pub fn remote_port(&self) -> Option<u16> {
        match self.get(KEY_REMOTE_PORT) {
            Some(StoredValue::U16(0)) | None => None,
            Some(StoredValue::U16(port)) => Some(port),
            Some(other) => {
                tracing::warn!(value = ?other, "ignoring mistyped remote port");
                None
            }
        }
    }

    pub fn set_remote_port(&self, port: u16) {
        self.set(KEY_REMOTE_PORT, StoredValue::U16(port));
    }

    fn get(&self, key: &str) -> Option<StoredValue> {
        match self.store.get(key) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "store read failed, treating as absent");
                None
            }
        }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            StoredValue::Str(s) => Some(s),
            other => {
                tracing::warn!(key, value = ?other, "expected string in store");
                None
            }
        }
    }

    fn set(&self, key: &str, value: StoredValue) {
        if let Err(e) = self.store.set(key, value) {
            tracing::warn!(key, error = %e, "store write failed");
        }
    }
}
