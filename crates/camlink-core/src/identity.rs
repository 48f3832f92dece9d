//! Node identity and role election.
//!
//! A node is identified by its 6-byte hardware address. The canonical
//! rendering is upper-case colon-separated hex ("A4:CF:12:05:9E:01"); that
//! string is what travels in announce messages and what role election
//! compares. Both nodes hold the same two immutable addresses, so both
//! compute the same roles without talking to each other.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of the canonical string form: six octets, five separators.
const CANONICAL_LEN: usize = 17;

/// 6-byte hardware address of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity([u8; 6]);

impl NodeIdentity {
    /// The link-layer broadcast address.
    pub const BROADCAST: NodeIdentity = NodeIdentity([0xFF; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Canonical colon-hex form used for comparisons and wire messages.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for NodeIdentity {
    type Err = IdentityError;

    /// Parse a colon-hex address. Either case is accepted; anything that is
    /// not exactly six two-digit octets is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != CANONICAL_LEN {
            return Err(IdentityError::Malformed(s.to_string()));
        }
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| IdentityError::Malformed(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| IdentityError::Malformed(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(IdentityError::Malformed(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for NodeIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("malformed hardware address: {0:?}")]
    Malformed(String),
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// The other node of the pair, once an exchange has confirmed it.
///
/// Persisted so later boots skip active discovery. Never deleted
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: NodeIdentity,
    pub discovered: bool,
}

impl PeerRecord {
    pub fn new(address: NodeIdentity) -> Self {
        Self {
            address,
            discovered: true,
        }
    }
}

// ── Role ──────────────────────────────────────────────────────────────────────

/// Role of a node within the pair. Recomputed on every boot, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// No peer known: standalone mode.
    #[default]
    Unknown,
    /// Owns the credentials and hands them to the peer.
    Master,
    /// Receives the credentials from the master.
    Slave,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Unknown => write!(f, "unknown"),
            DeviceRole::Master => write!(f, "master"),
            DeviceRole::Slave => write!(f, "slave"),
        }
    }
}

/// Elect this node's role from the two identities.
///
/// The lexicographically smaller canonical string is Master. Identical
/// identities cannot be ordered and yield `Unknown`.
pub fn elect_role(own: &NodeIdentity, peer: &NodeIdentity) -> DeviceRole {
    let own = own.canonical();
    let peer = peer.canonical();
    match own.cmp(&peer) {
        std::cmp::Ordering::Less => DeviceRole::Master,
        std::cmp::Ordering::Greater => DeviceRole::Slave,
        std::cmp::Ordering::Equal => DeviceRole::Unknown,
    }
}
