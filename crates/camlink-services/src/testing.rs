//! Test doubles shared by the unit tests of this crate.

use std::collections::HashSet;
use std::sync::Mutex;

use camlink_core::NodeIdentity;

use crate::radio::{check_payload, Radio, RadioError};

/// Radio that records every frame instead of transmitting it.
pub struct RecordingRadio {
    own: NodeIdentity,
    sent: Mutex<Vec<(NodeIdentity, Vec<u8>)>>,
    peers: Mutex<HashSet<NodeIdentity>>,
}

impl RecordingRadio {
    pub fn new(own: NodeIdentity) -> Self {
        Self {
            own,
            sent: Mutex::new(Vec::new()),
            peers: Mutex::new(HashSet::new()),
        }
    }

    pub fn sent(&self) -> Vec<(NodeIdentity, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, dest: NodeIdentity) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|(d, _)| *d == dest)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn is_registered(&self, peer: NodeIdentity) -> bool {
        self.peers.lock().unwrap().contains(&peer)
    }
}

impl Radio for RecordingRadio {
    fn own_identity(&self) -> NodeIdentity {
        self.own
    }

    fn send(&self, dest: NodeIdentity, payload: &[u8]) -> Result<(), RadioError> {
        check_payload(payload)?;
        if !dest.is_broadcast() && !self.is_registered(dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        self.sent.lock().unwrap().push((dest, payload.to_vec()));
        Ok(())
    }

    fn add_peer(&self, peer: NodeIdentity) -> Result<(), RadioError> {
        self.peers.lock().unwrap().insert(peer);
        Ok(())
    }
}
