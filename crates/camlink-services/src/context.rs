//! Bootstrap context: the state discovery, election and handoff share.
//!
//! Built once by the composition root and handed by `Arc` to the boot
//! sequence and to the radio handlers.

use std::sync::OnceLock;

use tokio::sync::watch;

use camlink_core::{DeviceRole, NodeIdentity, PeerRecord};

use crate::signal::Signal;

pub struct BootstrapContext {
    own: NodeIdentity,
    peer: watch::Sender<Option<PeerRecord>>,
    role: OnceLock<DeviceRole>,
    /// Slave side: credentials arrived and were persisted.
    pub config_received: Signal,
    /// Master side: the slave acknowledged the credentials.
    pub ack_received: Signal,
}

impl BootstrapContext {
    pub fn new(own: NodeIdentity) -> Self {
        let (peer, _) = watch::channel(None);
        Self {
            own,
            peer,
            role: OnceLock::new(),
            config_received: Signal::new(),
            ack_received: Signal::new(),
        }
    }

    pub fn own_identity(&self) -> NodeIdentity {
        self.own
    }

    pub fn peer(&self) -> Option<PeerRecord> {
        *self.peer.borrow()
    }

    /// Record the peer. Returns true if it differs from the one held.
    pub fn set_peer(&self, record: PeerRecord) -> bool {
        self.peer.send_if_modified(|current| {
            if *current == Some(record) {
                return false;
            }
            *current = Some(record);
            true
        })
    }

    pub fn subscribe_peer(&self) -> watch::Receiver<Option<PeerRecord>> {
        self.peer.subscribe()
    }

    /// Role once elected. `None` while discovery is still running.
    pub fn role(&self) -> Option<DeviceRole> {
        self.role.get().copied()
    }

    /// Fix the role for this process. Later calls keep the first value.
    pub fn set_role(&self, role: DeviceRole) -> DeviceRole {
        *self.role.get_or_init(|| role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_fixed_once() {
        let ctx = BootstrapContext::new(NodeIdentity::new([1; 6]));
        assert_eq!(ctx.role(), None);
        assert_eq!(ctx.set_role(DeviceRole::Master), DeviceRole::Master);
        assert_eq!(ctx.set_role(DeviceRole::Slave), DeviceRole::Master);
        assert_eq!(ctx.role(), Some(DeviceRole::Master));
    }

    #[tokio::test]
    async fn subscribers_see_new_peer() {
        let ctx = BootstrapContext::new(NodeIdentity::new([1; 6]));
        let mut rx = ctx.subscribe_peer();
        let record = PeerRecord::new(NodeIdentity::new([2; 6]));
        assert!(ctx.set_peer(record));
        assert!(!ctx.set_peer(record));
        let seen = rx.wait_for(|p| p.is_some()).await.unwrap();
        assert_eq!(*seen, Some(record));
    }
}
