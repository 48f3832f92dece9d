//! Peer discovery and role election.
//!
//! A node with no cached peer broadcasts its identity once per interval.
//! Any node hearing a broadcast announce records the sender and answers
//! with a unicast announce of its own; the reply is recorded but not
//! answered, so one round trip leaves both sides with a confirmed peer.

use std::sync::Arc;
use std::time::Duration;

use camlink_core::{elect_role, DeviceRole, NodeIdentity, PeerRecord, RadioMessage};

use crate::context::BootstrapContext;
use crate::dispatch::RadioHandler;
use crate::radio::{InboundFrame, Radio};
use crate::store::Persistence;

pub struct Discovery {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
    radio: Arc<dyn Radio>,
    interval: Duration,
}

impl Discovery {
    pub fn new(
        ctx: Arc<BootstrapContext>,
        persistence: Persistence,
        radio: Arc<dyn Radio>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            persistence,
            radio,
            interval,
        }
    }

    /// Adopt the persisted peer, if any, and register it for unicast.
    pub fn load_cached_peer(&self) -> Option<PeerRecord> {
        let record = self.persistence.peer()?;
        if record.address == self.ctx.own_identity() {
            tracing::warn!(peer = %record.address, "cached peer is our own identity, ignoring");
            return None;
        }
        if let Err(e) = self.radio.add_peer(record.address) {
            tracing::warn!(peer = %record.address, error = %e, "failed to register cached peer");
        }
        self.ctx.set_peer(record);
        tracing::info!(peer = %record.address, "using cached peer");
        Some(record)
    }

    /// Broadcast announces until a peer is confirmed or `attempts` intervals
    /// pass. Returns false on exhaustion (standalone mode).
    pub async fn discover(&self, attempts: u32) -> bool {
        if self.ctx.peer().is_some() {
            return true;
        }
        let announce = match RadioMessage::Announce(self.ctx.own_identity()).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode announce");
                return false;
            }
        };

        let mut peer_rx = self.ctx.subscribe_peer();
        for attempt in 1..=attempts {
            tracing::debug!(attempt, attempts, "broadcasting announce");
            if let Err(e) = self.radio.broadcast(&announce) {
                tracing::warn!(attempt, error = %e, "announce broadcast failed");
            }
            tokio::select! {
                found = peer_rx.wait_for(|p| p.is_some()) => {
                    if let Ok(peer) = found {
                        if let Some(record) = *peer {
                            tracing::info!(peer = %record.address, attempt, "peer discovered");
                        }
                        return true;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        let found = self.ctx.peer().is_some();
        if !found {
            tracing::warn!(attempts, "no peer found, operating standalone");
        }
        found
    }

    /// Elect and fix this process's role from the known peer.
    pub fn elect(&self) -> DeviceRole {
        let role = match self.ctx.peer() {
            Some(peer) => elect_role(&self.ctx.own_identity(), &peer.address),
            None => DeviceRole::Unknown,
        };
        let role = self.ctx.set_role(role);
        tracing::info!(%role, "role elected");
        role
    }
}

/// Inbound announce handling.
pub struct AnnounceHandler {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
    radio: Arc<dyn Radio>,
}

impl AnnounceHandler {
    pub fn new(ctx: Arc<BootstrapContext>, persistence: Persistence, radio: Arc<dyn Radio>) -> Self {
        Self {
            ctx,
            persistence,
            radio,
        }
    }

    fn record(&self, sender: NodeIdentity) -> anyhow::Result<()> {
        let record = PeerRecord::new(sender);
        if self.ctx.set_peer(record) {
            tracing::info!(peer = %sender, "peer recorded");
        }
        self.persistence.set_peer(&record);
        self.radio.add_peer(sender)?;
        Ok(())
    }
}

impl RadioHandler for AnnounceHandler {
    fn handle(&self, frame: &InboundFrame, message: &RadioMessage) -> anyhow::Result<()> {
        let RadioMessage::Announce(sender) = message else {
            return Ok(());
        };
        let own = self.ctx.own_identity();
        if *sender == own {
            tracing::trace!("ignoring echo of own announce");
            return Ok(());
        }
        if *sender != frame.src {
            tracing::debug!(claimed = %sender, src = %frame.src, "announce identity differs from link source");
        }

        self.record(*sender)?;

        if frame.dst.is_broadcast() {
            let reply = RadioMessage::Announce(own).encode()?;
            self.radio.send(*sender, &reply)?;
            tracing::debug!(peer = %sender, "answered announce");
        }
        Ok(())
    }
}
