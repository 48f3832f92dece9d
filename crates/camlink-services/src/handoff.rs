//! Credential handoff from master to slave.
//!
//! Master: send CONFIG unicast, wait for OK_CONFIG, retry a fixed number of
//! times. Slave: wait for CONFIG from its peer, persist it, acknowledge.
//! Stored credentials are never replaced; an identical replay is acked
//! again, anything else is dropped. Either way the
//! process restarts afterwards; restart is how a node moves on to its
//! credentialed boot.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use camlink_core::config::HandoffConfig;
use camlink_core::message::MessageError;
use camlink_core::{CredentialSet, DeviceRole, RadioMessage};

use crate::context::BootstrapContext;
use crate::dispatch::RadioHandler;
use crate::radio::{InboundFrame, Radio};
use crate::store::Persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    Idle,
    Sending,
    Waiting,
    Acked,
    TimedOut,
    Restarting,
}

#[derive(Debug, Clone)]
pub struct HandoffPolicy {
    pub attempts: u32,
    pub ack_timeout: Duration,
    pub retry_delay: Duration,
    /// Slave wait for CONFIG. `None` waits forever.
    pub slave_wait: Option<Duration>,
}

impl From<&HandoffConfig> for HandoffPolicy {
    fn from(c: &HandoffConfig) -> Self {
        Self {
            attempts: c.attempts,
            ack_timeout: Duration::from_millis(c.ack_timeout_ms),
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            slave_wait: (c.slave_wait_secs > 0).then(|| Duration::from_secs(c.slave_wait_secs)),
        }
    }
}

/// Result of one handoff run. The next state is always `Restarting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    /// `Acked` or `TimedOut`.
    pub outcome: HandoffState,
    pub attempts: u32,
}

impl HandoffReport {
    pub fn acked(&self) -> bool {
        self.outcome == HandoffState::Acked
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("no peer to hand credentials to")]
    NoPeer,
    #[error("cannot encode credentials: {0}")]
    Encode(#[from] MessageError),
}

pub struct Handoff {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
    radio: Arc<dyn Radio>,
    policy: HandoffPolicy,
}

impl Handoff {
    pub fn new(
        ctx: Arc<BootstrapContext>,
        persistence: Persistence,
        radio: Arc<dyn Radio>,
        policy: HandoffPolicy,
    ) -> Self {
        Self {
            ctx,
            persistence,
            radio,
            policy,
        }
    }

    /// Master side: deliver `creds` to the peer.
    pub async fn run_master(&self, creds: &CredentialSet) -> Result<HandoffReport, HandoffError> {
        let peer = self.ctx.peer().ok_or(HandoffError::NoPeer)?.address;
        let payload = RadioMessage::Config(creds.clone()).encode()?;

        let mut state = HandoffState::Idle;
        let mut attempts = 0;
        for attempt in 1..=self.policy.attempts {
            attempts = attempt;
            transition(&mut state, HandoffState::Sending);
            match self.radio.send(peer, &payload) {
                Ok(()) => {
                    transition(&mut state, HandoffState::Waiting);
                    tracing::info!(%peer, attempt, "credentials sent, waiting for ack");
                    if self.ctx.ack_received.wait(Some(self.policy.ack_timeout)).await
                        || self.persistence.ack_flag()
                    {
                        transition(&mut state, HandoffState::Acked);
                        break;
                    }
                    tracing::warn!(%peer, attempt, "ack timeout");
                }
                Err(e) => {
                    tracing::warn!(%peer, attempt, error = %e, "credential send failed");
                }
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        if state != HandoffState::Acked {
            transition(&mut state, HandoffState::TimedOut);
            tracing::error!(%peer, attempts, "handoff not acknowledged, restarting anyway");
        } else {
            tracing::info!(%peer, attempts, "handoff acknowledged");
        }
        Ok(HandoffReport {
            outcome: state,
            attempts,
        })
    }

    /// Slave side: wait for credentials from the master.
    pub async fn run_slave(&self) -> HandoffReport {
        let mut state = HandoffState::Idle;
        transition(&mut state, HandoffState::Waiting);
        tracing::info!("waiting for credentials from master");
        if self.ctx.config_received.wait(self.policy.slave_wait).await {
            transition(&mut state, HandoffState::Acked);
        } else {
            transition(&mut state, HandoffState::TimedOut);
            tracing::warn!("no credentials received");
        }
        HandoffReport {
            outcome: state,
            attempts: 1,
        }
    }
}

fn transition(state: &mut HandoffState, next: HandoffState) {
    tracing::trace!(from = ?*state, to = ?next, "handoff state");
    *state = next;
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Slave side: persist received credentials and acknowledge them.
///
/// A replayed CONFIG is acknowledged again, so a master whose first ack was
/// lost still gets to set its flag.
pub struct ConfigHandler {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
    radio: Arc<dyn Radio>,
}

impl ConfigHandler {
    pub fn new(ctx: Arc<BootstrapContext>, persistence: Persistence, radio: Arc<dyn Radio>) -> Self {
        Self {
            ctx,
            persistence,
            radio,
        }
    }
}

impl RadioHandler for ConfigHandler {
    fn handle(&self, frame: &InboundFrame, message: &RadioMessage) -> anyhow::Result<()> {
        let RadioMessage::Config(creds) = message else {
            return Ok(());
        };
        if self.ctx.role() == Some(DeviceRole::Master) {
            tracing::debug!(src = %frame.src, "master ignores CONFIG");
            return Ok(());
        }
        if self.ctx.peer().map(|p| p.address) != Some(frame.src) {
            tracing::warn!(src = %frame.src, "CONFIG from a node other than our peer, dropping");
            return Ok(());
        }
        match self.persistence.credentials() {
            None => {
                tracing::info!(src = %frame.src, ssid = %creds.ssid, "credentials received");
                self.persistence.store_credentials(creds);
            }
            Some(stored) if stored == *creds => {
                tracing::debug!(src = %frame.src, "replayed CONFIG, acknowledging again");
            }
            Some(stored) => {
                tracing::warn!(
                    src = %frame.src,
                    stored = %stored.ssid,
                    offered = %creds.ssid,
                    "credentials already stored, refusing a different set"
                );
                return Ok(());
            }
        }

        let ack = RadioMessage::ConfigAck.encode()?;
        let sent = self
            .radio
            .add_peer(frame.src)
            .and_then(|()| self.radio.send(frame.src, &ack));
        self.ctx.config_received.notify();
        sent?;
        tracing::debug!(master = %frame.src, "ack sent");
        Ok(())
    }
}

/// Master side: record the slave's acknowledgment.
pub struct AckHandler {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
}

impl AckHandler {
    pub fn new(ctx: Arc<BootstrapContext>, persistence: Persistence) -> Self {
        Self { ctx, persistence }
    }
}

impl RadioHandler for AckHandler {
    fn handle(&self, frame: &InboundFrame, message: &RadioMessage) -> anyhow::Result<()> {
        if *message != RadioMessage::ConfigAck {
            return Ok(());
        }
        if self.ctx.role() != Some(DeviceRole::Master) {
            tracing::debug!(src = %frame.src, "non-master ignores ack");
            return Ok(());
        }
        if !self.persistence.ack_flag() {
            self.persistence.set_ack_flag();
            tracing::info!(slave = %frame.src, "slave acknowledged credentials");
        }
        self.ctx.ack_received.notify();
        Ok(())
    }
}
