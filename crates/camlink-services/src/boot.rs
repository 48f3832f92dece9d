//! Boot sequence: discovery, election, credential handoff.
//!
//! Runs once per process, before the stream task exists. Ends in one of
//! three ways: stream with a plan, restart the process, or stop with an
//! error the operator has to fix.

use std::sync::Arc;
use std::time::Duration;

use camlink_core::config::CamlinkConfig;
use camlink_core::{CredentialSet, DeviceRole, MessageKind, PeerRecord};

use crate::context::BootstrapContext;
use crate::discovery::{AnnounceHandler, Discovery};
use crate::dispatch::RadioDispatcher;
use crate::handoff::{AckHandler, ConfigHandler, Handoff, HandoffError, HandoffPolicy, HandoffReport, HandoffState};
use crate::radio::Radio;
use crate::store::Persistence;
use crate::stream::CaptureError;

/// What the credentialed node streams with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    pub role: DeviceRole,
    pub peer: Option<PeerRecord>,
    pub remote_port: u16,
    pub credentials: CredentialSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Master finished its handoff attempts.
    HandoffFinished { acked: bool },
    /// Slave received and stored credentials.
    CredentialsReceived,
    /// Slave gave up waiting for credentials.
    CredentialWaitExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    Stream(StreamPlan),
    Restart {
        reason: RestartReason,
        handoff: HandoffReport,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("no peer found and no WiFi credentials; provision one node")]
    NoPeerNoCredentials,
    #[error("master has no WiFi credentials; set [credentials] in the config")]
    Unprovisioned,
    #[error("handoff failed: {0}")]
    Handoff(#[from] HandoffError),
    #[error("camera initialisation failed: {0}")]
    Camera(#[from] CaptureError),
}

#[derive(Debug, Clone)]
pub struct BootSettings {
    pub discovery_attempts: u32,
    pub discovery_interval: Duration,
    pub handoff: HandoffPolicy,
    pub master_port: u16,
    pub slave_port: u16,
    pub seed_credentials: Option<CredentialSet>,
}

impl From<&CamlinkConfig> for BootSettings {
    fn from(c: &CamlinkConfig) -> Self {
        let seed = &c.credentials;
        Self {
            discovery_attempts: c.discovery.timeout_secs,
            discovery_interval: Duration::from_millis(c.discovery.interval_ms),
            handoff: HandoffPolicy::from(&c.handoff),
            master_port: c.stream.master_port,
            slave_port: c.stream.slave_port,
            seed_credentials: (!seed.ssid.is_empty())
                .then(|| CredentialSet::new(seed.ssid.clone(), seed.password.clone())),
        }
    }
}

pub struct Bootstrap {
    ctx: Arc<BootstrapContext>,
    persistence: Persistence,
    radio: Arc<dyn Radio>,
    settings: BootSettings,
}

impl Bootstrap {
    pub fn new(
        ctx: Arc<BootstrapContext>,
        persistence: Persistence,
        radio: Arc<dyn Radio>,
        settings: BootSettings,
    ) -> Self {
        Self {
            ctx,
            persistence,
            radio,
            settings,
        }
    }

    /// Dispatch table wiring the pairing handlers to this node's state.
    pub fn dispatcher(&self) -> RadioDispatcher {
        let mut dispatcher = RadioDispatcher::new();
        dispatcher.register(
            MessageKind::Announce,
            Arc::new(AnnounceHandler::new(
                self.ctx.clone(),
                self.persistence.clone(),
                self.radio.clone(),
            )),
        );
        dispatcher.register(
            MessageKind::Config,
            Arc::new(ConfigHandler::new(
                self.ctx.clone(),
                self.persistence.clone(),
                self.radio.clone(),
            )),
        );
        dispatcher.register(
            MessageKind::ConfigAck,
            Arc::new(AckHandler::new(self.ctx.clone(), self.persistence.clone())),
        );
        dispatcher
    }

    pub async fn run(&self) -> Result<BootOutcome, BootError> {
        let discovery = Discovery::new(
            self.ctx.clone(),
            self.persistence.clone(),
            self.radio.clone(),
            self.settings.discovery_interval,
        );
        if discovery.load_cached_peer().is_none() {
            discovery.discover(self.settings.discovery_attempts).await;
        }
        let peer = self.ctx.peer();
        let role = discovery.elect();

        let remote_port = self.remote_port(role);

        if let Some(seed) = &self.settings.seed_credentials {
            if self.persistence.store_credentials_if_absent(seed) {
                tracing::info!(ssid = %seed.ssid, "stored configured credentials");
            }
        }

        let handoff = Handoff::new(
            self.ctx.clone(),
            self.persistence.clone(),
            self.radio.clone(),
            self.settings.handoff.clone(),
        );

        let Some(credentials) = self.persistence.credentials() else {
            tracing::info!(%role, "no WiFi credentials stored");
            return match role {
                DeviceRole::Slave => {
                    let report = handoff.run_slave().await;
                    let reason = if report.acked() {
                        RestartReason::CredentialsReceived
                    } else {
                        RestartReason::CredentialWaitExpired
                    };
                    Ok(restart(reason, report))
                }
                DeviceRole::Master => {
                    tracing::error!("master has no credentials to hand off");
                    Err(BootError::Unprovisioned)
                }
                DeviceRole::Unknown => {
                    tracing::error!("no peer found and no WiFi credentials, cannot proceed");
                    Err(BootError::NoPeerNoCredentials)
                }
            };
        };

        if role == DeviceRole::Master && peer.is_some() && !self.persistence.ack_flag() {
            tracing::warn!("slave has not acknowledged credentials, sending them");
            let report = handoff.run_master(&credentials).await?;
            let reason = RestartReason::HandoffFinished {
                acked: report.acked(),
            };
            return Ok(restart(reason, report));
        }

        tracing::info!(%role, ssid = %credentials.ssid, remote_port, "credentials present, streaming");
        Ok(BootOutcome::Stream(StreamPlan {
            role,
            peer,
            remote_port,
            credentials,
        }))
    }

    /// Persisted stream port, else the role default (persisted).
    fn remote_port(&self, role: DeviceRole) -> u16 {
        if let Some(port) = self.persistence.remote_port() {
            return port;
        }
        let port = match role {
            DeviceRole::Master => self.settings.master_port,
            _ => self.settings.slave_port,
        };
        self.persistence.set_remote_port(port);
        port
    }
}

fn restart(reason: RestartReason, handoff: HandoffReport) -> BootOutcome {
    tracing::info!(?reason, from = ?handoff.outcome, to = ?HandoffState::Restarting, "handoff complete, restart required");
    BootOutcome::Restart { reason, handoff }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::InboundFrame;
    use crate::store::MemoryStore;
    use crate::testing::RecordingRadio;
    use camlink_core::{NodeIdentity, RadioMessage};

    const MASTER: NodeIdentity = NodeIdentity::new([0x24, 0x0A, 0xC4, 0, 0, 0x01]);
    const SLAVE: NodeIdentity = NodeIdentity::new([0xA4, 0xCF, 0x12, 0x05, 0x9E, 0x01]);

    struct Node {
        persistence: Persistence,
        radio: Arc<RecordingRadio>,
        boot: Bootstrap,
    }

    fn node(own: NodeIdentity, seed: Option<CredentialSet>) -> Node {
        let ctx = Arc::new(BootstrapContext::new(own));
        let persistence = Persistence::new(Arc::new(MemoryStore::new()));
        let radio = Arc::new(RecordingRadio::new(own));
        let mut settings = BootSettings::from(&CamlinkConfig::default());
        settings.discovery_attempts = 5;
        settings.seed_credentials = seed;
        let boot = Bootstrap::new(ctx, persistence.clone(), radio.clone(), settings);
        Node {
            persistence,
            radio,
            boot,
        }
    }

    fn creds() -> CredentialSet {
        CredentialSet::new("home", "pw")
    }

    fn config_sends(radio: &RecordingRadio) -> usize {
        radio
            .sent()
            .iter()
            .filter(|(_, p)| p.starts_with(b"CONFIG:"))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_streams_without_handoff() {
        let n = node(MASTER, Some(creds()));
        let outcome = n.boot.run().await.unwrap();

        let BootOutcome::Stream(plan) = outcome else {
            panic!("expected streaming, got {outcome:?}");
        };
        assert_eq!(plan.role, DeviceRole::Unknown);
        assert_eq!(plan.peer, None);
        assert_eq!(plan.remote_port, 12346);
        assert_eq!(n.radio.sent_to(NodeIdentity::BROADCAST).len(), 5);
        assert_eq!(config_sends(&n.radio), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_without_credentials_is_terminal() {
        let n = node(MASTER, None);
        assert!(matches!(
            n.boot.run().await,
            Err(BootError::NoPeerNoCredentials)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn master_with_ack_flag_never_resends() {
        let n = node(MASTER, Some(creds()));
        n.persistence.set_peer(&PeerRecord::new(SLAVE));
        n.persistence.set_ack_flag();

        for _ in 0..3 {
            let outcome = n.boot.run().await.unwrap();
            assert!(matches!(outcome, BootOutcome::Stream(ref p) if p.role == DeviceRole::Master && p.remote_port == 12345));
        }
        assert_eq!(config_sends(&n.radio), 0);
        assert!(n.radio.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn master_without_ack_hands_off_then_restarts() {
        let n = node(MASTER, Some(creds()));
        n.persistence.set_peer(&PeerRecord::new(SLAVE));

        let outcome = n.boot.run().await.unwrap();
        let BootOutcome::Restart { reason, handoff } = outcome else {
            panic!("expected restart, got {outcome:?}");
        };
        assert_eq!(reason, RestartReason::HandoffFinished { acked: false });
        assert_eq!(handoff.attempts, 5);
        assert_eq!(config_sends(&n.radio), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn master_without_credentials_needs_provisioning() {
        let n = node(MASTER, None);
        n.persistence.set_peer(&PeerRecord::new(SLAVE));
        assert!(matches!(n.boot.run().await, Err(BootError::Unprovisioned)));
    }

    #[tokio::test(start_paused = true)]
    async fn slave_restarts_after_receiving_credentials() {
        let n = node(SLAVE, None);
        n.persistence.set_peer(&PeerRecord::new(MASTER));
        let dispatcher = n.boot.dispatcher();

        let master = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let frame = InboundFrame::new(
                MASTER,
                SLAVE,
                RadioMessage::Config(creds()).encode().unwrap(),
            );
            assert!(dispatcher.dispatch(&frame));
        };
        let (outcome, ()) = tokio::join!(n.boot.run(), master);

        assert!(matches!(
            outcome.unwrap(),
            BootOutcome::Restart {
                reason: RestartReason::CredentialsReceived,
                ..
            }
        ));
        assert_eq!(n.persistence.credentials(), Some(creds()));
        assert_eq!(n.radio.sent_to(MASTER), vec![b"OK_CONFIG".to_vec()]);
        assert_eq!(n.persistence.remote_port(), Some(12346));
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_port_wins_over_role_default() {
        let n = node(MASTER, Some(creds()));
        n.persistence.set_remote_port(40000);
        let BootOutcome::Stream(plan) = n.boot.run().await.unwrap() else {
            panic!("expected streaming");
        };
        assert_eq!(plan.remote_port, 40000);
    }
}
