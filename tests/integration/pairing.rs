use std::sync::Arc;

use camlink_core::{CredentialSet, DeviceRole, NodeIdentity, PeerRecord};
use camlink_services::boot::{BootError, BootOutcome, RestartReason};
use camlink_services::store::NAMESPACE;
use camlink_services::{FileStore, MemoryStore, Store};

use crate::*;

const MASTER: NodeIdentity = NodeIdentity::new([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);
const SLAVE: NodeIdentity = NodeIdentity::new([0xA4, 0xCF, 0x12, 0x05, 0x9E, 0x01]);

fn creds() -> CredentialSet {
    CredentialSet::new("HomeNet", "hunter2,with,commas")
}

fn temp_store(name: &str) -> (std::path::PathBuf, Arc<dyn Store>) {
    let dir = std::env::temp_dir().join(format!("camlink-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = FileStore::open(&dir, NAMESPACE).unwrap();
    (dir, Arc::new(store))
}

#[tokio::test(start_paused = true)]
async fn first_boot_pairs_and_hands_off() {
    let bus = Bus::new();
    let master = node(&bus, MASTER, Arc::new(MemoryStore::new()), Some(creds()));
    let slave = node(&bus, SLAVE, Arc::new(MemoryStore::new()), None);

    let (m, s) = tokio::join!(master.boot.run(), slave.boot.run());

    match m.unwrap() {
        BootOutcome::Restart { reason, handoff } => {
            assert_eq!(reason, RestartReason::HandoffFinished { acked: true });
            assert_eq!(handoff.attempts, 1);
        }
        other => panic!("master should restart after handoff, got {other:?}"),
    }
    assert!(matches!(
        s.unwrap(),
        BootOutcome::Restart {
            reason: RestartReason::CredentialsReceived,
            ..
        }
    ));

    assert_eq!(master.ctx.role(), Some(DeviceRole::Master));
    assert_eq!(slave.ctx.role(), Some(DeviceRole::Slave));
    assert_eq!(master.persistence.peer().map(|p| p.address), Some(SLAVE));
    assert_eq!(slave.persistence.peer().map(|p| p.address), Some(MASTER));
    assert_eq!(slave.persistence.credentials(), Some(creds()));
    assert!(master.persistence.ack_flag());
    assert!(!slave.persistence.ack_flag());
    assert_eq!(master.radio.config_sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn reboot_after_handoff_streams_on_role_ports() {
    let (master_dir, master_store) = temp_store("master");
    let (slave_dir, slave_store) = temp_store("slave");

    {
        let bus = Bus::new();
        let master = node(&bus, MASTER, master_store.clone(), Some(creds()));
        let slave = node(&bus, SLAVE, slave_store.clone(), None);
        let (m, s) = tokio::join!(master.boot.run(), slave.boot.run());
        assert!(matches!(m.unwrap(), BootOutcome::Restart { .. }));
        assert!(matches!(s.unwrap(), BootOutcome::Restart { .. }));
    }

    // Fresh processes over the same on-disk namespaces.
    let master_store: Arc<dyn Store> = Arc::new(FileStore::open(&master_dir, NAMESPACE).unwrap());
    let slave_store: Arc<dyn Store> = Arc::new(FileStore::open(&slave_dir, NAMESPACE).unwrap());
    let bus = Bus::new();
    let master = node(&bus, MASTER, master_store, None);
    let slave = node(&bus, SLAVE, slave_store, None);
    let (m, s) = tokio::join!(master.boot.run(), slave.boot.run());

    let BootOutcome::Stream(mplan) = m.unwrap() else {
        panic!("master should stream on second boot");
    };
    let BootOutcome::Stream(splan) = s.unwrap() else {
        panic!("slave should stream on second boot");
    };
    assert_eq!(mplan.role, DeviceRole::Master);
    assert_eq!(mplan.remote_port, 12345);
    assert_eq!(splan.role, DeviceRole::Slave);
    assert_eq!(splan.remote_port, 12346);
    assert_eq!(mplan.credentials, creds());
    assert_eq!(splan.credentials, creds());

    // Cached peers skip discovery and the acked master skips the handoff.
    assert!(master.radio.sent_messages().is_empty());
    assert!(slave.radio.sent_messages().is_empty());

    let _ = std::fs::remove_dir_all(&master_dir);
    let _ = std::fs::remove_dir_all(&slave_dir);
}

#[tokio::test(start_paused = true)]
async fn lost_ack_is_recovered_by_replayed_config() {
    let master_store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let slave_store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    {
        // State after a handoff whose ack never reached the master.
        let master = camlink_services::Persistence::new(master_store.clone());
        master.set_peer(&PeerRecord::new(SLAVE));
        master.store_credentials(&creds());
        let slave = camlink_services::Persistence::new(slave_store.clone());
        slave.set_peer(&PeerRecord::new(MASTER));
        slave.store_credentials(&creds());
    }

    let bus = Bus::new();
    let master = node(&bus, MASTER, master_store, None);
    let slave = node(&bus, SLAVE, slave_store, None);
    let (m, s) = tokio::join!(master.boot.run(), slave.boot.run());

    assert!(matches!(
        m.unwrap(),
        BootOutcome::Restart {
            reason: RestartReason::HandoffFinished { acked: true },
            ..
        }
    ));
    assert!(matches!(s.unwrap(), BootOutcome::Stream(_)));
    assert!(master.persistence.ack_flag());
}

#[tokio::test(start_paused = true)]
async fn lone_node_without_credentials_halts() {
    let bus = Bus::new();
    let lone = node(&bus, SLAVE, Arc::new(MemoryStore::new()), None);

    let err = lone.boot.run().await.unwrap_err();
    assert!(matches!(err, BootError::NoPeerNoCredentials));
    assert_eq!(lone.ctx.role(), Some(DeviceRole::Unknown));
    assert_eq!(lone.radio.sent_messages().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn lone_node_with_credentials_streams_standalone() {
    let bus = Bus::new();
    let lone = node(&bus, MASTER, Arc::new(MemoryStore::new()), Some(creds()));

    let BootOutcome::Stream(plan) = lone.boot.run().await.unwrap() else {
        panic!("standalone node should stream");
    };
    assert_eq!(plan.role, DeviceRole::Unknown);
    assert_eq!(plan.peer, None);
    assert_eq!(plan.remote_port, 12346);
    assert_eq!(lone.radio.config_sends(), 0);
}
