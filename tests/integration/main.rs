//! camlink integration test harness.
//!
//! Two nodes boot against an in-process radio bus that delivers frames
//! asynchronously, the way the air does. Streaming tests use real UDP on
//! loopback with the collector-side assembler.
//!
//!   cargo test --test integration

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use camlink_core::config::CamlinkConfig;
use camlink_core::reassembly::{Accepted, CompletedFrame, FrameAssembler};
use camlink_core::wire::{decode_chunk, MAX_DATAGRAM};
use camlink_core::{CredentialSet, NodeIdentity, RadioMessage};
use camlink_services::radio::check_payload;
use camlink_services::{
    BootSettings, Bootstrap, BootstrapContext, FrameSource, InboundFrame, Persistence, Radio,
    RadioDispatcher, RadioError, Store,
};

mod pairing;
mod streaming;

// ── Radio bus ─────────────────────────────────────────────────────────────────

/// Shared medium. Each node attaches its dispatcher once it exists.
#[derive(Default)]
pub struct Bus {
    nodes: Mutex<HashMap<NodeIdentity, Arc<RadioDispatcher>>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, own: NodeIdentity, dispatcher: RadioDispatcher) {
        self.nodes.lock().unwrap().insert(own, Arc::new(dispatcher));
    }

    fn deliver(&self, src: NodeIdentity, dst: NodeIdentity, payload: &[u8]) {
        let receivers: Vec<_> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| **id != src && (dst.is_broadcast() || **id == dst))
            .map(|(_, d)| d.clone())
            .collect();
        for dispatcher in receivers {
            let frame = InboundFrame::new(src, dst, payload);
            tokio::spawn(async move {
                dispatcher.dispatch(&frame);
            });
        }
    }
}

pub struct BusRadio {
    own: NodeIdentity,
    bus: Arc<Bus>,
    peers: Mutex<HashSet<NodeIdentity>>,
    sent: Mutex<Vec<(NodeIdentity, Vec<u8>)>>,
}

impl BusRadio {
    pub fn new(own: NodeIdentity, bus: Arc<Bus>) -> Self {
        Self {
            own,
            bus,
            peers: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Parsed messages this node transmitted.
    pub fn sent_messages(&self) -> Vec<RadioMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, p)| RadioMessage::parse(p).ok())
            .collect()
    }

    pub fn config_sends(&self) -> usize {
        self.sent_messages()
            .iter()
            .filter(|m| matches!(m, RadioMessage::Config(_)))
            .count()
    }
}

impl Radio for BusRadio {
    fn own_identity(&self) -> NodeIdentity {
        self.own
    }

    fn send(&self, dest: NodeIdentity, payload: &[u8]) -> Result<(), RadioError> {
        check_payload(payload)?;
        if !dest.is_broadcast() && !self.peers.lock().unwrap().contains(&dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        self.sent.lock().unwrap().push((dest, payload.to_vec()));
        self.bus.deliver(self.own, dest, payload);
        Ok(())
    }

    fn add_peer(&self, peer: NodeIdentity) -> Result<(), RadioError> {
        self.peers.lock().unwrap().insert(peer);
        Ok(())
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub struct Node {
    pub ctx: Arc<BootstrapContext>,
    pub persistence: Persistence,
    pub radio: Arc<BusRadio>,
    pub boot: Bootstrap,
}

/// Build a node on `bus` over `store`, as one boot of the device.
pub fn node(
    bus: &Arc<Bus>,
    own: NodeIdentity,
    store: Arc<dyn Store>,
    seed: Option<CredentialSet>,
) -> Node {
    let ctx = Arc::new(BootstrapContext::new(own));
    let persistence = Persistence::new(store);
    let radio = Arc::new(BusRadio::new(own, bus.clone()));
    let mut settings = BootSettings::from(&CamlinkConfig::default());
    settings.discovery_attempts = 5;
    settings.seed_credentials = seed;
    let boot = Bootstrap::new(ctx.clone(), persistence.clone(), radio.clone(), settings);
    bus.attach(own, boot.dispatcher());
    Node {
        ctx,
        persistence,
        radio,
        boot,
    }
}

// ── Streaming helpers ─────────────────────────────────────────────────────────

/// Camera replaying a fixed list of frames.
pub struct ScriptedCamera {
    frames: Vec<Bytes>,
    next: usize,
    pub released: usize,
}

impl ScriptedCamera {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self {
            frames,
            next: 0,
            released: 0,
        }
    }
}

impl FrameSource for ScriptedCamera {
    fn capture(&mut self) -> Option<Bytes> {
        let frame = self.frames.get(self.next % self.frames.len())?.clone();
        self.next += 1;
        Some(frame)
    }

    fn release(&mut self, _frame: Bytes) {
        self.released += 1;
    }

    fn set_quality(&mut self, _quality: u8) {}
}

/// Deterministic test frame of `len` bytes tagged with `tag`.
pub fn test_frame(tag: u8, len: usize) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31) ^ tag)
        .collect::<Vec<u8>>()
        .into()
}

/// Loopback receiver feeding a frame assembler.
pub struct LoopbackCollector {
    socket: UdpSocket,
    assembler: FrameAssembler,
}

impl LoopbackCollector {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            assembler: FrameAssembler::new(4),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Wait up to `timeout` for the next complete frame.
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<CompletedFrame> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let len = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf))
                .await
                .ok()?
                .ok()?;
            let Ok((header, payload)) = decode_chunk(&buf[..len]) else {
                continue;
            };
            if let Ok(Accepted::Complete(frame)) = self.assembler.accept(&header, payload) {
                return Some(frame);
            }
        }
    }
}
