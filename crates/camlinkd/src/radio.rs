//! Link-layer radio simulated over UDP broadcast.
//!
//! Every frame is one broadcast datagram on the radio port:
//!
//!   [src: 6 bytes][dst: 6 bytes][payload]
//!
//! Receivers keep frames addressed to them or to broadcast and drop their
//! own. Unicast is still broadcast on the wire; `dst` does the addressing.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use camlink_core::config::RadioConfig;
use camlink_core::NodeIdentity;
use camlink_services::radio::check_payload;
use camlink_services::{InboundFrame, Radio, RadioDispatcher, RadioError};

const ADDR_LEN: usize = 6;
const FRAME_HEADER_LEN: usize = 2 * ADDR_LEN;

pub struct UdpRadio {
    own: NodeIdentity,
    socket: UdpSocket,
    dest: SocketAddr,
    max_payload: usize,
    peers: Mutex<HashSet<NodeIdentity>>,
}

impl UdpRadio {
    pub fn bind(own: NodeIdentity, config: &RadioConfig) -> Result<Self> {
        let broadcast: Ipv4Addr = config
            .broadcast
            .parse()
            .with_context(|| format!("radio.broadcast {:?}", config.broadcast))?;
        let socket = make_radio_socket(config.port).context("failed to create radio socket")?;
        let socket =
            UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?;
        tracing::info!(%own, port = config.port, %broadcast, "radio up");
        Ok(Self {
            own,
            socket,
            dest: SocketAddrV4::new(broadcast, config.port).into(),
            max_payload: config.max_payload,
            peers: Mutex::new(HashSet::new()),
        })
    }

    fn is_registered(&self, peer: &NodeIdentity) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.contains(peer))
            .unwrap_or(false)
    }

    /// Receive frames and hand the ones for us to the dispatcher.
    pub async fn receive_loop(
        self: Arc<Self>,
        dispatcher: Arc<RadioDispatcher>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let len = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok((len, _)) => len,
                    Err(e) => {
                        tracing::warn!(error = %e, "radio recv failed");
                        continue;
                    }
                },
            };
            if let Some(frame) = self.accept(&buf[..len]) {
                tracing::trace!(src = %frame.src, len = frame.payload.len(), "radio frame");
                dispatcher.dispatch(&frame);
            }
        }
    }

    fn accept(&self, datagram: &[u8]) -> Option<InboundFrame> {
        let frame = decode_frame(datagram)?;
        if frame.src == self.own {
            return None;
        }
        if frame.dst != self.own && !frame.dst.is_broadcast() {
            return None;
        }
        Some(frame)
    }
}

impl Radio for UdpRadio {
    fn own_identity(&self) -> NodeIdentity {
        self.own
    }

    fn send(&self, dest: NodeIdentity, payload: &[u8]) -> Result<(), RadioError> {
        check_payload(payload)?;
        if payload.len() > self.max_payload {
            return Err(RadioError::PayloadTooLarge(payload.len()));
        }
        if !dest.is_broadcast() && !self.is_registered(&dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        let frame = encode_frame(self.own, dest, payload);
        self.socket.try_send_to(&frame, self.dest)?;
        Ok(())
    }

    fn add_peer(&self, peer: NodeIdentity) -> Result<(), RadioError> {
        if let Ok(mut peers) = self.peers.lock() {
            if peers.insert(peer) {
                tracing::debug!(%peer, "radio peer registered");
            }
        }
        Ok(())
    }
}

fn encode_frame(src: NodeIdentity, dst: NodeIdentity, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(datagram: &[u8]) -> Option<InboundFrame> {
    if datagram.len() < FRAME_HEADER_LEN {
        return None;
    }
    let (src, rest) = datagram.split_at(ADDR_LEN);
    let (dst, payload) = rest.split_at(ADDR_LEN);
    Some(InboundFrame::new(
        NodeIdentity::new(src.try_into().ok()?),
        NodeIdentity::new(dst.try_into().ok()?),
        payload,
    ))
}

/// UDP socket on the radio port. SO_REUSEADDR lets several nodes on one
/// host share the port and all receive each broadcast.
fn make_radio_socket(port: u16) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).context("bind radio port")?;
    Ok(socket)
}
