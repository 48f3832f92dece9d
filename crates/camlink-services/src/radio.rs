//! Link-layer radio contract.
//!
//! Small-payload, unreliable, broadcast-capable delivery between nodes
//! addressed by hardware identity. Unicast requires the destination to be
//! registered first with `add_peer`.

use camlink_core::message::MAX_RADIO_PAYLOAD;
use camlink_core::NodeIdentity;

/// One frame received from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Link-layer source of the frame.
    pub src: NodeIdentity,
    /// Link-layer destination: our own identity or broadcast.
    pub dst: NodeIdentity,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    pub fn new(src: NodeIdentity, dst: NodeIdentity, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            src,
            dst,
            payload: payload.into(),
        }
    }
}

/// Radio transport collaborator.
pub trait Radio: Send + Sync {
    fn own_identity(&self) -> NodeIdentity;

    /// Queue one frame. `Ok` is the send-completion status, not delivery.
    fn send(&self, dest: NodeIdentity, payload: &[u8]) -> Result<(), RadioError>;

    /// Register a peer for unicast. Registering twice is a no-op.
    fn add_peer(&self, peer: NodeIdentity) -> Result<(), RadioError>;

    fn broadcast(&self, payload: &[u8]) -> Result<(), RadioError> {
        self.send(NodeIdentity::BROADCAST, payload)
    }
}

/// Size check shared by radio implementations.
pub fn check_payload(payload: &[u8]) -> Result<(), RadioError> {
    if payload.len() > MAX_RADIO_PAYLOAD {
        return Err(RadioError::PayloadTooLarge(payload.len()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("peer {0} is not registered")]
    UnknownPeer(NodeIdentity),
    #[error("radio payload of {0} bytes exceeds {}", MAX_RADIO_PAYLOAD)]
    PayloadTooLarge(usize),
    #[error("radio I/O: {0}")]
    Io(#[from] std::io::Error),
}
