//! camlink-core: shared types, wire format, and configuration.
//! All other camlink crates depend on this one.

pub mod config;
pub mod identity;
pub mod message;
pub mod reassembly;
pub mod wire;

pub use identity::{elect_role, DeviceRole, NodeIdentity, PeerRecord};
pub use message::{CredentialSet, MessageKind, RadioMessage};
