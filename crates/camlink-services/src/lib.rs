//! camlink-services: pairing protocol and frame transport over
//! collaborator traits (radio, store, camera, datagram sink).

pub mod boot;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod handoff;
pub mod monitor;
pub mod quality;
pub mod radio;
pub mod signal;
pub mod store;
pub mod stream;
pub mod stream_loop;

#[cfg(test)]
mod testing;

pub use boot::{BootError, BootOutcome, BootSettings, Bootstrap, RestartReason, StreamPlan};
pub use context::BootstrapContext;
pub use dispatch::{RadioDispatcher, RadioHandler};
pub use radio::{InboundFrame, Radio, RadioError};
pub use store::{FileStore, MemoryStore, Persistence, Store};
pub use stream::{ChunkSender, DatagramSink, FrameSource, FrameStreamer, SendPolicy, UdpSink};
pub use stream_loop::{StreamLoop, StreamStatus};
