//! Connectivity monitor.
//!
//! Periodically checks that the host has a route to the collector and
//! publishes link up/down to the stream loop. Association and reconnection
//! belong to the host network stack.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

/// Shortest check interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

pub struct LinkMonitor {
    target: SocketAddr,
    interval: Duration,
    link_tx: watch::Sender<bool>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl LinkMonitor {
    pub fn new(
        target: SocketAddr,
        interval: Duration,
        link_tx: watch::Sender<bool>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            target,
            interval: interval.max(MIN_INTERVAL),
            link_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => return Ok(()),
                _ = interval.tick() => {
                    let up = route_exists(self.target);
                    let changed = self.link_tx.send_if_modified(|current| {
                        let changed = *current != up;
                        *current = up;
                        changed
                    });
                    if changed {
                        if up {
                            tracing::info!(collector = %self.target, "link up");
                        } else {
                            tracing::warn!(collector = %self.target, "link down, pausing stream");
                        }
                    }
                }
            }
        }
    }
}

/// True if the kernel can pick a source address for `target`.
pub fn route_exists(target: SocketAddr) -> bool {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let Ok(socket) = UdpSocket::bind(bind) else {
        return false;
    };
    if socket.connect(target).is_err() {
        return false;
    }
    socket
        .local_addr()
        .map(|a| !a.ip().is_unspecified())
        .unwrap_or(false)
}
