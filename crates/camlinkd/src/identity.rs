//! Resolve this node's hardware identity.
//!
//! Order: configured address, the interface's hardware address from sysfs,
//! then a locally administered address derived from the hostname.

use anyhow::{Context, Result};

use camlink_core::config::IdentityConfig;
use camlink_core::NodeIdentity;

pub fn resolve(config: &IdentityConfig) -> Result<NodeIdentity> {
    if !config.mac.is_empty() {
        return config
            .mac
            .parse()
            .with_context(|| format!("identity.mac {:?}", config.mac));
    }

    if !config.interface.is_empty() {
        let path = format!("/sys/class/net/{}/address", config.interface);
        match std::fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<NodeIdentity>() {
                Ok(id) if id.octets() != [0; 6] => return Ok(id),
                Ok(_) => tracing::warn!(interface = %config.interface, "interface has no hardware address"),
                Err(e) => tracing::warn!(path, error = %e, "unreadable interface address"),
            },
            Err(e) => tracing::warn!(path, error = %e, "cannot read interface address"),
        }
    }

    let host = hostname();
    let id = from_name(&host);
    tracing::info!(host, %id, "derived identity from hostname");
    Ok(id)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "camlink".to_string())
}

/// Stable locally administered unicast address for `name` (FNV-1a).
fn from_name(name: &str) -> NodeIdentity {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in name.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let h = hash.to_be_bytes();
    // Set locally-administered, clear multicast.
    NodeIdentity::new([(h[0] | 0x02) & 0xFE, h[1], h[2], h[3], h[4], h[5]])
}
