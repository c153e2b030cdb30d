//! Roster integration test harness.
//!
//! Every test runs two or more discovery instances inside one process:
//! registry tests share an in-memory store on tokio's paused clock, and
//! broadcast tests talk over UDP on the loopback interface.
//!
//!   cargo test --test integration

mod broadcast;
mod registry;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use roster_core::{DiscoveryKeys, PresenceRecord, ProtocolKind};
use roster_services::{DiscoverySettings, MemoryStore, TransportSettings};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ROOT: &str = "/acme";

/// Scenario timing: publish every second, records fresh for three.
pub const INTERVAL: Duration = Duration::from_secs(1);
pub const WINDOW: Duration = Duration::from_secs(3);

pub fn record(name: &str, http: &str) -> PresenceRecord {
    PresenceRecord::new(name, ROOT).with_address(ProtocolKind::Http, http)
}

pub fn registry_settings(store: &MemoryStore) -> DiscoverySettings {
    DiscoverySettings {
        publish_interval: INTERVAL,
        freshness_window: WINDOW,
        transport: TransportSettings::Registry {
            store: Arc::new(store.clone()),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
        },
    }
}

pub fn broadcast_settings(port: u16, keys: Arc<DiscoveryKeys>) -> DiscoverySettings {
    DiscoverySettings {
        publish_interval: INTERVAL,
        freshness_window: WINDOW,
        transport: TransportSettings::Broadcast {
            port,
            address: Ipv4Addr::LOCALHOST,
            keys,
        },
    }
}

/// A UDP port nothing is bound to right now.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap_or(47_000)
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn wait_for<F: FnMut() -> bool>(limit: Duration, mut check: F) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if check() {
        return Ok(());
    }
    bail!("condition not met within {limit:?}")
}
