//! Daemon status and peer listing commands.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    name: String,
    root_path: String,
    key: String,
    transport: String,
    state: String,
    peers: usize,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct PeerInfo {
    key: String,
    name: String,
    alias: String,
    source_address: String,
    addresses: BTreeMap<String, String>,
    updated_at: i64,
    age_secs: i64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Roster Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Name      : {}", resp.name);
    println!("  Root      : {}", resp.root_path);
    println!("  Key       : {}", resp.key);
    println!("  Transport : {}", resp.transport);
    println!("  State     : {}", resp.state);
    println!("  Peers     : {}", resp.peers);

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(port))).await?;

    if resp.peers.is_empty() {
        println!("No peers discovered yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Discovered Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        let label = if p.alias.is_empty() {
            p.name.clone()
        } else {
            format!("{} ({})", p.name, p.alias)
        };
        println!("  ┌─ {}", label);
        println!("  │  key    : {}", p.key);
        if !p.source_address.is_empty() {
            println!("  │  source : {}", p.source_address);
        }
        for (protocol, address) in &p.addresses {
            println!("  │  {:<8}: {}", protocol, address);
        }
        println!("  └─ age    : {}s", p.age_secs);
    }

    Ok(())
}
