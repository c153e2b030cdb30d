//! /status and /peers handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use roster_core::record::unix_now;
use roster_services::DiscoveryState;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub name: String,
    pub root_path: String,
    pub key: String,
    pub transport: String,
    pub state: DiscoveryState,
    pub peers: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let d = &state.discovery;
    Json(StatusResponse {
        name: d.record().name.clone(),
        root_path: d.record().root_path.clone(),
        key: d.own_key().to_string(),
        transport: d.transport_name().to_string(),
        state: d.state(),
        peers: d.peers().len(),
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize, Deserialize)]
pub struct PeerInfo {
    pub key: String,
    pub name: String,
    pub alias: String,
    pub source_address: String,
    /// Protocol name → address.
    pub addresses: BTreeMap<String, String>,
    pub updated_at: i64,
    pub age_secs: i64,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let now = unix_now();
    let peers = state
        .discovery
        .list_all()
        .into_iter()
        .map(|(key, r)| PeerInfo {
            age_secs: r.age_secs(now),
            addresses: r
                .registered_addresses
                .iter()
                .map(|(p, a)| (p.to_string(), a.clone()))
                .collect(),
            key,
            name: r.name,
            alias: r.alias,
            source_address: r.source_address,
            updated_at: r.updated_at,
        })
        .collect();

    Json(PeersResponse { peers })
}
