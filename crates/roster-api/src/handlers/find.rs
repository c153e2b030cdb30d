//! /find handler — resolve a service name to an address.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use roster_core::ProtocolKind;
use roster_services::DiscoveryError;

use super::ApiState;

#[derive(Deserialize)]
pub struct FindQuery {
    pub name: String,
    pub protocol: String,
}

#[derive(Serialize, Deserialize)]
pub struct FindResponse {
    pub name: String,
    pub protocol: ProtocolKind,
    pub address: String,
}

pub async fn handle_find(
    State(state): State<ApiState>,
    Query(q): Query<FindQuery>,
) -> Result<Json<FindResponse>, (StatusCode, String)> {
    let protocol: ProtocolKind = q
        .protocol
        .parse()
        .map_err(|e: roster_core::record::UnknownProtocol| (StatusCode::BAD_REQUEST, e.to_string()))?;

    match state.discovery.find_service(&q.name, protocol) {
        Ok(address) => Ok(Json(FindResponse {
            name: q.name,
            protocol,
            address,
        })),
        Err(e @ DiscoveryError::NotFound { .. }) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
