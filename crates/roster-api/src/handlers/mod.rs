//! HTTP API handlers — exposes discovery state as JSON.

pub mod find;
pub mod status;

use std::sync::Arc;

use roster_services::Discovery;

#[derive(Clone)]
pub struct ApiState {
    pub discovery: Arc<Discovery>,
}

pub use find::handle_find;
pub use status::{handle_peers, handle_status};
