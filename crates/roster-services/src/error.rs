//! Error taxonomy for discovery.
//!
//! Only `Configuration` and `Connectivity` ever reach the caller of
//! [`Discovery::start`](crate::Discovery::start). `NotFound` is the normal
//! miss result of a lookup. `Codec` errors are per-message and stay inside
//! the ingest tasks.

use roster_core::config::ConfigError;
use roster_core::{CodecError, ProtocolKind};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Unusable settings. Fatal to starting that transport.
    #[error("invalid discovery configuration: {0}")]
    Configuration(String),

    /// Registry unreachable or socket bind failed.
    #[error("discovery connectivity: {0}")]
    Connectivity(String),

    #[error("no live peer named {name:?} offers {protocol}")]
    NotFound { name: String, protocol: ProtocolKind },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<ConfigError> for DiscoveryError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<StoreError> for DiscoveryError {
    fn from(e: StoreError) -> Self {
        Self::Connectivity(e.to_string())
    }
}
