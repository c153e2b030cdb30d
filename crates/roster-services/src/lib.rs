//! roster-services — peer presence discovery.
//!
//! The [`Discovery`] orchestrator publishes this instance's record and
//! ingests peers' records over one [`Transport`], keeping the latest of
//! each in a TTL-bounded [`PeerTable`].

pub mod discovery;
pub mod error;
pub mod peer_table;
pub mod store;
pub mod transport;

pub use discovery::{Discovery, DiscoverySettings, TransportSettings};
pub use error::DiscoveryError;
pub use peer_table::{PeerEntry, PeerTable};
pub use store::{MemoryStore, RedisStore, RegistryStore, StoreError};
pub use transport::{DiscoveryState, IngestSink, Transport};
