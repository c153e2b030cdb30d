//! roster-core — presence records, the envelope codec, the broadcast key
//! pair, and configuration. All other Roster crates depend on this one.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod record;

pub use codec::{Codec, CodecError, Decoded, Envelope};
pub use crypto::{CryptoError, DiscoveryKeys};
pub use record::{PresenceRecord, ProtocolKind};
