//! Envelope codec — PresenceRecord to transport payload and back.
//!
//! Two modes:
//!   - plain:  the record's JSON. Used inside the shared registry, which only
//!             authenticated clients can reach.
//!   - sealed: the record's JSON encrypted to the deployment key, base64'd,
//!             signed, and wrapped in an [`Envelope`]. Used on broadcast,
//!             where any host on the subnet can inject datagrams.
//!
//! Both modes restamp the record's update time on every encode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::DiscoveryKeys;
use crate::record::{unix_now_micros, PresenceRecord};

/// Largest sealed envelope we will emit. Receivers read into a buffer of
/// this size, so anything larger would arrive truncated.
pub const MAX_ENVELOPE_SIZE: usize = 4096;

/// Key prefix shared by every instance under `root_path`.
pub fn discover_prefix(root_path: &str) -> String {
    format!("{root_path}/discover/")
}

/// Per-instance key: `{root_path}/discover/{name}/{instance_started}`.
///
/// Used as the registry key and as the envelope routing key, so an instance
/// keeps the same peer-table key for its whole lifetime.
pub fn discover_key(root_path: &str, name: &str, instance_started: i64) -> String {
    format!("{}{name}/{instance_started}", discover_prefix(root_path))
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Sealed wire wrapper for broadcast announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Informational; identifies the sender's peer-table slot.
    pub routing_key: String,
    /// Base64 ECIES ciphertext of the record JSON.
    pub payload: String,
    /// Base64 Ed25519 signature over the bytes of `payload`.
    pub signature: String,
}

/// A successfully decoded payload.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub record: PresenceRecord,
    /// Present for sealed payloads only.
    pub routing_key: Option<String>,
    /// BLAKE3 hex digest of the signed payload; sealed payloads only.
    /// Every replay of one announcement has the same fingerprint.
    pub fingerprint: Option<String>,
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Codec {
    keys: Option<Arc<DiscoveryKeys>>,
    /// Unix micros at construction; stands in for the instance start time.
    instance_started: i64,
}

impl Codec {
    /// Codec for the trusted registry path.
    pub fn plain() -> Self {
        Self {
            keys: None,
            instance_started: unix_now_micros(),
        }
    }

    /// Codec for the broadcast path.
    pub fn sealed(keys: Arc<DiscoveryKeys>) -> Self {
        Self {
            keys: Some(keys),
            instance_started: unix_now_micros(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.keys.is_some()
    }

    pub fn instance_started(&self) -> i64 {
        self.instance_started
    }

    /// The key this instance's record is published under.
    pub fn routing_key(&self, record: &PresenceRecord) -> String {
        discover_key(&record.root_path, &record.name, self.instance_started)
    }

    /// Stamp a copy of `record` with the current time and serialize it.
    pub fn encode(&self, record: &PresenceRecord) -> Result<Vec<u8>, CodecError> {
        let mut record = record.clone();
        record.touch();
        let json = serde_json::to_vec(&record).map_err(|e| CodecError::Encode(e.to_string()))?;

        let Some(keys) = &self.keys else {
            return Ok(json);
        };

        let payload = keys
            .encrypt(&json)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let signature = keys.sign(payload.as_bytes());
        let envelope = Envelope {
            routing_key: self.routing_key(&record),
            payload,
            signature,
        };

        let bytes =
            serde_json::to_vec(&envelope).map_err(|e| CodecError::Encode(e.to_string()))?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(CodecError::Encode(format!(
                "envelope is {} bytes, limit is {MAX_ENVELOPE_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Parse a payload produced by a peer's [`encode`](Self::encode).
    ///
    /// Sealed payloads are verified before anything is decrypted.
    pub fn decode(&self, payload: &[u8]) -> Result<Decoded, CodecError> {
        let Some(keys) = &self.keys else {
            let record = serde_json::from_slice(payload)
                .map_err(|e| CodecError::Decode(format!("record: {e}")))?;
            return Ok(Decoded {
                record,
                routing_key: None,
                fingerprint: None,
            });
        };

        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| CodecError::Decode(format!("envelope: {e}")))?;

        keys.verify(&envelope.signature, envelope.payload.as_bytes())
            .map_err(|_| CodecError::Authentication)?;

        let json = keys
            .decrypt(&envelope.payload)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let record = serde_json::from_slice(&json)
            .map_err(|e| CodecError::Decode(format!("record: {e}")))?;

        let fingerprint = blake3::hash(envelope.payload.as_bytes()).to_hex().to_string();
        Ok(Decoded {
            record,
            routing_key: Some(envelope.routing_key),
            fingerprint: Some(fingerprint),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    /// Envelope signature did not verify against the deployment key.
    #[error("envelope signature verification failed")]
    Authentication,

    /// Malformed JSON, bad base64, or undecryptable payload.
    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error("failed to encode record: {0}")]
    Encode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
