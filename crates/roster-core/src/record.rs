//! Presence records — what an instance announces about itself.
//!
//! A record names the instance, says which business root it belongs to,
//! and lists the address it can be reached at for each protocol it offers.
//! The timestamp fields are owned by the codec: they are rewritten on every
//! encode and a received record is only as fresh as its `updated_at`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── ProtocolKind ──────────────────────────────────────────────────────────────

/// Protocols an instance can register an address for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Tcp,
    Http,
    Https,
    Mqtt,
    MqttTls,
    MqttWs,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 6] = [
        ProtocolKind::Tcp,
        ProtocolKind::Http,
        ProtocolKind::Https,
        ProtocolKind::Mqtt,
        ProtocolKind::MqttTls,
        ProtocolKind::MqttWs,
    ];

    /// Canonical lowercase name, as used on the wire and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Http => "http",
            ProtocolKind::Https => "https",
            ProtocolKind::Mqtt => "mqtt",
            ProtocolKind::MqttTls => "mqtt-tls",
            ProtocolKind::MqttWs => "mqtt-ws",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    /// Accepts the canonical names plus `_` in place of `-`, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ProtocolKind::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

// ── PresenceRecord ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Service name peers look this instance up by.
    pub name: String,
    #[serde(default)]
    pub alias: String,
    /// The instance's own local address, as opposed to the registered ones.
    #[serde(default)]
    pub source_address: String,
    /// Business root. Only instances sharing a root see each other.
    #[serde(default)]
    pub root_path: String,
    #[serde(default)]
    pub registered_addresses: BTreeMap<ProtocolKind, String>,
    /// Unix seconds of the last encode.
    #[serde(default)]
    pub updated_at: i64,
    /// `updated_at` rendered as `YYYY-MM-DD HH:MM:SS` UTC, for humans only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_time: String,
}

impl PresenceRecord {
    /// Create a record. An empty `name` is replaced by a clock-derived one.
    pub fn new(name: impl Into<String>, root_path: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = default_name();
        }
        Self {
            name,
            alias: String::new(),
            source_address: String::new(),
            root_path: root_path.into(),
            registered_addresses: BTreeMap::new(),
            updated_at: 0,
            updated_time: String::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_address = source.into();
        self
    }

    pub fn with_address(mut self, protocol: ProtocolKind, address: impl Into<String>) -> Self {
        self.registered_addresses.insert(protocol, address.into());
        self
    }

    /// Address registered for `protocol`, if the instance offers it.
    pub fn address(&self, protocol: ProtocolKind) -> Option<&str> {
        self.registered_addresses.get(&protocol).map(String::as_str)
    }

    /// Stamp the record with the current time.
    pub fn touch(&mut self) {
        self.updated_at = unix_now();
        self.updated_time = format_utc(self.updated_at);
    }

    /// Seconds since the last encode. Negative if the sender's clock is ahead.
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.updated_at
    }

    /// True if the record is no older than `window` at time `now`.
    pub fn is_fresh(&self, window: Duration, now: i64) -> bool {
        self.age_secs(now) <= window.as_secs() as i64
    }

    /// Compact JSON form, as exported by peer listings.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Time helpers ──────────────────────────────────────────────────────────────

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in microseconds.
pub fn unix_now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// `x_HHMMSS.mmm` from the UTC wall clock.
fn default_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() % 86_400;
    format!(
        "x_{:02}{:02}{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}

/// Render unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_utc(unix_secs: i64) -> String {
    let days = unix_secs.div_euclid(86_400);
    let rem = unix_secs.rem_euclid(86_400);

    // Civil-from-days over the 400-year era.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}
