//! Peer table — the most recently accepted presence record per peer key.
//!
//! A concurrent map from peer key (registry key or envelope routing key) to
//! the last record accepted for it. Every store restarts that entry's TTL,
//! optionally shortened so the entry never outlives its record's
//! freshness. Expired entries are hidden from reads immediately; [`expiry_loop`]
//! removes them physically.
//!
//! Time is measured on tokio's clock so tests can pause and advance it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use roster_core::PresenceRecord;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub record: PresenceRecord,
    /// When this entry was last stored.
    pub last_seen: Instant,
    /// Past this instant the entry is invisible.
    pub expires_at: Instant,
}

impl PeerEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared between the ingest tasks (writers) and the host service (readers).
///
/// Cloning is cheap and yields a handle to the same table. Visitors passed
/// to [`lookup`](Self::lookup) and [`for_each`](Self::for_each) run while a
/// shard lock is held and must not call back into the table.
#[derive(Clone)]
pub struct PeerTable {
    entries: Arc<DashMap<String, PeerEntry>>,
    ttl: Duration,
}

impl PeerTable {
    /// Create an empty table whose entries live for `ttl` after each store.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Upsert `record` under `key` and restart its TTL.
    pub fn store(&self, key: impl Into<String>, record: PresenceRecord) {
        self.store_for(key, record, self.ttl);
    }

    /// Upsert `record` under `key`, visible for `lifetime` but never past
    /// the table TTL.
    pub fn store_for(&self, key: impl Into<String>, record: PresenceRecord, lifetime: Duration) {
        let now = Instant::now();
        self.entries.insert(
            key.into(),
            PeerEntry {
                record,
                last_seen: now,
                expires_at: now + lifetime.min(self.ttl),
            },
        );
    }

    /// Live record for `key`, if any.
    pub fn get(&self, key: &str) -> Option<PresenceRecord> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.record.clone())
    }

    /// First live entry matching `predicate`. Stops scanning on a match.
    pub fn lookup<F>(&self, mut predicate: F) -> Option<(String, PresenceRecord)>
    where
        F: FnMut(&str, &PresenceRecord) -> bool,
    {
        let now = Instant::now();
        self.entries
            .iter()
            .find(|e| e.is_live(now) && predicate(e.key().as_str(), &e.record))
            .map(|e| (e.key().clone(), e.record.clone()))
    }

    /// Visit every live entry.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &PresenceRecord),
    {
        let now = Instant::now();
        for e in self.entries.iter() {
            if e.is_live(now) {
                visitor(e.key().as_str(), &e.record);
            }
        }
    }

    /// Point-in-time copy of every live entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, PresenceRecord> {
        let mut out = BTreeMap::new();
        self.for_each(|key, record| {
            out.insert(key.to_string(), record.clone());
        });
        out
    }

    /// Live entries with their timing, for diagnostics.
    pub fn entries(&self) -> Vec<(String, PeerEntry)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, key: &str) -> Option<PresenceRecord> {
        self.entries.remove(key).map(|(_, e)| e.record)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Periodically remove expired entries until shutdown.
pub async fn expiry_loop(table: PeerTable, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }

        let removed = table.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "expired peer table entries");
        }
    }

    tracing::debug!("peer table expiry stopped");
}
