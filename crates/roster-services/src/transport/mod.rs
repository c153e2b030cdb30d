//! Transport strategies — how presence records move between instances.
//!
//! Exactly one strategy is selected per [`Discovery`](crate::Discovery):
//!   - [`RegistryTransport`]: plain records in a shared key-value store
//!   - [`BroadcastTransport`]: sealed envelopes over UDP subnet broadcast
//!
//! Both expose the same two operations: `publish` one record, and `start`
//! the ingest side feeding an [`IngestSink`].

pub mod broadcast;
pub mod registry;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast as shutdown_channel;
use tokio::task::JoinHandle;

use roster_core::record::unix_now;
use roster_core::PresenceRecord;

pub use broadcast::BroadcastTransport;
pub use registry::{LinkState, RegistryTransport};

use crate::error::DiscoveryError;
use crate::peer_table::PeerTable;

#[derive(Clone)]
pub enum Transport {
    Registry(Arc<RegistryTransport>),
    Broadcast(Arc<BroadcastTransport>),
}

impl Transport {
    /// Announce `record` once.
    pub async fn publish(&self, record: &PresenceRecord) -> Result<(), DiscoveryError> {
        match self {
            Transport::Registry(t) => t.publish(record).await,
            Transport::Broadcast(t) => t.publish(record).await,
        }
    }

    /// Spawn the ingest side. Every returned task exits on `shutdown`.
    pub fn start(
        &self,
        sink: IngestSink,
        interval: Duration,
        shutdown: &shutdown_channel::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        match self {
            Transport::Registry(t) => vec![
                tokio::spawn(registry::ingest_loop(
                    t.clone(),
                    sink,
                    interval,
                    shutdown.subscribe(),
                )),
                tokio::spawn(registry::watchdog_loop(t.clone(), shutdown.subscribe())),
            ],
            Transport::Broadcast(t) => vec![tokio::spawn(broadcast::receive_loop(
                t.clone(),
                sink,
                shutdown.subscribe(),
            ))],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Registry(_) => "registry",
            Transport::Broadcast(_) => "broadcast",
        }
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

/// Lifecycle of a discovery instance.
///
/// `Idle → Starting → Running`, dropping to `Degraded` while the transport
/// is failing and returning to `Running` on the next good cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DiscoveryState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Degraded = 3,
}

impl DiscoveryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Degraded,
            _ => Self::Idle,
        }
    }
}

/// Shared handle on a [`DiscoveryState`].
#[derive(Debug, Clone)]
pub struct Health(Arc<AtomicU8>);

impl Default for Health {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(DiscoveryState::Idle as u8)))
    }
}

impl Health {
    pub fn get(&self) -> DiscoveryState {
        DiscoveryState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: DiscoveryState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// A cycle succeeded.
    pub fn cycle_ok(&self) {
        let prev = self.0.swap(DiscoveryState::Running as u8, Ordering::AcqRel);
        if prev == DiscoveryState::Degraded as u8 {
            tracing::info!("discovery recovered");
        }
    }

    /// A cycle failed.
    pub fn cycle_failed(&self) {
        let prev = self.0.swap(DiscoveryState::Degraded as u8, Ordering::AcqRel);
        if prev != DiscoveryState::Degraded as u8 {
            tracing::warn!("discovery degraded");
        }
    }
}

// ── Ingest sink ───────────────────────────────────────────────────────────────

/// Where transports deliver decoded records.
///
/// Applies the freshness window before anything reaches the peer table, and
/// stores each record only for the part of the window it has left.
#[derive(Clone)]
pub struct IngestSink {
    table: PeerTable,
    window: Duration,
    health: Health,
}

impl IngestSink {
    pub fn new(table: PeerTable, window: Duration, health: Health) -> Self {
        Self {
            table,
            window,
            health,
        }
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Store `record` under `key` if it is fresh. Returns whether it was kept.
    pub fn accept(&self, key: &str, record: PresenceRecord) -> bool {
        self.accept_within(key, record, self.window)
    }

    /// [`accept`](Self::accept), with the entry also gone after `limit`.
    ///
    /// The registry passes the time its key has left, so a peer that
    /// stopped publishing disappears with its key.
    pub fn accept_within(&self, key: &str, record: PresenceRecord, limit: Duration) -> bool {
        let now = unix_now();
        let age = record.age_secs(now);
        let remaining = self
            .window
            .saturating_sub(Duration::from_secs(age.max(0) as u64));
        let lifetime = remaining.min(limit);

        if !record.is_fresh(self.window, now) || lifetime.is_zero() {
            tracing::trace!(
                key,
                name = %record.name,
                age_secs = age,
                "dropping stale record"
            );
            return false;
        }
        tracing::trace!(
            key,
            name = %record.name,
            lifetime_ms = lifetime.as_millis() as u64,
            "peer record accepted"
        );
        self.table.store_for(key, record, lifetime);
        true
    }
}
