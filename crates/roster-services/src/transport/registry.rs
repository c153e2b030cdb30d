//! Registry transport — presence through a shared key-value store.
//!
//! Each instance writes its plain-encoded record under
//! `{root}/discover/{name}/{instance_started}` with the freshness window as
//! store-side TTL, and reads back everything under `{root}/discover/*`.
//! A crashed instance's key simply expires, and ingested entries expire
//! with the key they were read from.
//!
//! The link state is written only by the initial connect and the watchdog.
//! Publish and ingest read it and fail fast while the link is not ready.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use roster_core::codec::{discover_key, discover_prefix};
use roster_core::{Codec, PresenceRecord};

use super::IngestSink;
use crate::error::DiscoveryError;
use crate::store::{RegistryStore, StoreError};

/// Registry connection lifecycle: `Disconnected → Connecting → Ready → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Ready,
            _ => Self::Disconnected,
        }
    }
}

pub struct RegistryTransport {
    store: Arc<dyn RegistryStore>,
    codec: Codec,
    /// This instance's key.
    key: String,
    /// Glob matching every instance under the same root.
    pattern: String,
    /// Store-side TTL; the freshness window.
    ttl: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    reconnect_interval: Duration,
    link: AtomicU8,
}

impl RegistryTransport {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        record: &PresenceRecord,
        ttl: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
        reconnect_interval: Duration,
    ) -> Self {
        let codec = Codec::plain();
        let key = discover_key(&record.root_path, &record.name, codec.instance_started());
        let pattern = format!("{}*", discover_prefix(&record.root_path));
        Self {
            store,
            codec,
            key,
            pattern,
            ttl,
            read_timeout,
            write_timeout,
            reconnect_interval,
            link: AtomicU8::new(LinkState::Disconnected as u8),
        }
    }

    /// Key this instance publishes under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Acquire))
    }

    fn set_link(&self, state: LinkState) {
        self.link.store(state as u8, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    /// Connect once. On failure the link stays down and the watchdog retries.
    pub async fn connect(&self) -> Result<(), DiscoveryError> {
        self.set_link(LinkState::Connecting);
        let result = match timeout(self.write_timeout, self.store.connect()).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout(self.write_timeout)),
        };
        match result {
            Ok(()) => {
                self.set_link(LinkState::Ready);
                tracing::info!(store = %self.store.describe(), "registry connected");
                Ok(())
            }
            Err(e) => {
                self.set_link(LinkState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Write this instance's record with a fresh timestamp.
    pub async fn publish(&self, record: &PresenceRecord) -> Result<(), DiscoveryError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady.into());
        }
        let payload = self.codec.encode(record)?;
        let payload = String::from_utf8(payload)
            .map_err(|e| DiscoveryError::Configuration(format!("record is not UTF-8: {e}")))?;

        timeout(self.write_timeout, self.store.set(&self.key, &payload, self.ttl))
            .await
            .map_err(|_| StoreError::Timeout(self.write_timeout))??;
        tracing::trace!(key = %self.key, "published to registry");
        Ok(())
    }

    /// One ingest pass: list, read, decode, filter, store. Each entry lives
    /// no longer than the registry key it came from.
    ///
    /// Per-key failures are skipped; only listing failures fail the pass.
    /// Returns how many records were accepted.
    pub async fn ingest(&self, sink: &IngestSink) -> Result<usize, DiscoveryError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady.into());
        }
        let keys = timeout(self.read_timeout, self.store.keys_matching(&self.pattern))
            .await
            .map_err(|_| StoreError::Timeout(self.read_timeout))??;

        let mut accepted = 0;
        for key in keys {
            let read = timeout(self.read_timeout, self.store.get_with_expiry(&key)).await;
            let (value, left) = match read {
                Ok(Ok(Some(entry))) => entry,
                // Expired between KEYS and GET.
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::debug!(key = %key, error = %e, "registry read failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(key = %key, "registry read timed out");
                    continue;
                }
            };
            match self.codec.decode(value.as_bytes()) {
                Ok(decoded) => {
                    if sink.accept_within(&key, decoded.record, left) {
                        accepted += 1;
                    }
                }
                Err(e) => tracing::debug!(key = %key, error = %e, "dropping undecodable registry entry"),
            }
        }
        Ok(accepted)
    }

    /// One watchdog pass: probe a ready link, reconnect a dead one.
    async fn check_link(&self) {
        match self.link_state() {
            LinkState::Ready => {
                let probe = match timeout(self.read_timeout, self.store.ping()).await {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Timeout(self.read_timeout)),
                };
                if let Err(e) = probe {
                    self.set_link(LinkState::Disconnected);
                    tracing::warn!(error = %e, "registry connection lost");
                }
            }
            LinkState::Disconnected => {
                if let Err(e) = self.connect().await {
                    tracing::debug!(error = %e, "registry reconnect failed");
                }
            }
            LinkState::Connecting => {}
        }
    }
}

/// Ingest on every tick until shutdown.
pub async fn ingest_loop(
    transport: Arc<RegistryTransport>,
    sink: IngestSink,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }

        match transport.ingest(&sink).await {
            Ok(accepted) => {
                tracing::trace!(accepted, "registry ingest pass");
                sink.health().cycle_ok();
            }
            Err(e) => {
                tracing::warn!(error = %e, "registry ingest skipped");
                sink.health().cycle_failed();
            }
        }
    }

    tracing::debug!("registry ingest stopped");
}

/// Keep the registry link alive until shutdown.
pub async fn watchdog_loop(transport: Arc<RegistryTransport>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(transport.reconnect_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }
        transport.check_link().await;
    }

    tracing::debug!("registry watchdog stopped");
}
