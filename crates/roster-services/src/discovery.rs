//! Discovery — the orchestrator the host service talks to.
//!
//! Owns the peer table and one transport. On start it spawns:
//!   1. publish loop: announce our record every publish interval
//!   2. the transport's ingest side (registry poll + watchdog, or the
//!      broadcast receive loop)
//!   3. peer table expiry
//!
//! All of them stop on [`Discovery::shutdown`]. In-flight I/O is allowed to
//! finish; tasks exit at their next suspension point. The transport is
//! dropped afterwards, closing the UDP socket or the registry handle.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use roster_core::config::{DiscoveryConfig, TransportKind};
use roster_core::{DiscoveryKeys, PresenceRecord, ProtocolKind};

use crate::error::DiscoveryError;
use crate::peer_table::{expiry_loop, PeerTable};
use crate::store::{RedisStore, RegistryStore};
use crate::transport::{
    BroadcastTransport, DiscoveryState, Health, IngestSink, RegistryTransport, Transport,
};

/// How often expired peer entries are physically removed.
const EXPIRY_SWEEP: Duration = Duration::from_secs(1);

// ── Settings ──────────────────────────────────────────────────────────────────

pub enum TransportSettings {
    Registry {
        store: Arc<dyn RegistryStore>,
        read_timeout: Duration,
        write_timeout: Duration,
        reconnect_interval: Duration,
    },
    Broadcast {
        port: u16,
        address: Ipv4Addr,
        keys: Arc<DiscoveryKeys>,
    },
}

pub struct DiscoverySettings {
    pub publish_interval: Duration,
    /// Max record age, and the TTL of peer table and registry entries.
    pub freshness_window: Duration,
    pub transport: TransportSettings,
}

impl DiscoverySettings {
    /// Build settings from the `[discovery]` config section.
    ///
    /// Invalid values are rejected; nothing is reclamped here.
    pub fn from_config(cfg: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        cfg.validate()?;

        let transport = match cfg.transport {
            TransportKind::Registry => {
                let store = RedisStore::open(&cfg.registry.url)
                    .map_err(|e| DiscoveryError::Configuration(format!("registry url: {e}")))?;
                TransportSettings::Registry {
                    store: Arc::new(store),
                    read_timeout: cfg.registry.read_timeout(),
                    write_timeout: cfg.registry.write_timeout(),
                    reconnect_interval: cfg.registry.reconnect_interval(),
                }
            }
            TransportKind::Broadcast => {
                if cfg.uses_default_seed() {
                    tracing::warn!(
                        "discovery.key_seed not set; using the built-in seed, \
                         announcements are readable by anyone with this build"
                    );
                }
                if cfg.broadcast.port() != cfg.broadcast.port {
                    tracing::warn!(
                        configured = cfg.broadcast.port,
                        using = cfg.broadcast.port(),
                        "broadcast port clamped"
                    );
                }
                TransportSettings::Broadcast {
                    port: cfg.broadcast.port(),
                    address: cfg.broadcast.address()?,
                    keys: Arc::new(cfg.keys()?),
                }
            }
        };

        Ok(Self {
            publish_interval: cfg.publish_interval(),
            freshness_window: cfg.freshness_window(),
            transport,
        })
    }

    fn validate(&self) -> Result<(), DiscoveryError> {
        if self.publish_interval.is_zero() {
            return Err(DiscoveryError::Configuration("publish interval is zero".into()));
        }
        if self.freshness_window <= self.publish_interval {
            return Err(DiscoveryError::Configuration(format!(
                "freshness window {:?} must exceed publish interval {:?}",
                self.freshness_window, self.publish_interval
            )));
        }
        Ok(())
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

pub struct Discovery {
    record: PresenceRecord,
    /// Key under which peers see this instance.
    own_key: String,
    table: PeerTable,
    transport_name: &'static str,
    /// Taken on shutdown.
    transport: Mutex<Option<Transport>>,
    health: Health,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Select the transport, start publishing and ingesting.
    ///
    /// Only configuration errors and a failed socket bind are returned. A
    /// registry that is down at start leaves discovery `Degraded` while the
    /// watchdog keeps retrying.
    pub async fn start(
        record: PresenceRecord,
        settings: DiscoverySettings,
    ) -> Result<Self, DiscoveryError> {
        settings.validate()?;

        let health = Health::default();
        health.set(DiscoveryState::Starting);

        let table = PeerTable::new(settings.freshness_window);

        let (transport, own_key) = match settings.transport {
            TransportSettings::Registry {
                store,
                read_timeout,
                write_timeout,
                reconnect_interval,
            } => {
                let t = RegistryTransport::new(
                    store,
                    &record,
                    settings.freshness_window,
                    read_timeout,
                    write_timeout,
                    reconnect_interval,
                );
                if let Err(e) = t.connect().await {
                    tracing::warn!(error = %e, "registry unavailable at start, will retry");
                    health.set(DiscoveryState::Degraded);
                }
                let key = t.key().to_string();
                (Transport::Registry(Arc::new(t)), key)
            }
            TransportSettings::Broadcast { port, address, keys } => {
                let t = BroadcastTransport::bind(port, address, keys, &record.root_path)?;
                let key = t.routing_key(&record);
                (Transport::Broadcast(Arc::new(t)), key)
            }
        };

        let (shutdown, _) = broadcast::channel::<()>(1);
        let sink = IngestSink::new(table.clone(), settings.freshness_window, health.clone());

        let mut tasks = transport.start(sink, settings.publish_interval, &shutdown);
        tasks.push(tokio::spawn(publish_loop(
            transport.clone(),
            record.clone(),
            health.clone(),
            settings.publish_interval,
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(expiry_loop(
            table.clone(),
            EXPIRY_SWEEP,
            shutdown.subscribe(),
        )));

        if health.get() == DiscoveryState::Starting {
            health.set(DiscoveryState::Running);
        }

        tracing::info!(
            name = %record.name,
            root = %record.root_path,
            transport = transport.name(),
            key = %own_key,
            interval_secs = settings.publish_interval.as_secs(),
            window_secs = settings.freshness_window.as_secs(),
            "discovery started"
        );

        Ok(Self {
            record,
            own_key,
            table,
            transport_name: transport.name(),
            transport: Mutex::new(Some(transport)),
            health,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Address of a live peer named `name` offering `protocol`.
    pub fn find_service(&self, name: &str, protocol: ProtocolKind) -> Result<String, DiscoveryError> {
        self.table
            .lookup(|_, r| r.name == name && r.address(protocol).is_some())
            .and_then(|(_, r)| r.address(protocol).map(str::to_string))
            .ok_or_else(|| DiscoveryError::NotFound {
                name: name.to_string(),
                protocol,
            })
    }

    /// Point-in-time copy of every live peer, keyed by peer key.
    pub fn list_all(&self) -> BTreeMap<String, PresenceRecord> {
        self.table.snapshot()
    }

    /// [`list_all`](Self::list_all) with each record rendered as JSON.
    pub fn list_all_json(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.table.for_each(|key, record| {
            out.insert(key.to_string(), record.to_json());
        });
        out
    }

    pub fn state(&self) -> DiscoveryState {
        self.health.get()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.table
    }

    /// The record this instance announces.
    pub fn record(&self) -> &PresenceRecord {
        &self.record
    }

    pub fn own_key(&self) -> &str {
        &self.own_key
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }

    /// Signal every task to stop and wait for them. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "discovery task ended abnormally");
            }
        }
        let transport = match self.transport.lock() {
            Ok(mut t) => t.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(transport);
        self.health.set(DiscoveryState::Idle);
        tracing::info!(name = %self.record.name, "discovery stopped");
    }
}

/// Announce `record` every `period` until shutdown. The first announcement
/// goes out immediately.
async fn publish_loop(
    transport: Transport,
    record: PresenceRecord,
    health: Health,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }

        match transport.publish(&record).await {
            Ok(()) => health.cycle_ok(),
            Err(e) => {
                tracing::warn!(error = %e, transport = transport.name(), "publish skipped");
                health.cycle_failed();
            }
        }
    }

    tracing::debug!("publish loop stopped");
}
