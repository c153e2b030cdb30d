//! rosterd — Roster presence discovery daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use roster_api::ApiState;
use roster_core::config::RosterConfig;
use roster_services::{Discovery, DiscoveryError, DiscoverySettings};

/// Interval between peer table summaries at debug level.
const PEER_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RosterConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RosterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RosterConfig::default()
    });

    let record = config
        .identity
        .to_record()
        .context("invalid [identity] section")?;
    tracing::info!(
        name = %record.name,
        root = %record.root_path,
        protocols = record.registered_addresses.len(),
        "rosterd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Discovery ────────────────────────────────────────────────────────────
    // A socket that cannot be bound yet is retried; bad configuration is fatal.
    let retry = config.discovery.registry.reconnect_interval();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let discovery = loop {
        let settings = DiscoverySettings::from_config(&config.discovery)
            .context("invalid [discovery] section")?;
        match Discovery::start(record.clone(), settings).await {
            Ok(d) => break Arc::new(d),
            Err(DiscoveryError::Connectivity(e)) => {
                tracing::warn!(error = %e, retry_secs = retry.as_secs(), "discovery unavailable");
            }
            Err(e) => return Err(e).context("failed to start discovery"),
        }
        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = shutdown_rx.recv() => return Ok(()),
        }
    };

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let api_task = {
        let state = ApiState {
            discovery: discovery.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = roster_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    let peer_printer = {
        let discovery = discovery.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PEER_LOG_INTERVAL);
            loop {
                interval.tick().await;
                let peers = discovery.list_all();
                tracing::debug!(
                    count = peers.len(),
                    state = ?discovery.state(),
                    "peer table"
                );
                for (key, record) in &peers {
                    tracing::trace!(key = %key, record = %record.to_json(), "peer");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
        r = peer_printer       => tracing::error!("peer printer exited: {:?}", r),
    }

    discovery.shutdown().await;
    Ok(())
}
