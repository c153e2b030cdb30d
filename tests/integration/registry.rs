use std::time::Duration;

use roster_core::record::unix_now;
use roster_core::ProtocolKind;
use roster_services::{Discovery, DiscoveryError, DiscoveryState, MemoryStore, RegistryStore};

use crate::*;

#[tokio::test(start_paused = true)]
async fn test_peer_visible_within_one_interval_then_expires() {
    let store = MemoryStore::new();
    let x = Discovery::start(record("svc-a", "10.0.0.5:8080"), registry_settings(&store))
        .await
        .unwrap();
    let y = Discovery::start(record("svc-b", "10.0.0.6:8080"), registry_settings(&store))
        .await
        .unwrap();

    tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(
        y.find_service("svc-a", ProtocolKind::Http).unwrap(),
        "10.0.0.5:8080"
    );
    assert_eq!(
        x.find_service("svc-b", ProtocolKind::Http).unwrap(),
        "10.0.0.6:8080"
    );

    // X last published at t=1s. Half a second past the window it is gone.
    x.shutdown().await;
    tokio::time::sleep(WINDOW + Duration::from_millis(400)).await;

    assert!(matches!(
        y.find_service("svc-a", ProtocolKind::Http),
        Err(DiscoveryError::NotFound { .. })
    ));
    assert!(!y.list_all().contains_key(x.own_key()));
    // Y itself is still announcing.
    assert!(y.list_all().contains_key(y.own_key()));

    y.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_registry_entry_never_visible() {
    let store = MemoryStore::new();

    let mut old = record("svc-old", "10.0.0.9:8080");
    old.updated_at = unix_now() - 10;
    store
        .set(
            "/acme/discover/svc-old/1",
            &serde_json::to_string(&old).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let y = Discovery::start(record("svc-b", "10.0.0.6:8080"), registry_settings(&store))
        .await
        .unwrap();
    tokio::time::sleep(INTERVAL * 3).await;

    assert!(y.find_service("svc-old", ProtocolKind::Http).is_err());
    assert!(y.list_all().values().all(|r| r.name != "svc-old"));
    y.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_registry_outage_is_survived() {
    let store = MemoryStore::new();
    let x = Discovery::start(record("svc-a", "10.0.0.5:8080"), registry_settings(&store))
        .await
        .unwrap();
    let y = Discovery::start(record("svc-b", "10.0.0.6:8080"), registry_settings(&store))
        .await
        .unwrap();
    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(y.state(), DiscoveryState::Running);

    store.set_available(false);
    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(y.state(), DiscoveryState::Degraded);

    // Long enough for the stored entries to lapse too.
    tokio::time::sleep(WINDOW * 2).await;
    assert!(y.find_service("svc-a", ProtocolKind::Http).is_err());

    store.set_available(true);
    tokio::time::sleep(INTERVAL * 4).await;
    assert_eq!(y.state(), DiscoveryState::Running);
    assert_eq!(
        y.find_service("svc-a", ProtocolKind::Http).unwrap(),
        "10.0.0.5:8080"
    );

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_roots_are_isolated() {
    let store = MemoryStore::new();
    let x = Discovery::start(
        roster_core::PresenceRecord::new("svc-a", "/other")
            .with_address(ProtocolKind::Http, "10.0.0.5:8080"),
        registry_settings(&store),
    )
    .await
    .unwrap();
    let y = Discovery::start(record("svc-b", "10.0.0.6:8080"), registry_settings(&store))
        .await
        .unwrap();

    tokio::time::sleep(INTERVAL * 3).await;
    assert!(y.find_service("svc-a", ProtocolKind::Http).is_err());
    assert!(x.find_service("svc-b", ProtocolKind::Http).is_err());

    x.shutdown().await;
    y.shutdown().await;
}
