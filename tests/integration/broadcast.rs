use std::sync::Arc;
use std::time::Duration;

use roster_core::{Codec, CodecError, DiscoveryKeys, ProtocolKind};
use roster_services::{Discovery, DiscoveryError};

use crate::*;

/// Send one sealed announcement for `record` to the receiver's port.
fn announce(codec: &Codec, port: u16, record: &roster_core::PresenceRecord) {
    let bytes = codec.encode(record).unwrap();
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(&bytes, ("127.0.0.1", port)).unwrap();
}

#[tokio::test]
async fn test_same_key_peer_is_discovered() {
    let keys = Arc::new(DiscoveryKeys::from_seed(&[11u8; 32]));
    let port = free_udp_port();
    let receiver = Discovery::start(
        record("svc-r", "10.0.0.1:8080"),
        broadcast_settings(port, keys.clone()),
    )
    .await
    .unwrap();

    let friend = Codec::sealed(keys);
    let friend_record = record("svc-b", "10.0.0.6:8080");
    announce(&friend, port, &friend_record);

    wait_for(Duration::from_secs(2), || {
        receiver.find_service("svc-b", ProtocolKind::Http).is_ok()
    })
    .await
    .unwrap();
    assert_eq!(
        receiver.find_service("svc-b", ProtocolKind::Http).unwrap(),
        "10.0.0.6:8080"
    );
    assert!(receiver
        .list_all()
        .contains_key(&friend.routing_key(&friend_record)));

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_foreign_key_peer_is_never_listed() {
    let port = free_udp_port();
    let keys = Arc::new(DiscoveryKeys::from_seed(&[11u8; 32]));
    let receiver = Discovery::start(
        record("svc-r", "10.0.0.1:8080"),
        broadcast_settings(port, keys.clone()),
    )
    .await
    .unwrap();

    let intruder = Codec::sealed(Arc::new(DiscoveryKeys::from_seed(&[12u8; 32])));
    let evil = record("svc-evil", "6.6.6.6:80");

    // The receiver's codec rejects it outright.
    let bytes = intruder.encode(&evil).unwrap();
    assert!(matches!(
        Codec::sealed(keys.clone()).decode(&bytes),
        Err(CodecError::Authentication)
    ));

    for _ in 0..5 {
        announce(&intruder, port, &evil);
    }
    // A legitimate datagram sent after the forged ones marks the point at
    // which all of them have been processed.
    announce(&Codec::sealed(keys), port, &record("svc-b", "10.0.0.6:8080"));
    wait_for(Duration::from_secs(2), || {
        receiver.find_service("svc-b", ProtocolKind::Http).is_ok()
    })
    .await
    .unwrap();

    assert!(receiver.list_all().values().all(|r| r.name != "svc-evil"));
    assert!(matches!(
        receiver.find_service("svc-evil", ProtocolKind::Http),
        Err(DiscoveryError::NotFound { .. })
    ));

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_instance_hears_its_own_announcement() {
    let port = free_udp_port();
    let keys = Arc::new(DiscoveryKeys::generate());
    let d = Discovery::start(record("svc-a", "10.0.0.5:8080"), broadcast_settings(port, keys))
        .await
        .unwrap();

    wait_for(Duration::from_secs(2), || d.list_all().contains_key(d.own_key()))
        .await
        .unwrap();
    assert_eq!(d.transport_name(), "broadcast");

    d.shutdown().await;
}

#[tokio::test]
async fn test_garbage_datagrams_do_not_stop_the_listener() {
    let port = free_udp_port();
    let keys = Arc::new(DiscoveryKeys::generate());
    let receiver = Discovery::start(
        record("svc-r", "10.0.0.1:8080"),
        broadcast_settings(port, keys.clone()),
    )
    .await
    .unwrap();

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let junk: [&[u8]; 4] = [b"", b"{", b"{\"routing_key\":1}", &[0xff; 600]];
    for junk in junk {
        socket.send_to(junk, ("127.0.0.1", port)).unwrap();
    }

    announce(&Codec::sealed(keys), port, &record("svc-b", "10.0.0.6:8080"));
    wait_for(Duration::from_secs(2), || {
        receiver.find_service("svc-b", ProtocolKind::Http).is_ok()
    })
    .await
    .unwrap();

    receiver.shutdown().await;
}
