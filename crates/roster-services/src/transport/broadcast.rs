//! Broadcast transport — sealed envelopes over UDP subnet broadcast.
//!
//! One socket per instance, bound to `0.0.0.0:{port}` with address and port
//! reuse so several instances on a host can share the port. The same socket
//! sends to the broadcast address and receives from peers.
//!
//! Anyone on the subnet can inject datagrams, so every envelope is verified
//! and decrypted before the record is trusted. The routing key is not
//! signed: it must name the record's own root and service, and one signed
//! payload may occupy only one key. Failures are dropped at debug level
//! and never interrupt the receive loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;

use roster_core::codec::{discover_prefix, MAX_ENVELOPE_SIZE};
use roster_core::{Codec, CodecError, Decoded, DiscoveryKeys, PresenceRecord};

use super::IngestSink;
use crate::error::DiscoveryError;

pub struct BroadcastTransport {
    socket: UdpSocket,
    dest: SocketAddrV4,
    codec: Codec,
    /// Only records under this root are ingested.
    root_path: String,
    /// Payload fingerprint → (routing key it first arrived under, when).
    claims: DashMap<String, (String, Instant)>,
}

impl BroadcastTransport {
    /// Bind the shared socket. Must be called inside a tokio runtime.
    ///
    /// A bind failure is a connectivity error; `address` must be an IPv4
    /// broadcast or unicast address. Peers outside `root_path` are ignored.
    pub fn bind(
        port: u16,
        address: Ipv4Addr,
        keys: Arc<DiscoveryKeys>,
        root_path: &str,
    ) -> Result<Self, DiscoveryError> {
        if port == 0 {
            return Err(DiscoveryError::Configuration("broadcast port 0".into()));
        }
        if address.is_unspecified() || address.is_multicast() {
            return Err(DiscoveryError::Configuration(format!(
                "{address} is not a usable broadcast destination"
            )));
        }

        let socket = make_broadcast_socket(port)
            .map_err(|e| DiscoveryError::Connectivity(format!("bind udp {port}: {e}")))?;
        let socket = UdpSocket::from_std(socket)
            .map_err(|e| DiscoveryError::Connectivity(format!("register udp socket: {e}")))?;

        tracing::info!(
            port,
            dest = %address,
            key = %keys.fingerprint(),
            "broadcast transport bound"
        );

        Ok(Self {
            socket,
            dest: SocketAddrV4::new(address, port),
            codec: Codec::sealed(keys),
            root_path: root_path.to_string(),
            claims: DashMap::new(),
        })
    }

    /// Routing key this instance's envelopes carry.
    pub fn routing_key(&self, record: &PresenceRecord) -> String {
        self.codec.routing_key(record)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Seal `record` and send it to the broadcast address.
    pub async fn publish(&self, record: &PresenceRecord) -> Result<(), DiscoveryError> {
        let bytes = self.codec.encode(record)?;
        let n = self
            .socket
            .send_to(&bytes, self.dest)
            .await
            .map_err(|e| DiscoveryError::Connectivity(format!("send to {}: {e}", self.dest)))?;
        tracing::trace!(bytes = n, dest = %self.dest, "broadcast sent");
        Ok(())
    }

    /// Verify, decrypt, and hand one datagram to the sink.
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr, sink: &IngestSink) {
        match self.codec.decode(datagram) {
            Ok(decoded) => self.ingest(decoded, from, sink),
            Err(CodecError::Authentication) => {
                tracing::debug!(%from, "dropping envelope with bad signature");
            }
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping undecodable datagram");
            }
        }
    }

    fn ingest(&self, decoded: Decoded, from: SocketAddr, sink: &IngestSink) {
        let record = decoded.record;
        if record.root_path != self.root_path {
            tracing::debug!(
                %from,
                root = %record.root_path,
                "dropping record from another root"
            );
            return;
        }
        let (Some(key), Some(fingerprint)) = (decoded.routing_key, decoded.fingerprint) else {
            tracing::debug!(%from, "dropping envelope without routing key");
            return;
        };
        if !key_matches_record(&key, &record) {
            tracing::debug!(
                %from,
                key = %key,
                name = %record.name,
                "dropping envelope with foreign routing key"
            );
            return;
        }
        if !self.claim(&fingerprint, &key, sink.window()) {
            tracing::debug!(%from, key = %key, "dropping replayed envelope");
            return;
        }
        sink.accept(&key, record);
    }

    /// Note that the payload `fingerprint` arrived under `key`. False if the
    /// same payload was already seen under a different key.
    ///
    /// Claims older than `window` are forgotten; by then the record inside
    /// is stale anyway.
    fn claim(&self, fingerprint: &str, key: &str, window: Duration) -> bool {
        let now = Instant::now();
        self.claims.retain(|_, (_, seen)| now.duration_since(*seen) < window);
        match self.claims.entry(fingerprint.to_string()) {
            Entry::Occupied(e) => e.get().0 == key,
            Entry::Vacant(e) => {
                e.insert((key.to_string(), now));
                true
            }
        }
    }
}

/// True if `key` is an instance key of `record`:
/// `{root}/discover/{name}/{instance_started}`.
fn key_matches_record(key: &str, record: &PresenceRecord) -> bool {
    let prefix = format!("{}{}/", discover_prefix(&record.root_path), record.name);
    key.strip_prefix(&prefix)
        .is_some_and(|stamp| stamp.parse::<i64>().is_ok())
}

/// Receive datagrams until shutdown. The receive itself has no timeout.
pub async fn receive_loop(
    transport: Arc<BroadcastTransport>,
    sink: IngestSink,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_ENVELOPE_SIZE];

    tracing::info!(dest = %transport.dest, "broadcast listener starting");

    loop {
        let (len, from) = tokio::select! {
            r = transport.socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        transport.handle_datagram(&buf[..len], from, &sink);
    }

    tracing::debug!("broadcast listener stopped");
}

/// Create a non-blocking IPv4 UDP socket able to send broadcasts.
fn make_broadcast_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_table::PeerTable;
    use crate::transport::Health;
    use roster_core::{Envelope, ProtocolKind};

    const WINDOW: Duration = Duration::from_secs(3);

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn bind_local(keys: Arc<DiscoveryKeys>) -> BroadcastTransport {
        BroadcastTransport::bind(free_port(), Ipv4Addr::LOCALHOST, keys, "/acme").unwrap()
    }

    fn sink() -> (PeerTable, IngestSink) {
        let table = PeerTable::new(WINDOW);
        (table.clone(), IngestSink::new(table, WINDOW, Health::default()))
    }

    fn svc_a() -> PresenceRecord {
        PresenceRecord::new("svc-a", "/acme").with_address(ProtocolKind::Http, "10.0.0.5:8080")
    }

    /// Re-wrap a genuine envelope under another routing key.
    fn with_routing_key(bytes: &[u8], key: &str) -> Vec<u8> {
        let mut envelope: Envelope = serde_json::from_slice(bytes).unwrap();
        envelope.routing_key = key.to_string();
        serde_json::to_vec(&envelope).unwrap()
    }

    #[tokio::test]
    async fn unusable_destination_is_configuration_error() {
        let keys = Arc::new(DiscoveryKeys::generate());
        assert!(matches!(
            BroadcastTransport::bind(free_port(), Ipv4Addr::UNSPECIFIED, keys.clone(), "/acme"),
            Err(DiscoveryError::Configuration(_))
        ));
        assert!(matches!(
            BroadcastTransport::bind(0, Ipv4Addr::LOCALHOST, keys, "/acme"),
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn same_key_datagram_is_stored_under_routing_key() {
        let keys = Arc::new(DiscoveryKeys::from_seed(&[7u8; 32]));
        let t = bind_local(keys.clone());
        let sender = Codec::sealed(keys);
        let (table, sink) = sink();

        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        t.handle_datagram(&sender.encode(&svc_a()).unwrap(), from, &sink);

        let key = sender.routing_key(&svc_a());
        assert_eq!(table.get(&key).unwrap().name, "svc-a");
    }

    #[tokio::test]
    async fn foreign_key_datagram_is_dropped() {
        let t = bind_local(Arc::new(DiscoveryKeys::from_seed(&[1u8; 32])));
        let intruder = Codec::sealed(Arc::new(DiscoveryKeys::from_seed(&[2u8; 32])));
        let (table, sink) = sink();

        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        t.handle_datagram(&intruder.encode(&svc_a()).unwrap(), from, &sink);
        t.handle_datagram(b"\x00\x01garbage", from, &sink);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn rewritten_routing_key_cannot_take_another_slot() {
        let keys = Arc::new(DiscoveryKeys::from_seed(&[7u8; 32]));
        let t = bind_local(keys.clone());
        let a = Codec::sealed(keys.clone());
        let b = Codec::sealed(keys);
        let (table, sink) = sink();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let b_record =
            PresenceRecord::new("svc-b", "/acme").with_address(ProtocolKind::Http, "10.0.0.6:8080");
        t.handle_datagram(&b.encode(&b_record).unwrap(), from, &sink);
        let b_key = b.routing_key(&b_record);

        // svc-a's genuine announcement, replayed under svc-b's slot.
        let genuine = a.encode(&svc_a()).unwrap();
        t.handle_datagram(&with_routing_key(&genuine, &b_key), from, &sink);
        assert_eq!(table.get(&b_key).unwrap().name, "svc-b");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn one_announcement_fills_one_slot() {
        let keys = Arc::new(DiscoveryKeys::from_seed(&[7u8; 32]));
        let t = bind_local(keys.clone());
        let a = Codec::sealed(keys);
        let (table, sink) = sink();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let genuine = a.encode(&svc_a()).unwrap();
        t.handle_datagram(&genuine, from, &sink);
        // The original key again is a plain duplicate and still accepted.
        t.handle_datagram(&genuine, from, &sink);

        for i in 0..100 {
            let key = format!("/acme/discover/svc-a/{i}");
            t.handle_datagram(&with_routing_key(&genuine, &key), from, &sink);
        }
        for key in ["", "junk", "/acme/discover/svc-a/", "/acme/discover/svc-a/1/2"] {
            t.handle_datagram(&with_routing_key(&genuine, key), from, &sink);
        }

        assert_eq!(table.len(), 1);
        assert!(table.get(&a.routing_key(&svc_a())).is_some());
    }

    #[tokio::test]
    async fn records_from_other_roots_are_ignored() {
        let keys = Arc::new(DiscoveryKeys::from_seed(&[7u8; 32]));
        let t = bind_local(keys.clone());
        let other = Codec::sealed(keys);
        let (table, sink) = sink();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let z =
            PresenceRecord::new("svc-z", "/other").with_address(ProtocolKind::Http, "10.9.9.9:80");
        t.handle_datagram(&other.encode(&z).unwrap(), from, &sink);
        assert!(table.is_empty());
    }

    #[test]
    fn routing_key_must_name_the_record() {
        let r = svc_a();
        assert!(key_matches_record("/acme/discover/svc-a/1700000000000000", &r));
        assert!(!key_matches_record("/acme/discover/svc-b/1", &r));
        assert!(!key_matches_record("/other/discover/svc-a/1", &r));
        assert!(!key_matches_record("/acme/discover/svc-a/", &r));
        assert!(!key_matches_record("/acme/discover/svc-a/x", &r));
        assert!(!key_matches_record("/acme/discover/svc-a/1/2", &r));
    }

    #[tokio::test]
    async fn loopback_publish_reaches_own_listener() {
        let port = free_port();
        let keys = Arc::new(DiscoveryKeys::generate());
        let t = Arc::new(
            BroadcastTransport::bind(port, Ipv4Addr::LOCALHOST, keys, "/acme").unwrap(),
        );
        let (table, sink) = sink();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(receive_loop(t.clone(), sink, rx));

        t.publish(&svc_a()).await.unwrap();

        let key = t.routing_key(&svc_a());
        let mut found = None;
        for _ in 0..50 {
            found = table.get(&key);
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            found.unwrap().address(ProtocolKind::Http),
            Some("10.0.0.5:8080")
        );

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
