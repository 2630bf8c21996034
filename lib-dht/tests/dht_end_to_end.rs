//! End-to-end scenarios over an in-memory loopback network: two full DHT
//! instances exchanging framed wire messages through their hosts.

use lib_dht::publish::StaticReachability;
use lib_dht::{
    AddressPublishStrategy, Dht, DhtConfig, DhtError, Host, MemoryNetwork, NatType, NodeId,
    Reachability, RealmId, RealmPeerRecord,
};
use std::sync::Arc;
use std::time::Duration;

const ADDR_A: &str = "/ip4/1.2.3.4/tcp/4001";
const ADDR_B: &str = "/ip4/5.6.7.8/tcp/4001";

fn test_config() -> DhtConfig {
    let mut config = DhtConfig::local_test();
    config.address_publish_strategy = AddressPublishStrategy::All;
    config
}

struct Node {
    dht: Dht,
    host: Arc<lib_dht::MemoryHost>,
}

static TRACING: std::sync::Once = std::sync::Once::new();

impl Node {
    async fn spawn(
        network: &Arc<MemoryNetwork>,
        addr: &str,
        configure: impl FnOnce(lib_dht::DhtBuilder) -> lib_dht::DhtBuilder,
    ) -> Node {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
        let host = network.host(vec![addr.to_string()]);
        let dht = configure(Dht::builder(host.clone()).config(test_config()))
            .build()
            .unwrap();
        dht.start().await.unwrap();
        Node { dht, host }
    }

    fn id(&self) -> NodeId {
        self.host.local_node_id()
    }

    /// Point this node's routing table at `other`.
    async fn join(&self, other: &Node) {
        self.dht
            .add_peer(other.id(), other.host.local_addrs())
            .await
            .unwrap();
    }
}

/// Scenario: a node with no peers can still resolve itself, and lookups for
/// unknown peers surface `PeerNotFound`.
#[tokio::test]
async fn self_lookup_on_empty_table() {
    let network = MemoryNetwork::new();
    let node = Node::spawn(&network, ADDR_A, |b| b).await;

    let info = node.dht.find_peer(node.id()).await.unwrap();
    assert_eq!(info.node_id, node.id());
    assert_eq!(info.addrs, vec![ADDR_A.to_string()]);

    assert!(matches!(
        node.dht.find_peer(NodeId::random()).await,
        Err(DhtError::PeerNotFound)
    ));
    node.dht.stop().await.unwrap();
}

/// Scenario: PUT replicates to the connected peer; GET sees the value from
/// either side; expiry hides it.
#[tokio::test]
async fn put_get_value_across_nodes() {
    let network = MemoryNetwork::new();
    let a = Node::spawn(&network, ADDR_A, |b| b).await;
    let b = Node::spawn(&network, ADDR_B, |b| b).await;
    a.join(&b).await;

    let key = "/meshnet/v2/sys/value/k";
    a.dht
        .put_value(key, b"v".to_vec(), Some(Duration::from_secs(3600)))
        .await
        .unwrap();

    // Give the 5 s grace fan-out a moment to land on B.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.dht.get_value(key).await.unwrap(), b"v");
    assert_eq!(a.dht.get_value(key).await.unwrap(), b"v");

    // A short-lived value disappears after its ttl.
    let short = "/meshnet/v2/sys/value/short";
    a.dht
        .put_value(short, b"tmp".to_vec(), Some(Duration::from_millis(30)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(
        a.dht.get_value(short).await,
        Err(DhtError::KeyNotFound)
    ));

    a.dht.stop().await.unwrap();
    b.dht.stop().await.unwrap();
}

/// Scenario: node A announces a namespace; node B discovers exactly one
/// provider carrying A's published address.
#[tokio::test]
async fn provider_announce_and_find() {
    let network = MemoryNetwork::new();
    let a = Node::spawn(&network, ADDR_A, |b| b).await;
    let b = Node::spawn(&network, ADDR_B, |b| b).await;
    a.join(&b).await;

    a.dht.provide("ns", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let providers = b.dht.find_providers("ns", 20).await.unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].node_id, a.id());
    assert_eq!(providers[0].addrs, vec![ADDR_A.to_string()]);

    // Cached results answer repeat queries too.
    let again = b.dht.find_providers("ns", 20).await.unwrap();
    assert_eq!(again.len(), 1);

    a.dht.stop().await.unwrap();
    b.dht.stop().await.unwrap();
}

/// Scenario: records replace by sequence number; a stale republish is
/// refused and leaves the stored record untouched.
#[tokio::test]
async fn peer_record_replace_by_seq() {
    let network = MemoryNetwork::new();
    let a = Node::spawn(&network, ADDR_A, |b| b).await;
    let b = Node::spawn(&network, ADDR_B, |b| b).await;
    a.join(&b).await;

    let key = a.host.signing_key();
    let record = |seq: u64| {
        RealmPeerRecord {
            node_id: a.id(),
            realm_id: RealmId::global(),
            direct_addrs: vec![ADDR_A.to_string()],
            relay_addrs: vec![],
            nat_type: NatType::None,
            reachability: Reachability::Public,
            capabilities: vec![],
            seq,
            timestamp_ns: now_ns(),
            ttl_ms: 3_600_000,
        }
        .sign(&key)
        .unwrap()
    };

    a.dht.publish_global_peer_record(record(1)).await.unwrap();
    a.dht.publish_global_peer_record(record(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // B serves the seq-2 record through the authoritative path.
    let result = b
        .dht
        .get_authoritative_peer_record(&RealmId::global(), a.id())
        .await
        .unwrap();
    assert_eq!(result.record.as_ref().unwrap().record.seq, 2);

    // Republishing seq 1 is refused locally and the record stays at seq 2.
    assert!(matches!(
        a.dht.publish_global_peer_record(record(1)).await,
        Err(DhtError::SeqTooOld)
    ));
    let result = a
        .dht
        .get_authoritative_peer_record(&RealmId::global(), a.id())
        .await
        .unwrap();
    assert_eq!(result.record.as_ref().unwrap().record.seq, 2);

    a.dht.stop().await.unwrap();
    b.dht.stop().await.unwrap();
}

/// Scenario: symmetric NAT yields a relay-only publish decision with the
/// canonical reason string.
#[tokio::test]
async fn reachability_driven_address_split() {
    let network = MemoryNetwork::new();
    let host = network.host(vec![
        "/ip4/10.0.0.1/tcp/4001".to_string(),
        "/ip4/1.2.3.4/tcp/4001/p2p-circuit/p2p/R".to_string(),
    ]);
    let mut config = DhtConfig::local_test();
    config.address_publish_strategy = AddressPublishStrategy::Auto;
    let dht = Dht::builder(host)
        .config(config)
        .reachability(Arc::new(StaticReachability::new(
            Reachability::Private,
            NatType::Symmetric,
        )))
        .build()
        .unwrap();
    dht.start().await.unwrap();

    let decision = dht.publish_local_peer_record().await.unwrap();
    assert!(decision.should_publish);
    assert!(decision.direct_addrs.is_empty());
    assert_eq!(
        decision.relay_addrs,
        vec!["/ip4/1.2.3.4/tcp/4001/p2p-circuit/p2p/R".to_string()]
    );
    assert_eq!(decision.reason, "auto: private reachability, relay only");
    dht.stop().await.unwrap();
}

/// Realm-scoped discovery: a published realm record resolves through
/// `find_peer` on another member of the same realm.
#[tokio::test]
async fn realm_peer_record_lookup() {
    let network = MemoryNetwork::new();
    let realm = RealmId::new("tenant-a");
    let a = {
        let realm = realm.clone();
        Node::spawn(&network, ADDR_A, move |b| b.realm(realm)).await
    };
    let b = {
        let realm = realm.clone();
        Node::spawn(&network, ADDR_B, move |b| b.realm(realm)).await
    };
    a.join(&b).await;
    b.join(&a).await;

    let decision = a.dht.publish_local_peer_record().await.unwrap();
    assert!(decision.should_publish);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let info = b.dht.find_peer(a.id()).await.unwrap();
    assert_eq!(info.node_id, a.id());
    assert!(info.addrs.contains(&ADDR_A.to_string()));

    a.dht.stop().await.unwrap();
    b.dht.stop().await.unwrap();
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}
