//! Meshnet overlay DHT.
//!
//! A Kademlia-style distributed hash table for a peer-to-peer overlay with
//! tenant isolation ("realms") and NAT/relay-aware address publication:
//!
//! - iterative routing over a 256-bit XOR keyspace (`routing`, `query`)
//! - signed, monotonically versioned per-node address records (`record`)
//! - content-provider announcements and a best-effort value store (`store`)
//! - a reachability-aware publication engine with dynamic TTL (`publish`)
//! - a framed JSON wire protocol with admission control (`wire`, `handler`,
//!   `limiter`)
//!
//! Transport, identity, persistence, and eventing are consumed through the
//! capability traits in [`host`]; the crate ships in-memory implementations
//! of each for embedding and tests.
//!
//! ```no_run
//! use lib_dht::{Dht, DhtConfig, MemoryNetwork};
//!
//! # async fn run() -> Result<(), lib_dht::DhtError> {
//! let network = MemoryNetwork::new();
//! let host = network.host(vec!["/ip4/1.2.3.4/tcp/4001".to_string()]);
//! let dht = Dht::builder(host).config(DhtConfig::default()).build()?;
//! dht.start().await?;
//! dht.bootstrap().await?;
//! let peers = dht.find_providers("my-app", 20).await?;
//! # drop(peers);
//! dht.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dht;
pub mod distance;
pub mod error;
pub mod handler;
pub mod host;
pub mod key;
pub mod limiter;
pub mod network;
pub mod publish;
pub mod query;
pub mod record;
pub mod routing;
pub mod store;
pub mod types;
pub mod wire;

pub use config::{AddressPublishStrategy, BootstrapPeer, DhtConfig};
pub use dht::{AuthoritativePeerRecord, Dht, DhtBuilder, DhtStats, RecordSource};
pub use error::{DhtError, Result};
pub use host::{
    AddressBookProvider, DhtStream, EventBus, FileKvStore, Host, KvStore, MemoryEventBus,
    MemoryHost, MemoryKvStore, MemoryNetwork, MemoryPeerstore, NetworkEvent, Peerstore,
    StaticAddressBook,
};
pub use publish::{
    PublishDecision, PublishDecisionEngine, ReachabilityChecker, StaticReachability,
};
pub use record::local::LocalRecordManager;
pub use record::validator::RecordValidator;
pub use record::{RealmPeerRecord, SignedRealmPeerRecord};
pub use routing::RoutingTableStats;
pub use store::{ProviderCacheStats, ProviderRecord, ValueRecord};
pub use types::{NatType, NodeId, PeerInfo, PeerSource, Reachability, RealmId, RoutingNode};
pub use wire::{Message, MessageType, PROTOCOL_ID};
