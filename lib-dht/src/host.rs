//! External capability seams.
//!
//! The DHT never owns transport, identity, persistence, or eventing; it
//! consumes them through the traits here. In-memory reference
//! implementations ship alongside the traits for embedding and tests, the
//! same way a loopback transport ships next to a transport trait.

use crate::types::{NodeId, PeerInfo, PeerSource, RealmId};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Duplex byte stream carrying one framed request/response exchange.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type DhtStream = Box<dyn StreamIo>;

/// Transport, stream, and identity capability supplied by the embedder.
///
/// `connect` and `open_stream` must never re-enter overlay discovery; the
/// caller resolves addresses first.
#[async_trait]
pub trait Host: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// The local signing identity, used for peer records.
    fn signing_key(&self) -> SigningKey;

    /// Currently advertised local addresses.
    fn local_addrs(&self) -> Vec<String>;

    /// Ensure a connection to `peer` using exactly the given addresses.
    async fn connect(&self, peer: &NodeId, addrs: &[String]) -> anyhow::Result<()>;

    /// Open a fresh protocol stream to a connected peer.
    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> anyhow::Result<DhtStream>;

    /// Wait for the next inbound protocol stream.
    async fn accept_stream(&self) -> anyhow::Result<(NodeId, DhtStream)>;
}

/// Address book of known peers with provenance tags.
pub trait Peerstore: Send + Sync {
    fn add_addrs(&self, peer: &NodeId, addrs: &[String], source: PeerSource);

    /// All known addresses for `peer`, regardless of source.
    fn addrs(&self, peer: &NodeId) -> Vec<String>;

    /// Addresses recorded under one specific source tag.
    fn addrs_from_source(&self, peer: &NodeId, source: PeerSource) -> Vec<String>;

    /// Peers with at least one known address.
    fn peers(&self) -> Vec<NodeId>;

    fn remove_peer(&self, peer: &NodeId);
}

/// Persistent key/value engine used for write-through store state.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
    fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
}

/// External realm address book consulted when the DHT has no record.
#[async_trait]
pub trait AddressBookProvider: Send + Sync {
    async fn lookup(&self, realm: &RealmId, node: &NodeId) -> anyhow::Result<Option<PeerInfo>>;
}

/// Connection lifecycle events published by the embedder's network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
}

/// Event bus the DHT may subscribe to for connection events.
pub trait EventBus: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementations
// ---------------------------------------------------------------------------

/// Peerstore backed by per-source address maps.
#[derive(Default)]
pub struct MemoryPeerstore {
    entries: RwLock<HashMap<NodeId, HashMap<PeerSource, Vec<String>>>>,
}

impl MemoryPeerstore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Peerstore for MemoryPeerstore {
    fn add_addrs(&self, peer: &NodeId, addrs: &[String], source: PeerSource) {
        if addrs.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        let by_source = entries.entry(*peer).or_default().entry(source).or_default();
        for addr in addrs {
            if !by_source.contains(addr) {
                by_source.push(addr.clone());
            }
        }
    }

    fn addrs(&self, peer: &NodeId) -> Vec<String> {
        let entries = self.entries.read();
        let mut out = Vec::new();
        if let Some(by_source) = entries.get(peer) {
            for addrs in by_source.values() {
                for addr in addrs {
                    if !out.contains(addr) {
                        out.push(addr.clone());
                    }
                }
            }
        }
        out
    }

    fn addrs_from_source(&self, peer: &NodeId, source: PeerSource) -> Vec<String> {
        self.entries
            .read()
            .get(peer)
            .and_then(|by_source| by_source.get(&source))
            .cloned()
            .unwrap_or_default()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.entries
            .read()
            .iter()
            .filter(|(_, by_source)| by_source.values().any(|a| !a.is_empty()))
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn remove_peer(&self, peer: &NodeId) {
        self.entries.write().remove(peer);
    }
}

/// Key/value engine backed by an ordered map; scans are prefix ranges.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Key/value engine persisted as one JSON file.
///
/// The whole map is loaded on open and rewritten on every mutation, which is
/// plenty for the store sizes a single DHT node accumulates. Embedders with
/// a real database plug in their own [`KvStore`] instead.
pub struct FileKvStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FileKvStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(FileKvStore {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Vec<u8>>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(entries)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_vec());
        self.flush(&entries)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Fixed-content address book.
#[derive(Default)]
pub struct StaticAddressBook {
    entries: RwLock<HashMap<(String, NodeId), PeerInfo>>,
}

impl StaticAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, realm: &RealmId, info: PeerInfo) {
        self.entries
            .write()
            .insert((realm.as_str().to_string(), info.node_id), info);
    }
}

#[async_trait]
impl AddressBookProvider for StaticAddressBook {
    async fn lookup(&self, realm: &RealmId, node: &NodeId) -> anyhow::Result<Option<PeerInfo>> {
        Ok(self
            .entries
            .read()
            .get(&(realm.as_str().to_string(), *node))
            .cloned())
    }
}

/// Broadcast-backed event bus.
pub struct MemoryEventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        MemoryEventBus { tx }
    }

    pub fn publish(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventBus for MemoryEventBus {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Loopback host network
// ---------------------------------------------------------------------------

type InboundTx = mpsc::Sender<(NodeId, DhtStream)>;

/// Registry wiring [`MemoryHost`]s together over in-process duplex streams.
#[derive(Default)]
pub struct MemoryNetwork {
    hosts: RwLock<HashMap<NodeId, (Vec<String>, InboundTx)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a host bound to this network with the given advertised addresses.
    pub fn host(self: &Arc<Self>, addrs: Vec<String>) -> Arc<MemoryHost> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        self.host_with_key(signing_key, addrs)
    }

    pub fn host_with_key(self: &Arc<Self>, signing_key: SigningKey, addrs: Vec<String>) -> Arc<MemoryHost> {
        let node_id = NodeId::from_public_key(&signing_key.verifying_key());
        let (tx, rx) = mpsc::channel(64);
        self.hosts.write().insert(node_id, (addrs.clone(), tx));
        Arc::new(MemoryHost {
            network: Arc::clone(self),
            signing_key,
            node_id,
            addrs,
            inbound: Mutex::new(rx),
        })
    }

    fn sender_for(&self, peer: &NodeId) -> Option<InboundTx> {
        self.hosts.read().get(peer).map(|(_, tx)| tx.clone())
    }

    /// Simulate a host going offline.
    pub fn disconnect(&self, peer: &NodeId) {
        self.hosts.write().remove(peer);
    }
}

/// Host implementation over a [`MemoryNetwork`].
pub struct MemoryHost {
    network: Arc<MemoryNetwork>,
    signing_key: SigningKey,
    node_id: NodeId,
    addrs: Vec<String>,
    inbound: Mutex<mpsc::Receiver<(NodeId, DhtStream)>>,
}

#[async_trait]
impl Host for MemoryHost {
    fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    fn signing_key(&self) -> SigningKey {
        self.signing_key.clone()
    }

    fn local_addrs(&self) -> Vec<String> {
        self.addrs.clone()
    }

    async fn connect(&self, peer: &NodeId, _addrs: &[String]) -> anyhow::Result<()> {
        if self.network.sender_for(peer).is_none() {
            anyhow::bail!("peer {} not reachable", peer);
        }
        Ok(())
    }

    async fn open_stream(&self, peer: &NodeId, _protocol: &str) -> anyhow::Result<DhtStream> {
        let tx = self
            .network
            .sender_for(peer)
            .ok_or_else(|| anyhow::anyhow!("peer {} not reachable", peer))?;
        let (local, remote) = tokio::io::duplex(crate::wire::MAX_FRAME_SIZE + 8);
        tx.send((self.node_id, Box::new(remote)))
            .await
            .map_err(|_| anyhow::anyhow!("peer {} stopped accepting streams", peer))?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> anyhow::Result<(NodeId, DhtStream)> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("host shut down"))
    }
}
