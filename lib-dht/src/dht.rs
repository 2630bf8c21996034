//! The DHT facade: lifecycle, public operations, and background loops.
//!
//! One `Dht` owns one routing table, one set of stores, and one set of
//! maintenance tasks. `start` wires the inbound handler and spawns the
//! loops; `stop` cancels them through a shared shutdown signal and waits
//! for every task to exit.

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::handler::{serve_inbound, Handler};
use crate::host::{
    AddressBookProvider, EventBus, Host, KvStore, NetworkEvent, Peerstore, MemoryPeerstore,
};
use crate::key::{key_target, node_key, realm_peer_key, realm_provider_key, sys_key};
use crate::network::NetworkAdapter;
use crate::publish::{
    AddressChangeTracker, PublishDecision, PublishDecisionEngine, ReachabilityChecker,
};
use crate::query::{QueryEngine, QueryKind};
use crate::record::local::LocalRecordManager;
use crate::record::validator::RecordValidator;
use crate::record::SignedRealmPeerRecord;
use crate::routing::RoutingTable;
use crate::store::{
    persistent, PeerRecordStore, ProviderCache, ProviderRecord, ProviderStore, ValueStore,
};
use crate::store::provider_cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::types::{NodeId, PeerInfo, PeerSource, RealmId, RoutingNode};
use crate::wire::{Message, MessageType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Grace window for STORE fan-out.
const STORE_GRACE: Duration = Duration::from_secs(5);
/// Grace window for PUT_PEER_RECORD fan-out.
const PUT_RECORD_GRACE: Duration = Duration::from_secs(10);
/// Cadence of the provider-cache cleanup and address-change checks.
const MINUTE: Duration = Duration::from_secs(60);

/// Where an authoritative-lookup answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Freshly validated from the DHT, the canonical source.
    Dht,
    /// External address-book fallback.
    AddressBook,
    /// Local peerstore fallback.
    Peerstore,
}

/// Result of an authoritative peer lookup, annotated with its provenance.
#[derive(Debug, Clone)]
pub struct AuthoritativePeerRecord {
    pub peer: PeerInfo,
    /// Present only when the answer came from the DHT.
    pub record: Option<SignedRealmPeerRecord>,
    pub source: RecordSource,
}

/// Point-in-time counters across the routing table and stores.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub routing: crate::routing::RoutingTableStats,
    pub values: usize,
    pub providers: usize,
    pub peer_records: usize,
    pub provider_cache: crate::store::ProviderCacheStats,
}

/// Builder wiring a [`Dht`] to its external capabilities.
pub struct DhtBuilder {
    host: Arc<dyn Host>,
    config: DhtConfig,
    peerstore: Option<Arc<dyn Peerstore>>,
    kv: Option<Arc<dyn KvStore>>,
    address_book: Option<Arc<dyn AddressBookProvider>>,
    reachability: Option<Arc<dyn ReachabilityChecker>>,
    event_bus: Option<Arc<dyn EventBus>>,
    realm: RealmId,
    capabilities: Vec<String>,
}

impl DhtBuilder {
    pub fn new(host: Arc<dyn Host>) -> Self {
        DhtBuilder {
            host,
            config: DhtConfig::default(),
            peerstore: None,
            kv: None,
            address_book: None,
            reachability: None,
            event_bus: None,
            realm: RealmId::global(),
            capabilities: Vec::new(),
        }
    }

    pub fn config(mut self, config: DhtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn peerstore(mut self, peerstore: Arc<dyn Peerstore>) -> Self {
        self.peerstore = Some(peerstore);
        self
    }

    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn address_book(mut self, provider: Arc<dyn AddressBookProvider>) -> Self {
        self.address_book = Some(provider);
        self
    }

    pub fn reachability(mut self, checker: Arc<dyn ReachabilityChecker>) -> Self {
        self.reachability = Some(checker);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn realm(mut self, realm: RealmId) -> Self {
        self.realm = realm;
        self
    }

    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn build(self) -> Result<Dht, DhtError> {
        self.config.validate()?;
        let local_id = self.host.local_node_id();
        let peerstore = self
            .peerstore
            .unwrap_or_else(|| Arc::new(MemoryPeerstore::new()));

        let routing = Arc::new(RoutingTable::new(
            local_id,
            self.config.bucket_size,
            self.config.node_expire_time,
        ));
        let values = Arc::new(ValueStore::new(self.kv.clone()));
        let providers = Arc::new(ProviderStore::new(self.kv.clone()));
        let peer_records = Arc::new(PeerRecordStore::new());
        let network = Arc::new(NetworkAdapter::new(
            Arc::clone(&self.host),
            Arc::clone(&routing),
            Arc::clone(&peerstore),
            self.config.connect_timeout,
            self.config.request_timeout,
        ));
        let handler = Arc::new(Handler::new(
            &self.config,
            Arc::clone(&self.host),
            Arc::clone(&routing),
            Arc::clone(&values),
            Arc::clone(&providers),
            Arc::clone(&peer_records),
        ));
        let query_engine = QueryEngine::new(
            Arc::clone(&network),
            Arc::clone(&routing),
            Arc::clone(&self.host),
            self.config.bucket_size,
            self.config.alpha,
            self.config.query_timeout,
        );
        let change_tracker = Arc::new(AddressChangeTracker::new());
        let decision_engine = PublishDecisionEngine::new(
            self.config.address_publish_strategy,
            self.config.peer_record_ttl,
            self.reachability.clone(),
            Arc::clone(&change_tracker),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Dht {
            inner: Arc::new(DhtInner {
                config: self.config,
                host: self.host,
                peerstore,
                kv: self.kv,
                address_book: self.address_book,
                reachability: self.reachability,
                event_bus: self.event_bus,
                routing,
                values,
                providers,
                peer_records,
                provider_cache: Mutex::new(ProviderCache::new(
                    DEFAULT_CACHE_CAPACITY,
                    DEFAULT_CACHE_TTL,
                )),
                local_records: LocalRecordManager::new(),
                network,
                handler,
                query_engine,
                decision_engine,
                change_tracker,
                validator: RecordValidator::new(),
                initial_realm: self.realm,
                capabilities: self.capabilities,
                started: AtomicBool::new(false),
                shutdown_tx,
                tasks: AsyncMutex::new(Vec::new()),
                last_local_addrs: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct DhtInner {
    config: DhtConfig,
    host: Arc<dyn Host>,
    peerstore: Arc<dyn Peerstore>,
    kv: Option<Arc<dyn KvStore>>,
    address_book: Option<Arc<dyn AddressBookProvider>>,
    reachability: Option<Arc<dyn ReachabilityChecker>>,
    event_bus: Option<Arc<dyn EventBus>>,
    routing: Arc<RoutingTable>,
    values: Arc<ValueStore>,
    providers: Arc<ProviderStore>,
    peer_records: Arc<PeerRecordStore>,
    provider_cache: Mutex<ProviderCache>,
    local_records: LocalRecordManager,
    network: Arc<NetworkAdapter>,
    handler: Arc<Handler>,
    query_engine: QueryEngine,
    decision_engine: PublishDecisionEngine,
    change_tracker: Arc<AddressChangeTracker>,
    validator: RecordValidator,
    initial_realm: RealmId,
    capabilities: Vec<String>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    last_local_addrs: Mutex<Vec<String>>,
}

/// Realm-aware Kademlia DHT over a [`Host`] capability.
pub struct Dht {
    inner: Arc<DhtInner>,
}

impl Dht {
    pub fn builder(host: Arc<dyn Host>) -> DhtBuilder {
        DhtBuilder::new(host)
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.host.local_node_id()
    }

    pub fn realm_id(&self) -> RealmId {
        self.inner.local_records.realm_id()
    }

    pub fn routing_table_size(&self) -> usize {
        self.inner.routing.size()
    }

    pub fn stats(&self) -> DhtStats {
        let inner = &self.inner;
        DhtStats {
            routing: inner.routing.stats(),
            values: inner.values.len(),
            providers: inner.providers.len(),
            peer_records: inner.peer_records.len(),
            provider_cache: inner.provider_cache.lock().stats().clone(),
        }
    }

    /// Initialize local signing state, replay persisted stores, and spawn
    /// the maintenance loops.
    pub async fn start(&self) -> Result<(), DhtError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DhtError::AlreadyStarted);
        }
        let inner = &self.inner;

        inner.local_records.initialize(
            inner.host.signing_key(),
            inner.host.local_node_id(),
            inner.initial_realm.clone(),
        );
        *inner.last_local_addrs.lock() = inner.host.local_addrs();

        inner.values.load_persisted();
        inner.providers.load_persisted();
        if let Some(kv) = &inner.kv {
            let restored =
                persistent::load_routing_nodes(kv, inner.config.node_expire_time.as_secs());
            let count = restored.len();
            for node in restored {
                inner.routing.add(node);
            }
            if count > 0 {
                debug!(count, "routing table replayed from kv");
            }
        }

        let mut tasks = inner.tasks.lock().await;
        tasks.push(tokio::spawn(serve_inbound(
            Arc::clone(&inner.handler),
            Arc::clone(&inner.host),
            inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(refresh_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(cleanup_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(republish_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(provider_cache_loop(Arc::clone(&self.inner))));
        if let Some(bus) = &inner.event_bus {
            // Subscribe before returning so no event published after start
            // can be missed.
            let events = bus.subscribe();
            tasks.push(tokio::spawn(event_loop(Arc::clone(&self.inner), events)));
        }

        info!(node = %inner.host.local_node_id(), "dht started");
        Ok(())
    }

    /// Cancel the loops, close the adapter, and wait for every task.
    pub async fn stop(&self) -> Result<(), DhtError> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Err(DhtError::NotStarted);
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.network.close();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!(node = %self.inner.host.local_node_id(), "dht stopped");
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), DhtError> {
        if self.inner.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DhtError::NotStarted)
        }
    }

    /// Join (or leave, with the global realm) a tenant scope. Subsequent
    /// local records and realm keys use the new realm.
    pub fn set_realm(&self, realm: RealmId) {
        self.inner.local_records.set_realm_id(realm);
    }

    /// Dial every configured bootstrap peer plus every peerstore entry with
    /// addresses. Per-peer failures are warnings, not errors.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let local = inner.host.local_node_id();

        let mut targets: Vec<(NodeId, Vec<String>)> = Vec::new();
        for peer in &inner.config.bootstrap_peers {
            if peer.node_id != local && !peer.addrs.is_empty() {
                targets.push((peer.node_id, peer.addrs.clone()));
            }
        }
        for peer in inner.peerstore.peers() {
            if peer == local || targets.iter().any(|(id, _)| *id == peer) {
                continue;
            }
            let addrs = inner.peerstore.addrs(&peer);
            if !addrs.is_empty() {
                targets.push((peer, addrs));
            }
        }

        if targets.is_empty() {
            debug!("bootstrap: no targets");
            return Ok(());
        }

        let mut connected = 0usize;
        for (peer, addrs) in targets {
            match timeout(
                inner.config.connect_timeout,
                inner.host.connect(&peer, &addrs),
            )
            .await
            {
                Ok(Ok(())) => {
                    inner.routing.add(RoutingNode::new(peer, addrs));
                    connected += 1;
                }
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "bootstrap dial failed"),
                Err(_) => warn!(peer = %peer, "bootstrap dial timed out"),
            }
        }
        info!(connected, "bootstrap finished");
        Ok(())
    }

    /// Dial one known peer and insert it into the routing table. The same
    /// per-peer path `bootstrap` takes, exposed for runtime peer injection.
    pub async fn add_peer(&self, id: NodeId, addrs: Vec<String>) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        if id == inner.host.local_node_id() {
            return Ok(());
        }
        match timeout(inner.config.connect_timeout, inner.host.connect(&id, &addrs)).await {
            Ok(Ok(())) => {
                inner.routing.add(RoutingNode::new(id, addrs));
                Ok(())
            }
            Ok(Err(e)) => Err(DhtError::SendFailed(e.to_string())),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Resolve a peer's addresses by the authoritative priority chain.
    pub async fn find_peer(&self, id: NodeId) -> Result<PeerInfo, DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let local = inner.host.local_node_id();

        if id == local {
            return Ok(PeerInfo::new(local, inner.host.local_addrs()));
        }

        // 1. Local peerstore knowledge, excluding externally sourced entries.
        let mut local_addrs = inner.peerstore.addrs_from_source(&id, PeerSource::Static);
        for addr in inner.peerstore.addrs_from_source(&id, PeerSource::Dht) {
            if !local_addrs.contains(&addr) {
                local_addrs.push(addr);
            }
        }
        if !local_addrs.is_empty() {
            return Ok(PeerInfo::new(id, local_addrs));
        }

        // 2. Member-list labelled entries.
        let member_addrs = inner
            .peerstore
            .addrs_from_source(&id, PeerSource::MemberList);
        if !member_addrs.is_empty() {
            return Ok(PeerInfo::new(id, member_addrs));
        }

        let realm = inner.local_records.realm_id();

        // 3. Realm-scoped DHT record lookup when the realm is known.
        if !realm.is_global() {
            if let Some(info) = self.find_peer_via_record(&realm, &id).await? {
                return Ok(info);
            }
        }

        // 4. External address book.
        if let Some(book) = &inner.address_book {
            match book.lookup(&realm, &id).await {
                Ok(Some(info)) => return Ok(info),
                Ok(None) => {}
                Err(e) => debug!(peer = %id, error = %e, "address book lookup failed"),
            }
        }

        // 5. Realm-unknown fallback: routing table, then iterative FIND_NODE.
        if realm.is_global() {
            if let Some(node) = inner.routing.get(&id) {
                if !node.addrs.is_empty() {
                    return Ok(PeerInfo::new(id, node.addrs));
                }
            }
            match inner.query_engine.run(QueryKind::FindNode, id, None).await {
                Ok(outcome) => {
                    if let Some(found) = outcome.nodes.into_iter().find(|n| n.node_id == id) {
                        inner
                            .peerstore
                            .add_addrs(&id, &found.addrs, PeerSource::Dht);
                        return Ok(found);
                    }
                }
                Err(DhtError::NoNearbyPeers) => {
                    debug!(peer = %id, "find_peer: routing table empty");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DhtError::PeerNotFound)
    }

    /// Realm peer-record lookup: local store, then iterative GET_PEER_RECORD.
    async fn find_peer_via_record(
        &self,
        realm: &RealmId,
        id: &NodeId,
    ) -> Result<Option<PeerInfo>, DhtError> {
        let inner = &self.inner;
        let key = realm_peer_key(realm, id);

        let signed = match inner.peer_records.get(&key) {
            Some(signed) => Some(signed),
            None => {
                match inner
                    .query_engine
                    .run(QueryKind::GetPeerRecord, key_target(&key), Some(key.clone()))
                    .await
                {
                    Ok(outcome) => match outcome.record_bytes {
                        Some(bytes) => {
                            let signed = SignedRealmPeerRecord::from_bytes(&bytes)?;
                            inner.validator.validate(&key, &signed)?;
                            if let Err(e) = inner.peer_records.put(&key, signed.clone()) {
                                debug!(key, error = %e, "fetched record not cached");
                            }
                            Some(signed)
                        }
                        None => None,
                    },
                    Err(DhtError::NoNearbyPeers) => None,
                    Err(e) => return Err(e),
                }
            }
        };

        Ok(signed.map(|signed| {
            let mut addrs = signed.record.direct_addrs.clone();
            addrs.extend_from_slice(&signed.record.relay_addrs);
            inner.peerstore.add_addrs(id, &addrs, PeerSource::Dht);
            PeerInfo::new(*id, addrs)
        }))
    }

    /// Discover providers under a namespace; yields up to `limit` peers on a
    /// finite channel. An empty routing table yields zero results, not an
    /// error.
    pub fn find_peers(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, DhtError> {
        self.ensure_started()?;
        let (tx, rx) = mpsc::channel(limit.max(1));
        let inner = Arc::clone(&self.inner);
        let key = provider_key_for(&inner, namespace);

        tokio::spawn(async move {
            let cached = inner.provider_cache.lock().get(&key);
            if let Some(cached) = cached {
                for info in cached.into_iter().take(limit) {
                    if tx.send(info).await.is_err() {
                        return;
                    }
                }
                return;
            }

            if inner.routing.is_empty() {
                debug!(key, "find_peers on empty routing table");
                return;
            }

            match inner
                .query_engine
                .run(QueryKind::GetProviders, key_target(&key), Some(key.clone()))
                .await
            {
                Ok(outcome) if !outcome.providers.is_empty() => {
                    inner
                        .provider_cache
                        .lock()
                        .insert(key.clone(), outcome.providers.clone());
                    for info in outcome.providers.into_iter().take(limit) {
                        if tx.send(info).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(key, error = %e, "provider lookup failed"),
            }
        });

        Ok(rx)
    }

    /// Collected convenience form of [`find_peers`](Self::find_peers).
    pub async fn find_providers(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<PeerInfo>, DhtError> {
        let mut rx = self.find_peers(namespace, limit)?;
        let mut out = Vec::new();
        while let Some(info) = rx.recv().await {
            out.push(info);
        }
        Ok(out)
    }

    /// Local hit first, else iterative FIND_VALUE.
    pub async fn get_value(&self, key: &str) -> Result<Vec<u8>, DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        if let Some(bytes) = inner.values.get(key) {
            return Ok(bytes);
        }
        match inner
            .query_engine
            .run(QueryKind::FindValue, key_target(key), Some(key.to_string()))
            .await
        {
            Ok(outcome) => outcome.value.ok_or(DhtError::KeyNotFound),
            Err(DhtError::NoNearbyPeers) => Err(DhtError::KeyNotFound),
            Err(e) => Err(e),
        }
    }

    /// Write locally, then replicate to the K nearest peers within a grace
    /// window. Zero replications is still a success: the value is
    /// discoverable via self-lookup.
    pub async fn put_value(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        if !inner.config.enable_value_store {
            return Err(DhtError::InvalidConfig("value store disabled".into()));
        }
        let ttl = ttl
            .unwrap_or(inner.config.max_record_age)
            .min(inner.config.max_record_age);
        inner.values.put(key, value.clone(), ttl);

        let targets = inner
            .routing
            .nearest_peers(&key_target(key), inner.config.replication_factor);
        if targets.is_empty() {
            return Ok(());
        }
        let mut message = Message::request(
            MessageType::Store,
            inner.host.local_node_id(),
            inner.host.local_addrs(),
        );
        message.key = Some(key.to_string());
        message.value = Some(value);
        message.ttl_ms = Some(ttl.as_millis() as u64);
        let replicated = fan_out(inner, targets, message, STORE_GRACE).await;
        debug!(key, replicated, "put_value fan-out done");
        Ok(())
    }

    /// Announce the local node as a provider under a namespace.
    pub async fn provide(&self, namespace: &str, announce: bool) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let key = provider_key_for(inner, namespace);

        let decision = inner
            .decision_engine
            .make_publish_decision(&inner.host.local_addrs())
            .await;
        let mut addrs = decision.direct_addrs.clone();
        addrs.extend_from_slice(&decision.relay_addrs);

        inner.providers.add(
            &key,
            ProviderRecord::new(inner.host.local_node_id(), addrs.clone(), inner.config.provider_ttl),
        );

        if !announce {
            return Ok(());
        }
        let targets = inner
            .routing
            .nearest_peers(&key_target(&key), inner.config.replication_factor);
        if targets.is_empty() {
            return Ok(());
        }
        let mut message = Message::request(
            MessageType::AddProvider,
            inner.host.local_node_id(),
            addrs,
        );
        message.key = Some(key.clone());
        message.ttl_ms = Some(inner.config.provider_ttl.as_millis() as u64);
        let announced = fan_out(inner, targets, message, STORE_GRACE).await;
        debug!(key, announced, "provider announcement done");
        Ok(())
    }

    /// Withdraw the local provider announcement for a namespace.
    pub async fn stop_providing(&self, namespace: &str) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let key = provider_key_for(inner, namespace);
        inner.providers.remove(&key, &inner.host.local_node_id());

        let targets = inner
            .routing
            .nearest_peers(&key_target(&key), inner.config.replication_factor);
        if targets.is_empty() {
            return Ok(());
        }
        let mut message = Message::request(
            MessageType::RemoveProvider,
            inner.host.local_node_id(),
            inner.host.local_addrs(),
        );
        message.key = Some(key);
        fan_out(inner, targets, message, STORE_GRACE).await;
        Ok(())
    }

    /// Publish a serialized signed record received from elsewhere.
    pub async fn publish_peer_record(&self, bytes: &[u8]) -> Result<(), DhtError> {
        self.ensure_started()?;
        let signed = SignedRealmPeerRecord::from_bytes(bytes)?;
        self.publish_signed(signed).await
    }

    /// Publish a signed record under the global node key.
    pub async fn publish_global_peer_record(
        &self,
        signed: SignedRealmPeerRecord,
    ) -> Result<(), DhtError> {
        self.ensure_started()?;
        self.publish_signed(signed).await
    }

    /// Build a publish decision, sign a fresh local record with its address
    /// split and TTL, and publish it. Returns the decision for inspection;
    /// when nothing is publishable, nothing is sent.
    pub async fn publish_local_peer_record(&self) -> Result<PublishDecision, DhtError> {
        self.publish_local(false).await
    }

    /// As [`publish_local_peer_record`](Self::publish_local_peer_record), but
    /// direct addresses are first run through the reachability checker's
    /// verification, when one is configured.
    pub async fn publish_local_peer_record_with_verification(
        &self,
    ) -> Result<PublishDecision, DhtError> {
        self.publish_local(true).await
    }

    async fn publish_local(&self, verify: bool) -> Result<PublishDecision, DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let decision = inner
            .decision_engine
            .make_publish_decision(&inner.host.local_addrs())
            .await;
        if !decision.should_publish {
            warn!(reason = %decision.reason, "local record not published");
            return Ok(decision);
        }

        let direct = if verify {
            match &inner.reachability {
                Some(checker) => checker.verify_addresses(&decision.direct_addrs).await.0,
                None => decision.direct_addrs.clone(),
            }
        } else {
            decision.direct_addrs.clone()
        };

        let signed = inner.local_records.create_signed_record(
            direct,
            decision.relay_addrs.clone(),
            decision.nat_type,
            decision.reachability,
            inner.capabilities.clone(),
            decision.ttl,
        )?;
        self.publish_signed(signed).await?;
        Ok(decision)
    }

    /// Store under the realm or global key, then fan out PUT_PEER_RECORD.
    /// Local success decides the caller-visible outcome.
    async fn publish_signed(&self, signed: SignedRealmPeerRecord) -> Result<(), DhtError> {
        let inner = &self.inner;
        let key = if signed.record.realm_id.is_global() {
            node_key(&signed.record.node_id)
        } else {
            realm_peer_key(&signed.record.realm_id, &signed.record.node_id)
        };
        let bytes = signed.to_bytes()?;
        inner.peer_records.put(&key, signed)?;

        let targets = inner
            .routing
            .nearest_peers(&key_target(&key), inner.config.replication_factor);
        if targets.is_empty() {
            debug!(key, "record stored locally; no peers to replicate to");
            return Ok(());
        }
        let mut message = Message::request(
            MessageType::PutPeerRecord,
            inner.host.local_node_id(),
            inner.host.local_addrs(),
        );
        message.key = Some(key.clone());
        message.signed_record = Some(bytes);
        let replicated = fan_out(inner, targets, message, PUT_RECORD_GRACE).await;
        debug!(key, replicated, "peer record fan-out done");
        Ok(())
    }

    /// Clear local signing state and delete both the realm and global keys
    /// locally. Remote copies age out via TTL.
    pub async fn unpublish_peer_record(&self) -> Result<(), DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let Some(node_id) = inner.local_records.node_id() else {
            return Err(DhtError::NotStarted);
        };
        let realm = inner.local_records.realm_id();
        inner.local_records.clear();
        inner.peer_records.remove(&node_key(&node_id));
        if !realm.is_global() {
            inner.peer_records.remove(&realm_peer_key(&realm, &node_id));
        }
        Ok(())
    }

    /// Authoritative lookup: DHT first (validator pass required), then the
    /// external address book, then the peerstore. The result names which
    /// source answered.
    pub async fn get_authoritative_peer_record(
        &self,
        realm: &RealmId,
        id: NodeId,
    ) -> Result<AuthoritativePeerRecord, DhtError> {
        self.ensure_started()?;
        let inner = &self.inner;
        let key = if realm.is_global() {
            node_key(&id)
        } else {
            realm_peer_key(realm, &id)
        };

        let local_hit = inner.peer_records.get(&key);
        let signed = match local_hit {
            Some(signed) => Some(signed),
            None => match inner
                .query_engine
                .run(QueryKind::GetPeerRecord, key_target(&key), Some(key.clone()))
                .await
            {
                Ok(outcome) => match outcome.record_bytes {
                    Some(bytes) => {
                        let signed = SignedRealmPeerRecord::from_bytes(&bytes)?;
                        inner.validator.validate(&key, &signed)?;
                        Some(signed)
                    }
                    None => None,
                },
                Err(DhtError::NoNearbyPeers) => None,
                Err(e) => {
                    debug!(key, error = %e, "authoritative dht lookup failed");
                    None
                }
            },
        };
        if let Some(signed) = signed {
            let mut addrs = signed.record.direct_addrs.clone();
            addrs.extend_from_slice(&signed.record.relay_addrs);
            return Ok(AuthoritativePeerRecord {
                peer: PeerInfo::new(id, addrs),
                record: Some(signed),
                source: RecordSource::Dht,
            });
        }

        if let Some(book) = &inner.address_book {
            if let Ok(Some(info)) = book.lookup(realm, &id).await {
                return Ok(AuthoritativePeerRecord {
                    peer: info,
                    record: None,
                    source: RecordSource::AddressBook,
                });
            }
        }

        let stored = inner.peerstore.addrs(&id);
        if !stored.is_empty() {
            return Ok(AuthoritativePeerRecord {
                peer: PeerInfo::new(id, stored),
                record: None,
                source: RecordSource::Peerstore,
            });
        }

        Err(DhtError::PeerNotFound)
    }
}

fn provider_key_for(inner: &DhtInner, namespace: &str) -> String {
    let realm = inner.local_records.realm_id();
    let trimmed = namespace.trim_start_matches('/');
    if realm.is_global() {
        sys_key("provider", trimmed)
    } else {
        realm_provider_key(&realm, trimmed)
    }
}

/// Send `message` to every target, waiting at most `grace` for the batch.
/// Requests past the window keep running detached; the return value is the
/// number of successes observed inside the window.
async fn fan_out(
    inner: &Arc<DhtInner>,
    targets: Vec<RoutingNode>,
    message: Message,
    grace: Duration,
) -> usize {
    let handles: Vec<JoinHandle<bool>> = targets
        .into_iter()
        .map(|node| {
            let network = Arc::clone(&inner.network);
            let message = message.clone();
            tokio::spawn(async move {
                match network.request(&node.node_id, &node.addrs, &message).await {
                    Ok(response) => response.is_success(),
                    Err(e) => {
                        debug!(peer = %node.node_id, error = %e, "fan-out target failed");
                        false
                    }
                }
            })
        })
        .collect();

    match timeout(grace, futures::future::join_all(handles)).await {
        Ok(results) => results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count(),
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn refresh_loop(inner: Arc<DhtInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = sleep(inner.config.refresh_interval) => {}
            _ = shutdown.changed() => return,
        }
        let removed = inner.routing.remove_expired_nodes();
        if removed > 0 {
            debug!(removed, "expired routing nodes pruned");
        }

        // Probe stale buckets with a lookup for a random id inside each.
        for index in inner
            .routing
            .buckets_needing_refresh(inner.config.bucket_refresh_interval)
        {
            let target = inner.routing.random_id_in_bucket(index);
            match inner.query_engine.run(QueryKind::FindNode, target, None).await {
                Ok(_) | Err(DhtError::NoNearbyPeers) => {}
                Err(e) => debug!(bucket = index, error = %e, "bucket refresh probe failed"),
            }
            inner.routing.mark_bucket_refreshed(index);
        }

        // Snapshot the table write-through when an engine is attached.
        if let Some(kv) = &inner.kv {
            let local = inner.host.local_node_id();
            for node in inner.routing.all_nodes() {
                persistent::persist_routing_node(kv, &local, &node);
            }
        }
    }
}

async fn cleanup_loop(inner: Arc<DhtInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = sleep(inner.config.cleanup_interval) => {}
            _ = shutdown.changed() => return,
        }
        let values = inner.values.cleanup_expired();
        let providers = inner.providers.cleanup_expired();
        let records = inner.peer_records.cleanup_expired();
        inner.handler.prune_limiters();
        if values + providers + records > 0 {
            debug!(values, providers, records, "expired store entries removed");
        }
    }
}

async fn republish_loop(inner: Arc<DhtInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let interval = inner.config.effective_republish_interval();
    let mut next_republish = Instant::now() + interval;
    let mut next_addr_check = Instant::now() + MINUTE;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_republish) => {
                next_republish = Instant::now() + interval;
                maybe_republish(&inner).await;
            }
            _ = tokio::time::sleep_until(next_addr_check) => {
                next_addr_check = Instant::now() + MINUTE;
                // Address-change check between republish ticks.
                let current = inner.host.local_addrs();
                let changed = {
                    let mut last = inner.last_local_addrs.lock();
                    if *last != current {
                        *last = current.clone();
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    inner.change_tracker.record_change();
                    inner.providers.update_local_addrs(&inner.host.local_node_id(), &current);
                    maybe_republish(&inner).await;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn maybe_republish(inner: &Arc<DhtInner>) {
    if !inner.local_records.is_initialized() {
        return;
    }
    let decision = inner
        .decision_engine
        .make_publish_decision(&inner.host.local_addrs())
        .await;
    if !decision.should_publish {
        return;
    }
    let interval = inner.config.effective_republish_interval();
    if !inner.local_records.needs_republish(
        interval,
        &decision.direct_addrs,
        &decision.relay_addrs,
    ) {
        return;
    }

    let direct = match &inner.reachability {
        Some(checker) => checker.verify_addresses(&decision.direct_addrs).await.0,
        None => decision.direct_addrs.clone(),
    };
    let signed = match inner.local_records.create_signed_record(
        direct,
        decision.relay_addrs.clone(),
        decision.nat_type,
        decision.reachability,
        inner.capabilities.clone(),
        decision.ttl,
    ) {
        Ok(signed) => signed,
        Err(e) => {
            warn!(error = %e, "republish signing failed");
            return;
        }
    };

    let key = if signed.record.realm_id.is_global() {
        node_key(&signed.record.node_id)
    } else {
        realm_peer_key(&signed.record.realm_id, &signed.record.node_id)
    };
    let bytes = match signed.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "republish encode failed");
            return;
        }
    };
    if let Err(e) = inner.peer_records.put(&key, signed) {
        warn!(key, error = %e, "republish local store failed");
        return;
    }
    let targets = inner
        .routing
        .nearest_peers(&key_target(&key), inner.config.replication_factor);
    if targets.is_empty() {
        return;
    }
    let mut message = Message::request(
        MessageType::PutPeerRecord,
        inner.host.local_node_id(),
        inner.host.local_addrs(),
    );
    message.key = Some(key.clone());
    message.signed_record = Some(bytes);
    let replicated = fan_out(inner, targets, message, PUT_RECORD_GRACE).await;
    debug!(key, replicated, "periodic republish done");
}

async fn provider_cache_loop(inner: Arc<DhtInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = sleep(MINUTE) => {}
            _ = shutdown.changed() => return,
        }
        let removed = inner.provider_cache.lock().cleanup_expired();
        if removed > 0 {
            debug!(removed, "provider cache entries expired");
        }
    }
}

async fn event_loop(
    inner: Arc<DhtInner>,
    mut events: tokio::sync::broadcast::Receiver<NetworkEvent>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event bus lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                if let NetworkEvent::PeerConnected(peer) = event {
                    let addrs = inner.peerstore.addrs(&peer);
                    if addrs.is_empty() {
                        continue;
                    }
                    inner.routing.add(RoutingNode::new(peer, addrs.clone()));
                    // Measure RTT off the hot path.
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        let message = Message::request(
                            MessageType::Ping,
                            inner.host.local_node_id(),
                            inner.host.local_addrs(),
                        );
                        let started = Instant::now();
                        if let Ok(response) = inner.network.request(&peer, &addrs, &message).await {
                            if response.is_success() {
                                let rtt = started.elapsed().as_millis() as u64;
                                inner.routing.update(&peer, |n| {
                                    n.mark_responsive();
                                    n.rtt_ms = Some(rtt);
                                });
                            }
                        }
                    });
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
