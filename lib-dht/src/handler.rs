//! Inbound request handling.
//!
//! Every message passes the same gate: non-empty sender, address filtering,
//! routing-table update. Write paths add rate limiting and full record
//! validation. Failures produce an error response; they never tear down the
//! stream loop or crash the caller.

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::host::{DhtStream, Host};
use crate::key::key_target;
use crate::limiter::{AddressFilter, RateLimiter};
use crate::record::SignedRealmPeerRecord;
use crate::routing::RoutingTable;
use crate::store::{PeerRecordStore, ProviderRecord, ProviderStore, ValueStore};
use crate::types::{NodeId, RoutingNode};
use crate::wire::{read_message, write_message, Message, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// PUT_PEER_RECORD admission: 10 per sender per minute.
const PUT_RECORD_LIMIT: usize = 10;
/// ADD_PROVIDER admission: 50 per sender per minute.
const ADD_PROVIDER_LIMIT: usize = 50;
const LIMIT_WINDOW: Duration = Duration::from_secs(60);

pub struct Handler {
    local_id: NodeId,
    host: Arc<dyn Host>,
    routing: Arc<RoutingTable>,
    values: Arc<ValueStore>,
    providers: Arc<ProviderStore>,
    peer_records: Arc<PeerRecordStore>,
    addr_filter: AddressFilter,
    put_record_limiter: RateLimiter,
    add_provider_limiter: RateLimiter,
    k: usize,
    enable_value_store: bool,
    max_record_age: Duration,
    provider_ttl: Duration,
}

impl Handler {
    pub fn new(
        config: &DhtConfig,
        host: Arc<dyn Host>,
        routing: Arc<RoutingTable>,
        values: Arc<ValueStore>,
        providers: Arc<ProviderStore>,
        peer_records: Arc<PeerRecordStore>,
    ) -> Self {
        Handler {
            local_id: host.local_node_id(),
            host,
            routing,
            values,
            providers,
            peer_records,
            addr_filter: AddressFilter::new(config.allow_private_addrs),
            put_record_limiter: RateLimiter::new(PUT_RECORD_LIMIT, LIMIT_WINDOW),
            add_provider_limiter: RateLimiter::new(ADD_PROVIDER_LIMIT, LIMIT_WINDOW),
            k: config.bucket_size,
            enable_value_store: config.enable_value_store,
            max_record_age: config.max_record_age,
            provider_ttl: config.provider_ttl,
        }
    }

    /// Serve one request on an inbound stream, then let it close.
    pub async fn handle_stream(&self, mut stream: DhtStream) {
        let request = match read_message(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "dropping unreadable inbound frame");
                return;
            }
        };
        let response = self.handle_message(request);
        if let Err(e) = write_message(&mut stream, &response).await {
            debug!(error = %e, "failed to write response");
        }
    }

    /// Gate, admit, and dispatch one request.
    pub fn handle_message(&self, request: Message) -> Message {
        if !request.msg_type.is_request() {
            return Message::error_response(&request, self.local_id, "not a request");
        }
        if request.sender.is_zero() {
            return Message::error_response(&request, self.local_id, "invalid sender");
        }

        let filtered = self.addr_filter.filter(&request.sender_addrs);
        if !request.sender_addrs.is_empty() && filtered.is_empty() {
            return Message::error_response(&request, self.local_id, "no routable addresses");
        }
        if !filtered.is_empty() {
            self.routing
                .add(RoutingNode::new(request.sender, filtered.clone()));
        } else {
            self.routing.update(&request.sender, |n| n.mark_responsive());
        }

        let result = match request.msg_type {
            MessageType::FindNode => self.on_find_node(&request),
            MessageType::FindValue => self.on_find_value(&request),
            MessageType::Store => self.on_store(&request),
            MessageType::Ping => self.on_ping(&request),
            MessageType::AddProvider => self.on_add_provider(&request, &filtered),
            MessageType::GetProviders => self.on_get_providers(&request),
            MessageType::RemoveProvider => self.on_remove_provider(&request),
            MessageType::PutPeerRecord => self.on_put_peer_record(&request),
            MessageType::GetPeerRecord => self.on_get_peer_record(&request),
            _ => Err(DhtError::BadRequest("not a request".into())),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                debug!(kind = ?request.msg_type, sender = %request.sender, error = %e, "request rejected");
                Message::error_response(&request, self.local_id, e.wire_reason())
            }
        }
    }

    fn on_find_node(&self, request: &Message) -> Result<Message, DhtError> {
        let target = request
            .target
            .ok_or_else(|| DhtError::BadRequest("missing target".into()))?;
        let mut response = Message::response_to(request, self.local_id);
        response.closer_peers = self.closer_peers(&target, &request.sender);
        Ok(response)
    }

    fn on_find_value(&self, request: &Message) -> Result<Message, DhtError> {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let mut response = Message::response_to(request, self.local_id);
        if self.enable_value_store {
            if let Some(bytes) = self.values.get(key) {
                response.value = Some(bytes);
                return Ok(response);
            }
        }
        response.closer_peers = self.closer_peers(&key_target(key), &request.sender);
        Ok(response)
    }

    fn on_store(&self, request: &Message) -> Result<Message, DhtError> {
        if !self.enable_value_store {
            return Err(DhtError::BadRequest("value store disabled".into()));
        }
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let value = request
            .value
            .clone()
            .ok_or_else(|| DhtError::BadRequest("missing value".into()))?;
        let ttl = request
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.max_record_age)
            .min(self.max_record_age);
        self.values.put(key, value, ttl);
        Ok(Message::response_to(request, self.local_id))
    }

    fn on_ping(&self, request: &Message) -> Result<Message, DhtError> {
        let mut response = Message::response_to(request, self.local_id);
        response.sender_addrs = self.host.local_addrs();
        Ok(response)
    }

    fn on_add_provider(
        &self,
        request: &Message,
        sender_addrs: &[String],
    ) -> Result<Message, DhtError> {
        if !self.add_provider_limiter.allow(&request.sender) {
            return Err(DhtError::RateLimitExceeded);
        }
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let ttl = request
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.provider_ttl)
            .min(self.provider_ttl);
        self.providers.add(
            key,
            ProviderRecord::new(request.sender, sender_addrs.to_vec(), ttl),
        );
        Ok(Message::response_to(request, self.local_id))
    }

    fn on_get_providers(&self, request: &Message) -> Result<Message, DhtError> {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let mut response = Message::response_to(request, self.local_id);
        response.providers = self
            .providers
            .get(key)
            .into_iter()
            .map(|record| crate::wire::MessagePeer {
                id: record.peer_id,
                addrs: record.addrs,
                timestamp_ns: None,
                ttl_ms: None,
            })
            .collect();
        response.closer_peers = self.closer_peers(&key_target(key), &request.sender);
        Ok(response)
    }

    fn on_remove_provider(&self, request: &Message) -> Result<Message, DhtError> {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        // Only the sender's own announcement can be withdrawn.
        self.providers.remove(key, &request.sender);
        Ok(Message::response_to(request, self.local_id))
    }

    fn on_put_peer_record(&self, request: &Message) -> Result<Message, DhtError> {
        if !self.put_record_limiter.allow(&request.sender) {
            return Err(DhtError::RateLimitExceeded);
        }
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let bytes = request
            .signed_record
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing signed record".into()))?;
        let signed = SignedRealmPeerRecord::from_bytes(bytes)?;
        let record_node = signed.record.node_id;
        let mut addrs = signed.record.direct_addrs.clone();
        addrs.extend_from_slice(&signed.record.relay_addrs);

        self.peer_records.put(key, signed)?;

        let routable = self.addr_filter.filter(&addrs);
        if !routable.is_empty() {
            self.routing.add(RoutingNode::new(record_node, routable));
        }
        Ok(Message::response_to(request, self.local_id))
    }

    fn on_get_peer_record(&self, request: &Message) -> Result<Message, DhtError> {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| DhtError::BadRequest("missing key".into()))?;
        let mut response = Message::response_to(request, self.local_id);
        match self.peer_records.get(key) {
            Some(signed) => {
                response.signed_record = Some(signed.to_bytes()?);
            }
            None => {
                response.closer_peers = self.closer_peers(&key_target(key), &request.sender);
            }
        }
        Ok(response)
    }

    fn closer_peers(&self, target: &NodeId, requester: &NodeId) -> Vec<crate::wire::MessagePeer> {
        self.routing
            .nearest_peers(target, self.k)
            .into_iter()
            .filter(|node| &node.node_id != requester)
            .map(|node| crate::wire::MessagePeer::new(node.node_id, node.addrs))
            .collect()
    }

    /// Periodic limiter housekeeping, driven by the cleanup loop.
    pub fn prune_limiters(&self) {
        self.put_record_limiter.prune();
        self.add_provider_limiter.prune();
    }
}

/// Accept-loop body: serve streams until the host errors out or shutdown.
pub async fn serve_inbound(
    handler: Arc<Handler>,
    host: Arc<dyn Host>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = host.accept_stream() => {
                match accepted {
                    Ok((peer, stream)) => {
                        debug!(peer = %peer, "inbound stream");
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle_stream(stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "inbound accept failed; stopping");
                        return;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
