//! Outbound request/response plumbing.
//!
//! One stream per request: open, write the framed request, read the framed
//! response, close. Address resolution consults only the routing table, the
//! peerstore, and caller-supplied hints; it never re-enters overlay
//! discovery. Repeated connect failures put a peer under exponential
//! backoff so dead peers stop attracting dial attempts.

use crate::error::DhtError;
use crate::host::{Host, Peerstore};
use crate::routing::RoutingTable;
use crate::wire::{read_message, write_message, Message, PROTOCOL_ID};
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

const BACKOFF_BASE: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
}

pub struct NetworkAdapter {
    host: Arc<dyn Host>,
    routing: Arc<RoutingTable>,
    peerstore: Arc<dyn Peerstore>,
    connect_timeout: Duration,
    request_timeout: Duration,
    backoff: Mutex<HashMap<NodeId, BackoffEntry>>,
    closed: AtomicBool,
}

impl NetworkAdapter {
    pub fn new(
        host: Arc<dyn Host>,
        routing: Arc<RoutingTable>,
        peerstore: Arc<dyn Peerstore>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        NetworkAdapter {
            host,
            routing,
            peerstore,
            connect_timeout,
            request_timeout,
            backoff: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Send `message` to `peer` and await its paired response.
    ///
    /// `hints` are addresses the caller already learned (e.g. from
    /// `closer_peers`); they are used only when the routing table and the
    /// peerstore know nothing.
    pub async fn request(
        &self,
        peer: &NodeId,
        hints: &[String],
        message: &Message,
    ) -> Result<Message, DhtError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DhtError::NetworkClosed);
        }

        let addrs = self.resolve_addrs(peer, hints);
        if addrs.is_empty() {
            return Err(DhtError::SendFailed(format!("no known addresses for {}", peer)));
        }
        if self.backoff_active(peer) {
            return Err(DhtError::SendFailed(format!("connect backoff active for {}", peer)));
        }

        match timeout(self.connect_timeout, self.host.connect(peer, &addrs)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.record_failure(peer);
                return Err(DhtError::SendFailed(e.to_string()));
            }
            Err(_) => {
                self.record_failure(peer);
                return Err(DhtError::Timeout);
            }
        }

        let exchange = async {
            let mut stream = self
                .host
                .open_stream(peer, PROTOCOL_ID)
                .await
                .map_err(|e| DhtError::SendFailed(e.to_string()))?;
            write_message(&mut stream, message).await?;
            read_message(&mut stream).await
        };
        let response = match timeout(self.request_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.record_failure(peer);
                return Err(e);
            }
            Err(_) => {
                debug!(peer = %peer, "request timed out");
                return Err(DhtError::Timeout);
            }
        };

        if response.request_id != message.request_id {
            return Err(DhtError::InvalidResponse(format!(
                "request id mismatch: sent {}, got {}",
                message.request_id, response.request_id
            )));
        }
        if response.msg_type != message.msg_type.response() {
            return Err(DhtError::InvalidResponse(format!(
                "unexpected response type {:?} for {:?}",
                response.msg_type, message.msg_type
            )));
        }

        self.clear_backoff(peer);
        Ok(response)
    }

    /// Stop issuing requests; in-flight exchanges finish on their own.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Routing table first, then peerstore, then caller hints.
    fn resolve_addrs(&self, peer: &NodeId, hints: &[String]) -> Vec<String> {
        if let Some(node) = self.routing.get(peer) {
            if !node.addrs.is_empty() {
                return node.addrs;
            }
        }
        let stored = self.peerstore.addrs(peer);
        if !stored.is_empty() {
            return stored;
        }
        hints.to_vec()
    }

    pub fn backoff_active(&self, peer: &NodeId) -> bool {
        self.backoff
            .lock()
            .get(peer)
            .map(|entry| entry.retry_at > Instant::now())
            .unwrap_or(false)
    }

    fn record_failure(&self, peer: &NodeId) {
        let mut backoff = self.backoff.lock();
        let entry = backoff.entry(*peer).or_insert(BackoffEntry {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let wait = BACKOFF_BASE
            .saturating_mul(1u32 << (entry.failures - 1).min(5))
            .min(BACKOFF_CAP);
        entry.retry_at = Instant::now() + wait;
        debug!(peer = %peer, failures = entry.failures, "connect failure recorded");
    }

    fn clear_backoff(&self, peer: &NodeId) {
        self.backoff.lock().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryNetwork, MemoryPeerstore};
    use crate::types::{PeerSource, RoutingNode};
    use crate::wire::MessageType;

    fn adapter_for(
        host: Arc<dyn Host>,
        routing: Arc<RoutingTable>,
        peerstore: Arc<dyn Peerstore>,
    ) -> NetworkAdapter {
        NetworkAdapter::new(
            host,
            routing,
            peerstore,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    /// Serve exactly one inbound request on `host` with a canned responder.
    fn spawn_responder(
        host: Arc<crate::host::MemoryHost>,
        respond: impl Fn(&Message) -> Message + Send + 'static,
    ) {
        tokio::spawn(async move {
            if let Ok((_, mut stream)) = host.accept_stream().await {
                if let Ok(request) = read_message(&mut stream).await {
                    let response = respond(&request);
                    let _ = write_message(&mut stream, &response).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let network = MemoryNetwork::new();
        let a = network.host(vec!["/ip4/1.1.1.1/tcp/1".to_string()]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        routing.add(RoutingNode::new(b_id, b.local_addrs()));
        let peerstore = Arc::new(MemoryPeerstore::new());
        let adapter = adapter_for(a.clone(), routing, peerstore);

        spawn_responder(b.clone(), move |req| Message::response_to(req, b_id));

        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        let response = adapter.request(&b_id, &[], &request).await.unwrap();
        assert_eq!(response.msg_type, MessageType::Pong);
        assert!(response.is_success());
        assert!(!adapter.backoff_active(&b_id));
    }

    #[tokio::test]
    async fn test_no_addresses_is_send_failed() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        let adapter = adapter_for(a, routing, Arc::new(MemoryPeerstore::new()));

        let request = Message::request(MessageType::Ping, NodeId::random(), vec![]);
        let result = adapter.request(&NodeId::random(), &[], &request).await;
        assert!(matches!(result, Err(DhtError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_hints_used_when_nothing_known() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        let adapter = adapter_for(a.clone(), routing, Arc::new(MemoryPeerstore::new()));
        spawn_responder(b.clone(), move |req| Message::response_to(req, b_id));

        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        let response = adapter
            .request(&b_id, &["/ip4/2.2.2.2/tcp/1".to_string()], &request)
            .await
            .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_peerstore_fallback_resolution() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        let peerstore = Arc::new(MemoryPeerstore::new());
        peerstore.add_addrs(&b_id, &b.local_addrs(), PeerSource::Static);
        let adapter = adapter_for(a.clone(), routing, peerstore);
        spawn_responder(b.clone(), move |req| Message::response_to(req, b_id));

        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        assert!(adapter.request(&b_id, &[], &request).await.is_ok());
    }

    #[tokio::test]
    async fn test_mismatched_request_id_is_invalid_response() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        routing.add(RoutingNode::new(b_id, b.local_addrs()));
        let adapter = adapter_for(a.clone(), routing, Arc::new(MemoryPeerstore::new()));

        spawn_responder(b.clone(), move |req| {
            let mut response = Message::response_to(req, b_id);
            response.request_id = "bogus".to_string();
            response
        });

        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        let result = adapter.request(&b_id, &[], &request).await;
        assert!(matches!(result, Err(DhtError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_peer_times_out() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        routing.add(RoutingNode::new(b_id, b.local_addrs()));
        let adapter = adapter_for(a.clone(), routing, Arc::new(MemoryPeerstore::new()));

        // No responder: the stream opens but nothing answers.
        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        let result = adapter.request(&b_id, &[], &request).await;
        assert!(matches!(result, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn test_connect_failure_triggers_backoff() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let b = network.host(vec!["/ip4/2.2.2.2/tcp/1".to_string()]);
        let b_id = b.local_node_id();

        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        routing.add(RoutingNode::new(b_id, b.local_addrs()));
        let adapter = adapter_for(a.clone(), routing, Arc::new(MemoryPeerstore::new()));

        network.disconnect(&b_id);
        let request = Message::request(MessageType::Ping, a.local_node_id(), vec![]);
        assert!(matches!(
            adapter.request(&b_id, &[], &request).await,
            Err(DhtError::SendFailed(_))
        ));
        assert!(adapter.backoff_active(&b_id));
        // Next attempt is suppressed by the backoff window.
        assert!(matches!(
            adapter.request(&b_id, &[], &request).await,
            Err(DhtError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_adapter_refuses_requests() {
        let network = MemoryNetwork::new();
        let a = network.host(vec![]);
        let routing = Arc::new(RoutingTable::new(a.local_node_id(), 20, Duration::from_secs(3600)));
        let adapter = adapter_for(a, routing, Arc::new(MemoryPeerstore::new()));
        adapter.close();
        let request = Message::request(MessageType::Ping, NodeId::random(), vec![]);
        assert!(matches!(
            adapter.request(&NodeId::random(), &[], &request).await,
            Err(DhtError::NetworkClosed)
        ));
    }
}
