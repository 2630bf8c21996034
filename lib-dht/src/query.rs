//! Iterative lookup engine.
//!
//! An α-parallel, convergent walk over the keyspace: candidates are kept in
//! a distance-sorted pending list, up to α outbound requests run at once,
//! and every reply folds its `closer_peers` back into the list. Queries end
//! early once the sought value/record is found, enough providers
//! accumulated, or K responders collected; otherwise they run the candidate
//! list dry. Per-target failures only consume that target's slot.

use crate::distance::compare_distance;
use crate::error::DhtError;
use crate::host::Host;
use crate::network::NetworkAdapter;
use crate::routing::RoutingTable;
use crate::types::{unix_now_secs, NodeId, PeerInfo};
use crate::wire::{Message, MessageType};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Early-termination threshold for provider queries.
const PROVIDER_EARLY_TERMINATION: usize = 3;
/// Safety tick for the event-driven wait loop.
const WAIT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    FindNode,
    FindValue,
    GetProviders,
    GetPeerRecord,
}

/// Everything a finished query produced.
#[derive(Debug, Default, Clone)]
pub struct QueryOutcome {
    /// Responders, distance-sorted, truncated to K.
    pub nodes: Vec<PeerInfo>,
    pub value: Option<Vec<u8>>,
    pub providers: Vec<PeerInfo>,
    /// Raw signed-record bytes; the caller deserializes and revalidates.
    pub record_bytes: Option<Vec<u8>>,
}

struct QueryState {
    /// Distance-sorted candidates, closest first, capped at 2·K.
    pending: Vec<PeerInfo>,
    queried: HashSet<NodeId>,
    result: Vec<PeerInfo>,
    value: Option<Vec<u8>>,
    providers: Vec<PeerInfo>,
    record_bytes: Option<Vec<u8>>,
    found: bool,
    running: usize,
}

impl QueryState {
    fn has_unqueried(&self) -> bool {
        self.pending.iter().any(|c| !self.queried.contains(&c.node_id))
    }
}

struct IterativeQuery {
    kind: QueryKind,
    target: NodeId,
    key: Option<String>,
    k: usize,
    base_alpha: usize,
    network: Arc<NetworkAdapter>,
    routing: Arc<RoutingTable>,
    local_id: NodeId,
    local_addrs: Vec<String>,
    state: Mutex<QueryState>,
    /// Signalled by worker tasks whenever query state advanced.
    progress: Notify,
    /// Close-once guard for the completion condition.
    completed: AtomicBool,
}

impl IterativeQuery {
    /// α adapted to conditions: wide open on a sparse table, slightly wider
    /// under a deep pending queue, otherwise the configured base.
    fn alpha(&self, pending_len: usize) -> usize {
        if self.routing.size() < 5 {
            10
        } else if pending_len > 20 {
            8
        } else {
            self.base_alpha
        }
    }

    fn build_request(&self) -> Message {
        let kind = match self.kind {
            QueryKind::FindNode => MessageType::FindNode,
            QueryKind::FindValue => MessageType::FindValue,
            QueryKind::GetProviders => MessageType::GetProviders,
            QueryKind::GetPeerRecord => MessageType::GetPeerRecord,
        };
        let mut message = Message::request(kind, self.local_id, self.local_addrs.clone());
        match self.kind {
            QueryKind::FindNode => message.target = Some(self.target),
            _ => message.key = self.key.clone(),
        }
        message
    }

    /// Completion check under the state lock.
    fn is_complete(&self, state: &QueryState) -> bool {
        if self.completed.load(Ordering::SeqCst) {
            return true;
        }
        let done = state.found
            || state.result.len() >= self.k
            || (state.running == 0 && !state.has_unqueried());
        if done {
            // First observer closes the gate; later checks short-circuit.
            self.completed.swap(true, Ordering::SeqCst);
        }
        done
    }

    async fn run(self: Arc<Self>, deadline: Instant) -> QueryOutcome {
        loop {
            {
                let mut state = self.state.lock();
                if self.is_complete(&state) {
                    break;
                }
                self.dispatch(&mut state);
                if self.is_complete(&state) {
                    break;
                }
            }
            tokio::select! {
                _ = self.progress.notified() => {}
                _ = tokio::time::sleep(WAIT_TICK) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(target = %self.target, "query deadline reached");
                    self.completed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        state
            .result
            .sort_by(|a, b| compare_distance(&a.node_id, &b.node_id, &self.target));
        state.result.truncate(self.k);
        QueryOutcome {
            nodes: state.result.clone(),
            value: state.value.take(),
            providers: std::mem::take(&mut state.providers),
            record_bytes: state.record_bytes.take(),
        }
    }

    /// Launch tasks for the closest unqueried candidates up to α.
    fn dispatch(self: &Arc<Self>, state: &mut QueryState) {
        let alpha = self.alpha(state.pending.len());
        while state.running < alpha {
            let next = state
                .pending
                .iter()
                .find(|c| !state.queried.contains(&c.node_id))
                .cloned();
            let Some(candidate) = next else { break };
            state.queried.insert(candidate.node_id);
            state.running += 1;
            let query = Arc::clone(self);
            tokio::spawn(async move {
                query.query_one(candidate).await;
            });
        }
    }

    async fn query_one(self: Arc<Self>, candidate: PeerInfo) {
        let request = self.build_request();
        self.routing.update(&candidate.node_id, |n| n.mark_queried());
        let started = Instant::now();
        let outcome = self
            .network
            .request(&candidate.node_id, &candidate.addrs, &request)
            .await;

        match outcome {
            Ok(reply) if reply.is_success() => {
                let rtt = started.elapsed();
                self.routing.update(&candidate.node_id, |n| {
                    n.mark_responsive();
                    n.rtt_ms = Some(rtt.as_millis() as u64);
                });
                self.process_response(&candidate, reply);
            }
            Ok(reply) => {
                // The peer is alive but refused; it stays in the table.
                debug!(peer = %candidate.node_id, error = ?reply.error, "query refused");
                self.routing
                    .update(&candidate.node_id, |n| n.last_seen = unix_now_secs());
            }
            Err(e) => {
                debug!(peer = %candidate.node_id, error = %e, "query target failed");
                self.routing.update(&candidate.node_id, |n| n.mark_failed());
            }
        }

        let mut state = self.state.lock();
        state.running -= 1;
        drop(state);
        self.progress.notify_one();
    }

    /// Fold one successful reply into the query state.
    fn process_response(&self, responder: &PeerInfo, reply: Message) {
        let mut state = self.state.lock();

        if !state.result.iter().any(|p| p.node_id == responder.node_id) {
            state.result.push(responder.clone());
        }

        for peer in &reply.closer_peers {
            if peer.id == self.local_id {
                continue;
            }
            if state.pending.iter().any(|c| c.node_id == peer.id) {
                continue;
            }
            state.pending.push(PeerInfo::new(peer.id, peer.addrs.clone()));
        }
        let target = self.target;
        state
            .pending
            .sort_by(|a, b| compare_distance(&a.node_id, &b.node_id, &target));
        state.pending.truncate(self.k * 2);

        match self.kind {
            QueryKind::FindValue => {
                if let Some(value) = reply.value {
                    state.value = Some(value);
                    state.found = true;
                }
            }
            QueryKind::GetPeerRecord => {
                if let Some(bytes) = reply.signed_record {
                    state.record_bytes = Some(bytes);
                    state.found = true;
                }
            }
            QueryKind::GetProviders => {
                for provider in &reply.providers {
                    if !state.providers.iter().any(|p| p.node_id == provider.id) {
                        state
                            .providers
                            .push(PeerInfo::new(provider.id, provider.addrs.clone()));
                    }
                }
                // Keep collecting closer peers for caching, but stop fanning
                // out once enough distinct providers are known.
                if state.providers.len() >= PROVIDER_EARLY_TERMINATION {
                    state.found = true;
                }
            }
            QueryKind::FindNode => {}
        }

        drop(state);
        self.progress.notify_one();
    }
}

/// Spawns iterative queries against the shared routing table and adapter.
pub struct QueryEngine {
    network: Arc<NetworkAdapter>,
    routing: Arc<RoutingTable>,
    host: Arc<dyn Host>,
    k: usize,
    base_alpha: usize,
    timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        network: Arc<NetworkAdapter>,
        routing: Arc<RoutingTable>,
        host: Arc<dyn Host>,
        k: usize,
        base_alpha: usize,
        timeout: Duration,
    ) -> Self {
        QueryEngine {
            network,
            routing,
            host,
            k,
            base_alpha,
            timeout,
        }
    }

    /// Run one iterative query to completion.
    ///
    /// Fails fast with [`DhtError::NoNearbyPeers`] when the routing table has
    /// no seed candidates.
    pub async fn run(
        &self,
        kind: QueryKind,
        target: NodeId,
        key: Option<String>,
    ) -> Result<QueryOutcome, DhtError> {
        let query = Arc::new(IterativeQuery {
            kind,
            target,
            key,
            k: self.k,
            base_alpha: self.base_alpha,
            network: Arc::clone(&self.network),
            routing: Arc::clone(&self.routing),
            local_id: self.host.local_node_id(),
            local_addrs: self.host.local_addrs(),
            state: Mutex::new(QueryState {
                pending: Vec::new(),
                queried: HashSet::new(),
                result: Vec::new(),
                value: None,
                providers: Vec::new(),
                record_bytes: None,
                found: false,
                running: 0,
            }),
            progress: Notify::new(),
            completed: AtomicBool::new(false),
        });

        let seed_width = query.alpha(0);
        let seeds = self.routing.nearest_peers(&target, seed_width);
        if seeds.is_empty() {
            return Err(DhtError::NoNearbyPeers);
        }
        {
            let mut state = query.state.lock();
            state.pending = seeds
                .into_iter()
                .map(|n| PeerInfo::new(n.node_id, n.addrs))
                .collect();
        }

        let deadline = Instant::now() + self.timeout;
        Ok(query.run(deadline).await)
    }
}
