//! DHT node
//!
//! Iterative Kademlia lookups over the transport seam: FIND_NODE and
//! FIND_VALUE walk the identifier space with up to alpha RPCs in flight,
//! STORE replicates to the k closest peers, and background tasks keep peers
//! live and owned values republished. Individual RPC failures are non-fatal;
//! a lookup fails only when every candidate branch fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::DhtError;
use crate::events::{names, EventBus, EventHandler};
use crate::id::{Distance, Key, NodeId};
use crate::message::{DhtType, MessageKind, WireMessage};
use crate::now_ms;
use crate::peer::{Peer, PeerContact};
use crate::routing::{RoutingTable, RoutingStats, DEFAULT_K};
use crate::store::{Envelope, Signer, ValueStore};
use crate::transport::{RequestHandler, Transport, DEFAULT_RPC_TIMEOUT};

/// Lookup concurrency: RPCs in flight per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Node configuration. Every tunable of the routing and lookup layer lives
/// here; the node never reads configuration from disk.
#[derive(Clone)]
pub struct DhtConfig {
    /// Fixed identity; generated randomly when absent.
    pub id: Option<NodeId>,
    /// Address this node advertises to peers.
    pub address: String,
    /// Replication width and bucket capacity.
    pub k: usize,
    /// Lookup concurrency.
    pub alpha: usize,
    /// Per-RPC and per-lookup deadline.
    pub rpc_timeout: Duration,
    /// Cadence of the liveness/maintenance task.
    pub maintenance_interval: Duration,
    /// Peers unseen for longer than this get pinged by maintenance.
    pub liveness_threshold: Duration,
    /// Peers unseen for longer than this are considered stale.
    pub stale_after: Duration,
    /// Cadence at which owned values are re-pushed to the current k-closest.
    pub republish_interval: Duration,
    /// Optional envelope signer for owned writes.
    pub signer: Option<Arc<dyn Signer>>,
}

impl DhtConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: None,
            address: address.into(),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            maintenance_interval: Duration::from_secs(60),
            liveness_threshold: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            signer: None,
        }
    }
}

impl std::fmt::Debug for DhtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtConfig")
            .field("address", &self.address)
            .field("k", &self.k)
            .field("alpha", &self.alpha)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish()
    }
}

/// Snapshot of node counters and table sizes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DhtNodeStats {
    pub id: String,
    pub address: String,
    pub running: bool,
    pub routing: RoutingStats,
    pub stored_values: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub rpc_failures: u64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    rpc_failures: AtomicU64,
    /// Last envelope timestamp issued by this node. Write timestamps are
    /// strictly increasing so that a put followed by a delete in the same
    /// millisecond still resolves last-writer-wins in order.
    last_write_ts: AtomicU64,
}

struct NodeInner {
    id: NodeId,
    address: String,
    config: DhtConfig,
    routing: RwLock<RoutingTable>,
    values: RwLock<ValueStore>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    events: EventBus,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Outcome of an iterative lookup.
enum LookupOutcome {
    /// The k closest responding peers.
    Nodes(Vec<PeerContact>),
    /// A value was found; carries the peers queried before the hit that did
    /// not have it (cache-on-hit candidates).
    Value(Envelope, Vec<PeerContact>),
}

/// A Kademlia DHT node bound to a pluggable transport.
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<NodeInner>,
}

impl DhtNode {
    pub fn new(config: DhtConfig) -> Self {
        let id = config.id.unwrap_or_else(NodeId::random);
        let address = config.address.clone();
        let stale_ms = config.stale_after.as_millis() as u64;
        let routing = RoutingTable::new(id, config.k, stale_ms);
        Self {
            inner: Arc::new(NodeInner {
                id,
                address,
                config,
                routing: RwLock::new(routing),
                values: RwLock::new(ValueStore::new()),
                transport: RwLock::new(None),
                events: EventBus::new(),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn contact(&self) -> PeerContact {
        PeerContact {
            id: self.inner.id,
            address: self.inner.address.clone(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a handler for a named event.
    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        self.inner.events.subscribe(event, handler);
    }

    /// The inbound side of this node, to be registered with a transport.
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::new(DhtService {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bind the node to a transport and start background maintenance.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<(), DhtError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(DhtError::AlreadyConnected);
        }
        *self.inner.transport.write().await = Some(transport);

        let maintenance = {
            let node = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(node.inner.config.maintenance_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if !node.is_running() {
                        break;
                    }
                    node.run_liveness_pass().await;
                }
            })
        };
        let republish = {
            let node = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(node.inner.config.republish_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await; // first tick fires immediately; skip it
                loop {
                    tick.tick().await;
                    if !node.is_running() {
                        break;
                    }
                    node.republish_owned().await;
                }
            })
        };
        self.inner.tasks.lock().await.extend([maintenance, republish]);

        info!(id = %self.inner.id, address = %self.inner.address, "dht node started");
        self.inner
            .events
            .emit(names::STARTED, json!({ "id": self.inner.id.to_hex() }));
        Ok(())
    }

    /// Graceful drain: no new lookups, background tasks aborted, peers
    /// cleared, transport closed.
    pub async fn stop(&self) -> Result<(), DhtError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(DhtError::NotRunning);
        }
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        {
            let mut routing = self.inner.routing.write().await;
            for peer in routing.peers() {
                routing.remove_peer(&peer.id);
            }
        }
        if let Some(transport) = self.inner.transport.write().await.take() {
            transport.close().await?;
        }
        info!(id = %self.inner.id, "dht node stopped");
        self.inner
            .events
            .emit(names::STOPPED, json!({ "id": self.inner.id.to_hex() }));
        Ok(())
    }

    /// Dial a bootstrap address, admit the peer, and populate the routing
    /// table with a self-lookup.
    pub async fn bootstrap(&self, addr: &str) -> Result<(), DhtError> {
        let transport = self.transport().await?;
        let contact = transport.dial(addr).await?;
        self.add_peer(contact).await;
        let _ = self.find_node(self.inner.id).await?;
        Ok(())
    }

    /// Admit a peer into the routing table.
    pub async fn add_peer(&self, contact: PeerContact) {
        let now = now_ms();
        let outcome = {
            let mut routing = self.inner.routing.write().await;
            routing.add_peer(Peer::new(contact.id, contact.address.clone(), now), now)
        };
        if matches!(
            outcome,
            crate::routing::AddOutcome::Added | crate::routing::AddOutcome::Replaced(_)
        ) {
            self.inner.events.emit(
                names::PEER_CONNECT,
                json!({ "id": contact.id.to_hex(), "address": contact.address }),
            );
        }
    }

    /// Snapshot of every known peer.
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.routing.read().await.peers()
    }

    /// The k closest peers to a logical key, from the local routing table.
    pub async fn find_closest(&self, key: &str) -> Vec<Peer> {
        let key = Key::for_name(key);
        self.inner
            .routing
            .read()
            .await
            .get_closest(&key, self.inner.config.k)
    }

    /// Iterative FIND_NODE: the k closest observed peers to `target`.
    ///
    /// Fails with `NoPeers` when the routing table has nothing to seed the
    /// lookup with. Writes tolerate an empty table (a lone node keeps its
    /// local replica); an explicit node lookup against nobody is a caller
    /// error.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Peer>, DhtError> {
        self.ensure_running()?;
        if self.inner.routing.read().await.size() == 0 {
            return Err(DhtError::NoPeers);
        }
        let outcome = self.run_lookup(target, false).await?;
        match outcome {
            LookupOutcome::Nodes(contacts) => {
                let now = now_ms();
                Ok(contacts
                    .into_iter()
                    .map(|c| Peer::new(c.id, c.address, now))
                    .collect())
            }
            LookupOutcome::Value(..) => unreachable!("node lookup never yields a value"),
        }
    }

    /// Store a value under a logical key on the k closest peers (and
    /// locally). Returns the replica count, the local copy included.
    pub async fn put(&self, key: &str, value: serde_json::Value) -> Result<usize, DhtError> {
        self.ensure_running()?;
        let hashed = Key::for_name(key);
        let mut envelope = Envelope::new(value, self.next_write_ts());
        if let Some(signer) = &self.inner.config.signer {
            envelope = envelope.signed(signer.as_ref());
        }
        let acks = self.write_envelope(hashed, envelope).await?;
        self.inner
            .events
            .emit(names::STORED, json!({ "key": key, "replicas": acks }));
        Ok(acks)
    }

    /// Fetch a value by logical key: local store first, then FIND_VALUE.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, DhtError> {
        self.ensure_running()?;
        let hashed = Key::for_name(key);
        if let Some(envelope) = self.inner.values.read().await.get(&hashed).cloned() {
            return Ok(Some(envelope.payload));
        }

        match self.run_lookup(hashed, true).await {
            Ok(LookupOutcome::Value(envelope, missed)) => {
                // Cache the hit locally and at the closest peer that missed.
                self.inner
                    .values
                    .write()
                    .await
                    .put(hashed, envelope.clone(), false, now_ms());
                self.cache_on_hit(hashed, envelope.clone(), missed);
                Ok(Some(envelope.payload))
            }
            Ok(LookupOutcome::Nodes(_)) => Ok(None),
            Err(DhtError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a value: a tombstone overriding prior writes by timestamp,
    /// replicated like any other store.
    pub async fn delete(&self, key: &str) -> Result<usize, DhtError> {
        self.ensure_running()?;
        let hashed = Key::for_name(key);
        let mut envelope = Envelope::tombstone(self.next_write_ts());
        if let Some(signer) = &self.inner.config.signer {
            envelope = envelope.signed(signer.as_ref());
        }
        let acks = self.write_envelope(hashed, envelope).await?;
        self.inner
            .events
            .emit(names::DELETED, json!({ "key": key, "replicas": acks }));
        Ok(acks)
    }

    pub async fn stats(&self) -> DhtNodeStats {
        DhtNodeStats {
            id: self.inner.id.to_hex(),
            address: self.inner.address.clone(),
            running: self.is_running(),
            routing: self.inner.routing.read().await.stats(),
            stored_values: self.inner.values.read().await.len(),
            messages_sent: self.inner.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.counters.messages_received.load(Ordering::Relaxed),
            rpc_failures: self.inner.counters.rpc_failures.load(Ordering::Relaxed),
        }
    }

    /// Millisecond wall clock, bumped past the previous issued value when
    /// the clock has not advanced.
    fn next_write_ts(&self) -> u64 {
        let now = now_ms();
        loop {
            let prev = self.inner.counters.last_write_ts.load(Ordering::SeqCst);
            let next = now.max(prev + 1);
            if self
                .inner
                .counters
                .last_write_ts
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    fn ensure_running(&self) -> Result<(), DhtError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DhtError::NotRunning)
        }
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>, DhtError> {
        self.inner
            .transport
            .read()
            .await
            .clone()
            .ok_or(DhtError::NotRunning)
    }

    /// Store an envelope locally as owned and replicate it to the current
    /// k-closest peers. Returns the replica count including the local copy.
    async fn write_envelope(&self, key: Key, envelope: Envelope) -> Result<usize, DhtError> {
        {
            let mut values = self.inner.values.write().await;
            values.put(key, envelope.clone(), true, now_ms());
        }

        let targets = match self.run_lookup(key, false).await? {
            LookupOutcome::Nodes(contacts) => contacts,
            LookupOutcome::Value(..) => Vec::new(),
        };
        let acks = self.store_at(&targets, key, &envelope).await;
        Ok(acks + 1)
    }

    /// Send STORE for `key` to each target; returns the ack count.
    async fn store_at(&self, targets: &[PeerContact], key: Key, envelope: &Envelope) -> usize {
        let Ok(envelope_json) = serde_json::to_value(envelope) else {
            return 0;
        };
        let rpcs = targets.iter().map(|contact| {
            let msg = WireMessage::store(&self.inner.id, &self.inner.address, &key, envelope_json.clone());
            self.send_rpc(contact.clone(), msg)
        });
        join_all(rpcs)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }

    /// Fire-and-forget cache-on-hit STORE at the closest peer that answered
    /// the lookup without the value.
    fn cache_on_hit(&self, key: Key, envelope: Envelope, missed: Vec<PeerContact>) {
        let Some(closest) = missed.into_iter().min_by_key(|c| c.id.distance(&key)) else {
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            let _ = node.store_at(&[closest], key, &envelope).await;
        });
    }

    /// One round-based iterative lookup toward `target`.
    ///
    /// The working set starts from the local routing table; each round
    /// queries up to alpha of the unqueried peers among the current k best
    /// and merges whatever they return. Convergence: the k best have all
    /// been queried and no closer peer surfaced.
    async fn run_lookup(&self, target: Key, want_value: bool) -> Result<LookupOutcome, DhtError> {
        self.ensure_running()?;
        let deadline = self.inner.config.rpc_timeout;
        match tokio::time::timeout(deadline, self.lookup_rounds(target, want_value)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DhtError::Timeout(format!(
                "lookup for {} exceeded {:?}",
                target.to_hex(),
                deadline
            ))),
        }
    }

    async fn lookup_rounds(&self, target: Key, want_value: bool) -> Result<LookupOutcome, DhtError> {
        struct Candidate {
            contact: PeerContact,
            distance: Distance,
            queried: bool,
            failed: bool,
        }

        let k = self.inner.config.k;
        let alpha = self.inner.config.alpha.max(1);

        let mut seen: HashSet<NodeId> = HashSet::new();
        seen.insert(self.inner.id);
        let mut candidates: Vec<Candidate> = self
            .inner
            .routing
            .read()
            .await
            .get_closest(&target, k)
            .into_iter()
            .filter(|peer| seen.insert(peer.id))
            .map(|peer| Candidate {
                distance: peer.id.distance(&target),
                contact: peer.contact(),
                queried: false,
                failed: false,
            })
            .collect();
        candidates.sort_by_key(|c| c.distance);

        let mut missed: Vec<PeerContact> = Vec::new();

        loop {
            let batch: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.failed)
                .take(k)
                .filter(|(_, c)| !c.queried)
                .map(|(i, _)| i)
                .take(alpha)
                .collect();

            if batch.is_empty() {
                break;
            }

            let rpcs = batch.iter().map(|&idx| {
                let contact = candidates[idx].contact.clone();
                let msg = if want_value {
                    WireMessage::find_value(&self.inner.id, &self.inner.address, &target)
                } else {
                    WireMessage::find_node(&self.inner.id, &self.inner.address, &target)
                };
                async move { (idx, self.send_rpc(contact, msg).await) }
            });

            for (idx, result) in join_all(rpcs).await {
                candidates[idx].queried = true;
                match result {
                    Ok(response) => {
                        if want_value {
                            if let Some(raw) = response.payload.value.clone() {
                                match Envelope::from_json(raw) {
                                    Some(envelope) if !envelope.is_tombstone() => {
                                        return Ok(LookupOutcome::Value(envelope, missed));
                                    }
                                    _ => {
                                        debug!(
                                            peer = %candidates[idx].contact.id,
                                            "ignoring invalid value envelope"
                                        );
                                    }
                                }
                            } else {
                                missed.push(candidates[idx].contact.clone());
                            }
                        }
                        for contact in parse_peer_list(&response) {
                            if contact.id == self.inner.id || !seen.insert(contact.id) {
                                continue;
                            }
                            candidates.push(Candidate {
                                distance: contact.id.distance(&target),
                                contact,
                                queried: false,
                                failed: false,
                            });
                        }
                    }
                    Err(e) => {
                        candidates[idx].failed = true;
                        debug!(peer = %candidates[idx].contact.id, error = %e, "lookup rpc failed");
                    }
                }
            }

            candidates.sort_by_key(|c| c.distance);
        }

        if want_value {
            return Err(DhtError::NotFound);
        }

        Ok(LookupOutcome::Nodes(
            candidates
                .into_iter()
                .filter(|c| c.queried && !c.failed)
                .take(k)
                .map(|c| c.contact)
                .collect(),
        ))
    }

    /// Send one RPC, updating counters, peer recency and metrics.
    async fn send_rpc(
        &self,
        contact: PeerContact,
        msg: WireMessage,
    ) -> Result<WireMessage, DhtError> {
        let transport = self.transport().await?;
        self.inner
            .counters
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        self.inner.events.emit(
            names::MESSAGE_SENT,
            json!({ "to": contact.id.to_hex(), "dht_type": format!("{:?}", msg.dht_type) }),
        );

        let started = std::time::Instant::now();
        match transport.send(&contact, msg).await {
            Ok(response) => {
                if let Err(e) = response.validate(now_ms()) {
                    debug!(peer = %contact.id, error = %e, "dropping invalid response");
                    self.note_failure(&contact.id).await;
                    return Err(DhtError::PeerUnreachable(contact.address.clone()));
                }
                let latency = started.elapsed().as_millis() as u64;
                {
                    // A responding peer earns (or refreshes) its table slot.
                    let now = now_ms();
                    let mut routing = self.inner.routing.write().await;
                    routing.add_peer(Peer::new(contact.id, contact.address.clone(), now), now);
                    routing.record_latency(&contact.id, latency);
                }
                self.inner
                    .counters
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.inner.events.emit(
                    names::MESSAGE_RECEIVED,
                    json!({ "from": contact.id.to_hex(), "latency_ms": latency }),
                );
                Ok(response)
            }
            Err(e) => {
                self.note_failure(&contact.id).await;
                Err(e)
            }
        }
    }

    async fn note_failure(&self, id: &NodeId) {
        self.inner
            .counters
            .rpc_failures
            .fetch_add(1, Ordering::Relaxed);
        self.inner.routing.write().await.mark_failed(id);
    }

    /// Liveness pass: ping peers unseen past the threshold, remove the ones
    /// that do not answer.
    async fn run_liveness_pass(&self) {
        let now = now_ms();
        let threshold = self.inner.config.liveness_threshold.as_millis() as u64;
        let stale_ids = self
            .inner
            .routing
            .write()
            .await
            .mark_stale_peers(now, threshold);

        for id in stale_ids {
            let Some(contact) = self
                .inner
                .routing
                .read()
                .await
                .get(&id)
                .map(|p| p.contact())
            else {
                continue;
            };
            let ping = WireMessage::ping(&self.inner.id, &self.inner.address);
            if self.send_rpc(contact.clone(), ping).await.is_err() {
                let removed = self.inner.routing.write().await.remove_peer(&id);
                if removed.is_some() {
                    debug!(peer = %id, "removed unresponsive peer");
                    self.inner
                        .events
                        .emit(names::PEER_DISCONNECT, json!({ "id": id.to_hex() }));
                }
            }
        }
    }

    /// Re-push every owned value to its current k-closest set.
    async fn republish_owned(&self) {
        let keys = self.inner.values.read().await.owned_keys();
        for key in keys {
            let Some(envelope) = self.inner.values.read().await.get(&key).cloned() else {
                continue;
            };
            match self.run_lookup(key, false).await {
                Ok(LookupOutcome::Nodes(targets)) => {
                    let acks = self.store_at(&targets, key, &envelope).await;
                    debug!(key = %key.to_hex(), acks, "republished owned value");
                }
                Ok(LookupOutcome::Value(..)) => {}
                Err(e) => warn!(key = %key.to_hex(), error = %e, "republish lookup failed"),
            }
        }
    }
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("running", &self.is_running())
            .finish()
    }
}

fn parse_peer_list(response: &WireMessage) -> Vec<PeerContact> {
    response
        .payload
        .data
        .as_ref()
        .and_then(|d| d.get("peers"))
        .and_then(|p| serde_json::from_value::<Vec<PeerContact>>(p.clone()).ok())
        .unwrap_or_default()
}

/// Inbound request service: answers queries from the routing table and the
/// value store. Every valid message refreshes the sender's peer record.
pub struct DhtService {
    inner: Arc<NodeInner>,
}

#[async_trait]
impl RequestHandler for DhtService {
    async fn handle(&self, msg: WireMessage) -> Option<WireMessage> {
        let now = now_ms();
        match msg.validate(now) {
            Ok(()) => {}
            Err(DhtError::Replay) => {
                debug!(sender = %msg.payload.sender, "dropping message outside replay window");
                return None;
            }
            Err(e) => {
                warn!(sender = %msg.payload.sender, error = %e, "dropping invalid message");
                return None;
            }
        }
        if msg.kind == MessageKind::Response || msg.dht_type == DhtType::Unknown {
            return None;
        }

        self.inner
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let sender = msg.sender_id().ok()?;
        if sender != self.inner.id {
            let outcome = {
                let mut routing = self.inner.routing.write().await;
                match msg.sender_address() {
                    Some(addr) => routing.add_peer(Peer::new(sender, addr, now), now),
                    None => {
                        routing.mark_seen(&sender, now);
                        crate::routing::AddOutcome::Refreshed
                    }
                }
            };
            if matches!(
                outcome,
                crate::routing::AddOutcome::Added | crate::routing::AddOutcome::Replaced(_)
            ) {
                self.inner
                    .events
                    .emit(names::PEER_CONNECT, json!({ "id": sender.to_hex() }));
            }
        }

        let mut response = WireMessage::response_to(&msg, &self.inner.id);
        match msg.dht_type {
            DhtType::Ping => {
                response.payload.data = Some(json!({ "pong": true }));
            }
            DhtType::FindNode => {
                let key = msg.key().ok()?;
                let contacts = self.closest_contacts(&key, &sender).await;
                response.payload.data = Some(json!({ "peers": contacts }));
            }
            DhtType::FindValue => {
                let key = msg.key().ok()?;
                let value = self.inner.values.read().await.get(&key).cloned();
                match value {
                    Some(envelope) => {
                        response.payload.value = serde_json::to_value(&envelope).ok();
                    }
                    None => {
                        let contacts = self.closest_contacts(&key, &sender).await;
                        response.payload.data = Some(json!({ "peers": contacts }));
                    }
                }
            }
            DhtType::Store => {
                let key = msg.key().ok()?;
                let envelope = Envelope::from_json(msg.payload.value.clone()?)?;
                let changed = self
                    .inner
                    .values
                    .write()
                    .await
                    .put(key, envelope, false, now);
                if changed {
                    self.inner.events.emit(
                        names::STORED,
                        json!({ "key": key.to_hex(), "origin": sender.to_hex() }),
                    );
                }
                response.payload.data = Some(json!({ "stored": changed }));
            }
            DhtType::Delete => {
                let key = msg.key().ok()?;
                let ts = msg
                    .payload
                    .value
                    .as_ref()
                    .and_then(Envelope::from_json_ref)
                    .map(|e| e.ts)
                    .unwrap_or(msg.payload.timestamp);
                let changed = self
                    .inner
                    .values
                    .write()
                    .await
                    .put(key, Envelope::tombstone(ts), false, now);
                response.payload.data = Some(json!({ "stored": changed }));
            }
            DhtType::Unknown => return None,
        }

        self.inner
            .counters
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        Some(response)
    }
}

impl DhtService {
    /// Closest known contacts to a key, excluding the asking peer.
    async fn closest_contacts(&self, key: &Key, asker: &NodeId) -> Vec<PeerContact> {
        self.inner
            .routing
            .read()
            .await
            .get_closest(key, self.inner.config.k)
            .iter()
            .filter(|peer| peer.id != *asker)
            .map(Peer::contact)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use serde_json::json;

    async fn started_node(net: &Arc<MemoryNetwork>, address: &str) -> DhtNode {
        let node = DhtNode::new(DhtConfig::new(address));
        let transport = net.attach(node.id(), address, node.handler()).await;
        node.start(Arc::new(transport)).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;
        assert!(node.is_running());
        assert!(matches!(
            node.start(Arc::new(net.attach(node.id(), "n1b", node.handler()).await))
                .await,
            Err(DhtError::AlreadyConnected)
        ));
        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(matches!(node.stop().await, Err(DhtError::NotRunning)));
        assert!(matches!(node.get("k").await, Err(DhtError::NotRunning)));
    }

    #[tokio::test]
    async fn test_single_node_put_get_delete() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;

        let acks = node.put("metadata:a", json!({"size": 3})).await.unwrap();
        assert_eq!(acks, 1); // local copy only
        assert_eq!(
            node.get("metadata:a").await.unwrap(),
            Some(json!({"size": 3}))
        );

        node.delete("metadata:a").await.unwrap();
        assert_eq!(node.get("metadata:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_two_node_store_and_remote_get() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        a.add_peer(b.contact()).await;
        b.add_peer(a.contact()).await;

        let acks = a.put("chunk:xyz", json!("payload")).await.unwrap();
        assert_eq!(acks, 2);

        // B holds a replica and can answer locally.
        assert_eq!(b.get("chunk:xyz").await.unwrap(), Some(json!("payload")));
    }

    #[tokio::test]
    async fn test_find_value_via_lookup() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        let c = started_node(&net, "c").await;
        // C only knows B; B knows A (the holder).
        b.add_peer(a.contact()).await;
        c.add_peer(b.contact()).await;

        // Store on A only (no peers on A's side yet).
        a.put("v", json!(42)).await.unwrap();

        let got = c.get("v").await.unwrap();
        assert_eq!(got, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_find_node_without_peers_fails() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "lonely").await;
        assert!(matches!(
            node.find_node(NodeId::random()).await,
            Err(DhtError::NoPeers)
        ));
        // A write on the same empty table still lands locally.
        assert_eq!(node.put("k", json!(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_key_is_none() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        a.add_peer(b.contact()).await;
        assert_eq!(a.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_overrides_on_replicas() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        a.add_peer(b.contact()).await;
        b.add_peer(a.contact()).await;

        a.put("k", json!("v")).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(json!("v")));

        a.delete("k").await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
        assert_eq!(a.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bootstrap_populates_table() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        let c = started_node(&net, "c").await;
        b.add_peer(c.contact()).await;

        a.bootstrap("b").await.unwrap();
        let peers = a.peers().await;
        let ids: Vec<NodeId> = peers.iter().map(|p| p.id).collect();
        assert!(ids.contains(&b.id()));
        assert!(ids.contains(&c.id()));
    }

    #[tokio::test]
    async fn test_incoming_message_admits_sender() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        // B learns A only by being queried by it.
        a.add_peer(b.contact()).await;
        let _ = a.find_node(NodeId::random()).await.unwrap();

        let ids: Vec<NodeId> = b.peers().await.iter().map(|p| p.id).collect();
        assert!(ids.contains(&a.id()));
    }

    #[tokio::test]
    async fn test_stats_counters_move() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        a.add_peer(b.contact()).await;
        a.put("k", json!(1)).await.unwrap();

        let stats = a.stats().await;
        assert!(stats.messages_sent > 0);
        assert!(stats.messages_received > 0);
        assert_eq!(stats.routing.total_peers, 1);
        assert!(stats.stored_values >= 1);
    }
}
