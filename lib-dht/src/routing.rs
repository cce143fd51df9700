//! Kademlia k-bucket routing table
//!
//! 256 LRU buckets of up to k peers each, indexed by the MSB of the XOR
//! distance between the local id and the peer id (bucket 0 = closest pair).
//! Peer records live in an arena keyed by NodeId; buckets hold ids only, so
//! eviction is a single arena delete.

use std::collections::HashMap;

use tracing::debug;

use crate::id::{bucket_index, NodeId, ID_BITS};
use crate::peer::{Peer, PeerState};

/// Standard Kademlia per-bucket capacity.
pub const DEFAULT_K: usize = 20;

/// Default staleness threshold: one hour in milliseconds.
pub const DEFAULT_STALE_AFTER_MS: u64 = 60 * 60 * 1000;

/// Outcome of an insertion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New peer appended to its bucket.
    Added,
    /// Peer was already known; moved to the bucket tail and refreshed.
    Refreshed,
    /// Bucket was full; the returned stale peer was evicted to make room.
    Replaced(NodeId),
    /// Bucket full of live peers; the new peer was not admitted.
    Rejected,
}

/// One k-bucket: insertion-ordered ids (tail = most recently seen).
#[derive(Debug, Default)]
struct Bucket {
    ids: Vec<NodeId>,
    last_updated: u64,
}

/// Routing table statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RoutingStats {
    pub total_peers: usize,
    pub non_empty_buckets: usize,
    pub full_buckets: usize,
    pub k: usize,
}

/// The routing table: bucket index plus peer arena.
///
/// Buckets partition the known peer set: a peer resides only in the bucket
/// matching its distance from the local id, no peer appears twice, and the
/// local id is never inserted.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    peers: HashMap<NodeId, Peer>,
    k: usize,
    stale_after_ms: u64,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, stale_after_ms: u64) -> Self {
        Self {
            local_id,
            buckets: (0..ID_BITS).map(|_| Bucket::default()).collect(),
            peers: HashMap::new(),
            k,
            stale_after_ms,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Insert or refresh a peer.
    ///
    /// A full bucket admits a new peer only by replacing one whose
    /// `last_seen` is older than the stale threshold; a bucket full of live
    /// peers rejects the newcomer rather than evicting its head.
    pub fn add_peer(&mut self, mut peer: Peer, now_ms: u64) -> AddOutcome {
        let Some(bucket_idx) = bucket_index(&self.local_id, &peer.id) else {
            return AddOutcome::Rejected; // never admit self
        };

        if let Some(existing) = self.peers.get_mut(&peer.id) {
            // Known peer: adopt any new addresses, refresh recency, move to
            // the bucket tail.
            for addr in peer.addresses.drain(..) {
                if !existing.addresses.contains(&addr) {
                    existing.addresses.push(addr);
                }
            }
            existing.mark_seen(now_ms);
            let bucket = &mut self.buckets[bucket_idx];
            bucket.ids.retain(|id| id != &existing.id);
            bucket.ids.push(existing.id);
            bucket.last_updated = now_ms;
            return AddOutcome::Refreshed;
        }

        let stale_after = self.stale_after_ms;
        let bucket = &mut self.buckets[bucket_idx];
        if bucket.ids.len() >= self.k {
            let stale_id = bucket
                .ids
                .iter()
                .find(|id| {
                    self.peers
                        .get(id)
                        .map(|p| p.is_stale(now_ms, stale_after))
                        .unwrap_or(true)
                })
                .copied();

            let Some(stale_id) = stale_id else {
                return AddOutcome::Rejected;
            };

            bucket.ids.retain(|id| id != &stale_id);
            if let Some(mut evicted) = self.peers.remove(&stale_id) {
                evicted.state = PeerState::Evicted;
                debug!(peer = %stale_id, bucket = bucket_idx, "evicted stale peer");
            }
            peer.mark_seen(now_ms);
            bucket.ids.push(peer.id);
            bucket.last_updated = now_ms;
            self.peers.insert(peer.id, peer);
            return AddOutcome::Replaced(stale_id);
        }

        peer.mark_seen(now_ms);
        bucket.ids.push(peer.id);
        bucket.last_updated = now_ms;
        self.peers.insert(peer.id, peer);
        AddOutcome::Added
    }

    /// Remove a peer. Idempotent.
    pub fn remove_peer(&mut self, id: &NodeId) -> Option<Peer> {
        let peer = self.peers.remove(id)?;
        if let Some(bucket_idx) = bucket_index(&self.local_id, id) {
            self.buckets[bucket_idx].ids.retain(|b| b != id);
        }
        Some(peer)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Refresh recency for a peer after a successful exchange.
    pub fn mark_seen(&mut self, id: &NodeId, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.mark_seen(now_ms);
            if let Some(bucket_idx) = bucket_index(&self.local_id, id) {
                let bucket = &mut self.buckets[bucket_idx];
                bucket.ids.retain(|b| b != id);
                bucket.ids.push(*id);
                bucket.last_updated = now_ms;
            }
        }
    }

    /// Count a failed exchange against a peer.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.mark_failed();
        }
    }

    /// Record an observed round-trip latency for a peer.
    pub fn record_latency(&mut self, id: &NodeId, latency_ms: u64) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.metrics.latency_ms = latency_ms;
        }
    }

    /// Transition unseen peers to `Stale` and return their ids (liveness
    /// ping candidates).
    pub fn mark_stale_peers(&mut self, now_ms: u64, unseen_after_ms: u64) -> Vec<NodeId> {
        let mut stale = Vec::new();
        for peer in self.peers.values_mut() {
            if now_ms.saturating_sub(peer.last_seen) > unseen_after_ms {
                peer.state = PeerState::Stale;
                stale.push(peer.id);
            }
        }
        stale
    }

    /// The `count` closest known peers to `key`, ascending by XOR distance.
    ///
    /// Buckets are traversed outward from the key's bucket; ties (which
    /// cannot occur between distinct ids against one key) would resolve by
    /// traversal order.
    pub fn get_closest(&self, key: &NodeId, count: usize) -> Vec<Peer> {
        let start = bucket_index(&self.local_id, key).unwrap_or(0);

        let mut order = Vec::with_capacity(ID_BITS);
        order.push(start);
        for offset in 1..ID_BITS {
            if start >= offset {
                order.push(start - offset);
            }
            if start + offset < ID_BITS {
                order.push(start + offset);
            }
        }

        let mut candidates: Vec<&Peer> = Vec::with_capacity(self.peers.len());
        for idx in order {
            for id in &self.buckets[idx].ids {
                if let Some(peer) = self.peers.get(id) {
                    candidates.push(peer);
                }
            }
        }

        candidates.sort_by_key(|peer| peer.id.distance(key));
        candidates.into_iter().take(count).cloned().collect()
    }

    /// Total live peers across all buckets.
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// Ids currently assigned to a bucket, in insertion order.
    pub fn bucket_ids(&self, bucket_idx: usize) -> &[NodeId] {
        &self.buckets[bucket_idx].ids
    }

    pub fn stats(&self) -> RoutingStats {
        let non_empty = self.buckets.iter().filter(|b| !b.ids.is_empty()).count();
        let full = self.buckets.iter().filter(|b| b.ids.len() >= self.k).count();
        RoutingStats {
            total_peers: self.peers.len(),
            non_empty_buckets: non_empty,
            full_buckets: full,
            k: self.k,
        }
    }
}
