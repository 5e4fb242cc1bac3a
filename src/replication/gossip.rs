//! Gossip Dissemination
//!
//! Epidemic relay of operations. Envelopes are batched in a queue that is
//! flushed once per gossip round, highest priority first. A bounded,
//! time-limited seen set suppresses duplicates so every envelope is relayed
//! at most once per node.
//!
//! Uses Sans-IO pattern: the disseminator only decides what to send; the
//! engine turns its output into transport actions.

use crate::replication::types::{GossipEnvelope, NodeId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// An envelope waiting for the next gossip round.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEnvelope {
    pub envelope: GossipEnvelope,
    /// Peer we received it from (None for locally originated envelopes)
    pub sender: Option<NodeId>,
}

impl QueuedEnvelope {
    /// Peers that must not receive this envelope.
    pub fn excluded_peers(&self) -> Vec<NodeId> {
        let mut excluded = vec![self.envelope.operation.origin.clone()];
        if let Some(sender) = &self.sender {
            excluded.push(sender.clone());
        }
        excluded
    }
}

/// Counters exposed through coordinator stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipStats {
    pub queued: usize,
    pub seen_cache: usize,
    pub envelopes_sent: u64,
    pub relayed: u64,
    pub duplicates: u64,
    pub dropped_no_target: u64,
}

/// Bounded set of gossip ids with first-seen times.
#[derive(Debug)]
struct SeenCache {
    entries: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
    capacity: usize,
    retention_ms: u64,
}

impl SeenCache {
    fn new(capacity: usize, retention_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            retention_ms,
        }
    }

    fn insert(&mut self, id: &str, now: u64) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        while self.entries.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
        true
    }

    fn remove(&mut self, id: &str) {
        // Stale order entries are skipped when popped.
        self.entries.remove(id);
    }

    #[cfg(test)]
    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((id, at)) => {
                if self.entries.get(&id) == Some(&at) {
                    self.entries.remove(&id);
                }
                true
            }
            None => false,
        }
    }

    fn purge(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        while let Some((_, at)) = self.order.front() {
            if now.saturating_sub(*at) < self.retention_ms {
                break;
            }
            self.pop_oldest();
        }
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Gossip queue plus duplicate suppression.
#[derive(Debug)]
pub struct GossipDisseminator {
    fanout: usize,
    max_hops: u32,
    seen: SeenCache,
    queue: Vec<QueuedEnvelope>,
    envelopes_sent: u64,
    relayed: u64,
    duplicates: u64,
    dropped_no_target: u64,
}

impl GossipDisseminator {
    pub fn new(fanout: usize, max_hops: u32, retention_ms: u64, capacity: usize) -> Self {
        Self {
            fanout,
            max_hops,
            seen: SeenCache::new(capacity, retention_ms),
            queue: Vec::new(),
            envelopes_sent: 0,
            relayed: 0,
            duplicates: 0,
            dropped_no_target: 0,
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Queue a freshly published operation's envelope.
    pub fn enqueue_local(&mut self, envelope: GossipEnvelope, now: u64) {
        self.seen.insert(&envelope.gossip_id, now);
        self.queue.push(QueuedEnvelope {
            envelope,
            sender: None,
        });
    }

    /// Register an inbound envelope id.
    ///
    /// Returns false (and counts a duplicate) if it was already seen.
    pub fn observe(&mut self, gossip_id: &str, now: u64) -> bool {
        if self.seen.insert(gossip_id, now) {
            true
        } else {
            self.duplicates += 1;
            false
        }
    }

    /// Forget an id so the envelope can be retried via another path.
    pub fn forget(&mut self, gossip_id: &str) {
        self.seen.remove(gossip_id);
    }

    /// Queue the relayed form of an inbound envelope if its bounds allow.
    pub fn enqueue_relay(&mut self, envelope: &GossipEnvelope, sender: &NodeId) -> bool {
        match envelope.relayed(self.max_hops) {
            Some(next) => {
                self.queue.push(QueuedEnvelope {
                    envelope: next,
                    sender: Some(sender.clone()),
                });
                true
            }
            None => false,
        }
    }

    /// Drain the queue for this round, highest priority first.
    pub fn flush(&mut self) -> Vec<QueuedEnvelope> {
        let mut batch = std::mem::take(&mut self.queue);
        batch.sort_by_key(|q| q.envelope.operation.priority);
        batch
    }

    /// Account for one flushed envelope delivered to `targets` peers.
    pub fn record_dispatch(&mut self, queued: &QueuedEnvelope, targets: usize) {
        if targets == 0 {
            self.dropped_no_target += 1;
            return;
        }
        self.envelopes_sent += targets as u64;
        if queued.sender.is_some() {
            self.relayed += 1;
        }
    }

    /// Expire old seen ids. Returns the number removed.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        self.seen.purge(now)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            queued: self.queue.len(),
            seen_cache: self.seen.len(),
            envelopes_sent: self.envelopes_sent,
            relayed: self.relayed,
            duplicates: self.duplicates,
            dropped_no_target: self.dropped_no_target,
        }
    }
}
