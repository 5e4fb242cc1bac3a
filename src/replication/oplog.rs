//! Operation Log
//!
//! Keeps the three views of replicated operations the engine needs:
//! - pending: locally published operations still waiting for acknowledgements
//! - history: a bounded window of applied operations used to answer sync requests
//! - acknowledged: every operation id ever applied here (deduplication)
//!
//! It also maintains the delivery frontier, the per-origin prefix of
//! operations known to be applied without gaps.

use crate::replication::clock::VectorClock;
use crate::replication::types::{NodeId, Operation, OperationId};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Per-origin contiguous delivery prefix.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFrontier {
    contiguous: HashMap<NodeId, u64>,
    ahead: HashMap<NodeId, BTreeSet<u64>>,
}

impl DeliveryFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the operation with `sequence` from `origin` was applied.
    pub fn observe(&mut self, origin: &NodeId, sequence: u64) {
        if sequence == 0 {
            return;
        }
        let prefix = self.contiguous.entry(origin.clone()).or_insert(0);
        if sequence <= *prefix {
            return;
        }
        let ahead = self.ahead.entry(origin.clone()).or_default();
        ahead.insert(sequence);
        while let Some(next) = prefix.checked_add(1) {
            if !ahead.remove(&next) {
                break;
            }
            *prefix = next;
        }
        if ahead.is_empty() {
            self.ahead.remove(origin);
        }
    }

    /// Highest gap-free sequence applied from `origin`.
    pub fn get(&self, origin: &NodeId) -> u64 {
        self.contiguous.get(origin).copied().unwrap_or(0)
    }

    /// Frontier expressed as a clock, suitable as a sync requester clock.
    pub fn to_clock(&self) -> VectorClock {
        let mut clock = VectorClock::new();
        for (origin, value) in &self.contiguous {
            clock.observe(origin, *value);
        }
        clock
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    operation: Operation,
    created_at: u64,
    acked_by: HashSet<NodeId>,
    replicated: bool,
}

/// Result of recording one acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Acks just reached the replication factor
    pub replicated: Option<usize>,
    /// Every known peer acknowledged; the entry left the pending set
    pub completed: bool,
}

/// In-memory operation log.
#[derive(Debug)]
pub struct OperationLog {
    pending: HashMap<OperationId, PendingEntry>,
    history: VecDeque<Operation>,
    history_capacity: usize,
    acknowledged: HashSet<OperationId>,
    frontier: DeliveryFrontier,
}

impl OperationLog {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            acknowledged: HashSet::new(),
            frontier: DeliveryFrontier::new(),
        }
    }

    /// Store a freshly published local operation.
    pub fn record_local(&mut self, operation: Operation, now: u64) {
        self.record_applied(&operation);
        self.pending.insert(
            operation.id.clone(),
            PendingEntry {
                operation,
                created_at: now,
                acked_by: HashSet::new(),
                replicated: false,
            },
        );
    }

    /// Store a remote operation after a successful merge.
    ///
    /// Returns false if the id was already known.
    pub fn record_applied(&mut self, operation: &Operation) -> bool {
        if !self.acknowledged.insert(operation.id.clone()) {
            return false;
        }
        self.frontier
            .observe(&operation.origin, operation.origin_sequence());
        self.history.push_back(operation.clone());
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        true
    }

    pub fn is_acknowledged(&self, id: &OperationId) -> bool {
        self.acknowledged.contains(id)
    }

    /// Record that `peer` acknowledged a pending operation.
    pub fn record_ack<'a>(
        &mut self,
        id: &OperationId,
        peer: &NodeId,
        replication_factor: usize,
        known_peers: impl IntoIterator<Item = &'a NodeId>,
    ) -> AckOutcome {
        let Some(entry) = self.pending.get_mut(id) else {
            return AckOutcome::default();
        };
        entry.acked_by.insert(peer.clone());

        let mut outcome = AckOutcome::default();
        if !entry.replicated && entry.acked_by.len() >= replication_factor {
            entry.replicated = true;
            outcome.replicated = Some(entry.acked_by.len());
        }

        let mut known = known_peers.into_iter().peekable();
        let any_known = known.peek().is_some();
        let all_acked = known.all(|p| entry.acked_by.contains(p));
        if any_known && all_acked {
            self.pending.remove(id);
            outcome.completed = true;
        }
        outcome
    }

    /// Drop pending entries older than `max_age_ms`. Returns the number removed.
    pub fn evict_expired(&mut self, now: u64, max_age_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| now.saturating_sub(entry.created_at) < max_age_ms);
        before - self.pending.len()
    }

    /// Operations to return for a sync request.
    ///
    /// Delta mode skips operations the requester's clock dominates and those
    /// older than `since`. The result is timestamp-ordered and capped at
    /// `batch_size`; the flag reports whether anything was cut.
    pub fn operations_for(
        &self,
        requester_clock: &VectorClock,
        since: u64,
        delta: bool,
        batch_size: usize,
    ) -> (Vec<Operation>, bool) {
        let mut ops: Vec<Operation> = self
            .history
            .iter()
            .filter(|op| {
                !delta || (op.timestamp >= since && !requester_clock.dominates(&op.vector_clock))
            })
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let truncated = ops.len() > batch_size;
        ops.truncate(batch_size);
        (ops, truncated)
    }

    pub fn frontier(&self) -> &DeliveryFrontier {
        &self.frontier
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn acknowledged_len(&self) -> usize {
        self.acknowledged.len()
    }

    pub fn acknowledged_ids(&self) -> impl Iterator<Item = &OperationId> {
        self.acknowledged.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::OperationPayload;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn op(origin: &str, seq: u64, ts: u64) -> Operation {
        let origin = NodeId::new(origin);
        let mut clock = VectorClock::new();
        clock.observe(&origin, seq);
        Operation::new(
            &origin,
            clock,
            OperationPayload::new("node_update", format!("n{}", seq), serde_json::Value::Null),
            ts,
            &mut StdRng::seed_from_u64(seq),
        )
    }

    fn peers(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|s| NodeId::new(*s)).collect()
    }

    #[test]
    fn test_frontier_tracks_contiguous_prefix() {
        let a = NodeId::new("a");
        let mut frontier = DeliveryFrontier::new();
        frontier.observe(&a, 1);
        frontier.observe(&a, 3);
        assert_eq!(frontier.get(&a), 1);

        frontier.observe(&a, 2);
        assert_eq!(frontier.get(&a), 3);
        assert_eq!(frontier.to_clock().get(&a), 3);
    }

    #[test]
    fn test_frontier_ignores_duplicates_and_zero() {
        let a = NodeId::new("a");
        let mut frontier = DeliveryFrontier::new();
        frontier.observe(&a, 0);
        frontier.observe(&a, 1);
        frontier.observe(&a, 1);
        assert_eq!(frontier.get(&a), 1);
        assert!(frontier.ahead.is_empty());
    }

    #[test]
    fn test_record_applied_deduplicates() {
        let mut log = OperationLog::new(10);
        let first = op("a", 1, 100);
        assert!(log.record_applied(&first));
        assert!(!log.record_applied(&first));
        assert_eq!(log.history_len(), 1);
        assert!(log.is_acknowledged(&first.id));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut log = OperationLog::new(3);
        for seq in 1..=5 {
            log.record_applied(&op("a", seq, seq * 10));
        }
        assert_eq!(log.history_len(), 3);
        assert_eq!(log.acknowledged_len(), 5);
    }

    #[test]
    fn test_ack_reaches_replication_factor_once() {
        let mut log = OperationLog::new(10);
        let local = op("a", 1, 100);
        log.record_local(local.clone(), 100);
        let known = peers(&["b", "c", "d"]);

        let first = log.record_ack(&local.id, &known[0], 2, &known);
        assert_eq!(first, AckOutcome::default());

        let second = log.record_ack(&local.id, &known[1], 2, &known);
        assert_eq!(second.replicated, Some(2));
        assert!(!second.completed);

        let third = log.record_ack(&local.id, &known[2], 2, &known);
        assert_eq!(third.replicated, None);
        assert!(third.completed);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_ack_for_unknown_operation_is_ignored() {
        let mut log = OperationLog::new(10);
        let known = peers(&["b"]);
        let outcome = log.record_ack(&OperationId::from("missing"), &known[0], 1, &known);
        assert_eq!(outcome, AckOutcome::default());
    }

    #[test]
    fn test_pending_needs_known_peers_to_complete() {
        let mut log = OperationLog::new(10);
        let local = op("a", 1, 100);
        log.record_local(local.clone(), 100);
        let outcome = log.record_ack(&local.id, &NodeId::new("b"), 3, &Vec::new());
        assert!(!outcome.completed);
        assert_eq!(log.pending_len(), 1);
    }

    #[test]
    fn test_evict_expired_pending() {
        let mut log = OperationLog::new(10);
        log.record_local(op("a", 1, 100), 100);
        log.record_local(op("a", 2, 900), 900);

        assert_eq!(log.evict_expired(1_000, 500), 1);
        assert_eq!(log.pending_len(), 1);
        assert_eq!(log.acknowledged_len(), 2);
    }

    #[test]
    fn test_delta_skips_dominated_and_old_operations() {
        let mut log = OperationLog::new(10);
        for seq in 1..=4 {
            log.record_applied(&op("a", seq, seq * 100));
        }
        let mut requester = VectorClock::new();
        requester.observe(&NodeId::new("a"), 2);

        let (ops, truncated) = log.operations_for(&requester, 0, true, 10);
        assert!(!truncated);
        assert_eq!(
            ops.iter().map(|o| o.origin_sequence()).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let (ops, _) = log.operations_for(&requester, 400, true, 10);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_full_mode_returns_all_history() {
        let mut log = OperationLog::new(10);
        for seq in 1..=3 {
            log.record_applied(&op("a", seq, seq * 100));
        }
        let mut requester = VectorClock::new();
        requester.observe(&NodeId::new("a"), 3);
        let (ops, _) = log.operations_for(&requester, 10_000, false, 10);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_response_is_sorted_and_truncated() {
        let mut log = OperationLog::new(10);
        log.record_applied(&op("a", 1, 300));
        log.record_applied(&op("b", 1, 100));
        log.record_applied(&op("c", 1, 200));

        let (ops, truncated) = log.operations_for(&VectorClock::new(), 0, true, 2);
        assert!(truncated);
        assert_eq!(
            ops.iter().map(|o| o.timestamp).collect::<Vec<_>>(),
            vec![100, 200]
        );
    }
}
