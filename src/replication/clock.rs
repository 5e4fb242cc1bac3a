//! Vector Clock
//!
//! Per-node logical time used to reason about causal precedence between
//! operations. Clocks form a partial order: two clocks may be concurrent.

use crate::replication::types::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Map of node id -> counter. Entries never decrease.
///
/// Serialized as a list of `[nodeId, counter]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(NodeId, u64)>", into = "Vec<(NodeId, u64)>")]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a node (0 if never seen).
    pub fn get(&self, node_id: &NodeId) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Increment the local entry, returning the new value.
    ///
    /// Returns `None` and leaves the clock unchanged once the entry is exhausted.
    pub fn tick(&mut self, local: &NodeId) -> Option<u64> {
        let entry = self.entries.entry(local.clone()).or_insert(0);
        *entry = entry.checked_add(1)?;
        Some(*entry)
    }

    /// Raise an entry to at least `value`.
    pub fn observe(&mut self, node_id: &NodeId, value: u64) {
        // Absent and zero are the same entry; keep the map canonical.
        if value == 0 {
            return;
        }
        let current = self.entries.entry(node_id.clone()).or_insert(0);
        if value > *current {
            *current = value;
        }
    }

    /// Element-wise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, value) in &other.entries {
            self.observe(node_id, *value);
        }
    }

    /// True if every entry of `other` is <= the matching entry here.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(node_id, value)| self.get(node_id) >= *value)
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Before => Some(Ordering::Less),
            ClockOrdering::After => Some(Ordering::Greater),
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Concurrent => None,
        }
    }
}

impl From<Vec<(NodeId, u64)>> for VectorClock {
    fn from(pairs: Vec<(NodeId, u64)>) -> Self {
        let mut clock = VectorClock::new();
        for (node_id, value) in pairs {
            clock.observe(&node_id, value);
        }
        clock
    }
}

impl From<VectorClock> for Vec<(NodeId, u64)> {
    fn from(clock: VectorClock) -> Self {
        clock.entries.into_iter().collect()
    }
}
