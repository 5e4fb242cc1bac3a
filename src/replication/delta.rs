//! Delta Synchronization
//!
//! Pull-based anti-entropy. Each round a subset of peers is asked for the
//! operations we are missing; responses advance a per-peer cursor. At most
//! one request per peer is in flight and each one is bounded by a deadline.

use crate::replication::types::NodeId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Number of recent latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    started: u64,
    deadline: u64,
}

/// How a finished request went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Response applied; carries the round-trip latency in ms
    Completed { latency_ms: u64 },
    /// Peer answered with `success: false`
    Refused,
}

/// Rolling sync counters.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    attempts: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<u64>,
}

impl SyncMetrics {
    fn record_latency(&mut self, latency_ms: u64) {
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > LATENCY_WINDOW {
            self.latencies.pop_front();
        }
    }

    /// Fraction of finished requests that succeeded (1.0 when none finished).
    pub fn success_rate(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            1.0
        } else {
            self.successes as f64 / finished as f64
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64
    }
}

/// Serializable view of the sync metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub in_flight: usize,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

/// Cursor and in-flight bookkeeping for delta sync.
#[derive(Debug)]
pub struct DeltaSynchronizer {
    timeout_ms: u64,
    batch_size: usize,
    delta_default: bool,
    cursors: HashMap<NodeId, u64>,
    in_flight: HashMap<NodeId, InFlight>,
    metrics: SyncMetrics,
}

impl DeltaSynchronizer {
    pub fn new(timeout_ms: u64, batch_size: usize, delta_default: bool) -> Self {
        Self {
            timeout_ms,
            batch_size,
            delta_default,
            cursors: HashMap::new(),
            in_flight: HashMap::new(),
            metrics: SyncMetrics::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn delta_default(&self) -> bool {
        self.delta_default
    }

    /// Time of the last successful reconciliation with `peer` (0 if never).
    pub fn cursor(&self, peer: &NodeId) -> u64 {
        self.cursors.get(peer).copied().unwrap_or(0)
    }

    pub fn is_in_flight(&self, peer: &NodeId) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Pick ⌈n/3⌉ of the idle candidates at random.
    pub fn select_targets<R: Rng + ?Sized>(&self, candidates: &[NodeId], rng: &mut R) -> Vec<NodeId> {
        let idle: Vec<&NodeId> = candidates
            .iter()
            .filter(|peer| !self.in_flight.contains_key(*peer))
            .collect();
        let count = idle.len().div_ceil(3);
        idle.choose_multiple(rng, count).map(|p| (*p).clone()).collect()
    }

    /// Open a request to `peer`. Returns the `since` cursor, or None if one is already open.
    pub fn begin(&mut self, peer: &NodeId, now: u64) -> Option<u64> {
        if self.in_flight.contains_key(peer) {
            return None;
        }
        self.in_flight.insert(
            peer.clone(),
            InFlight {
                started: now,
                deadline: now + self.timeout_ms,
            },
        );
        self.metrics.attempts += 1;
        Some(self.cursor(peer))
    }

    /// Close the open request to `peer` after a response.
    ///
    /// `newest` is the latest operation timestamp in a truncated response.
    /// Returns None for late or unsolicited responses.
    pub fn complete(
        &mut self,
        peer: &NodeId,
        success: bool,
        newest: Option<u64>,
        now: u64,
    ) -> Option<SyncOutcome> {
        let request = self.in_flight.remove(peer)?;
        if !success {
            self.metrics.failures += 1;
            return Some(SyncOutcome::Refused);
        }

        let cursor = match newest {
            Some(ts) => ts,
            None => now,
        };
        let entry = self.cursors.entry(peer.clone()).or_insert(0);
        *entry = (*entry).max(cursor);

        let latency_ms = now.saturating_sub(request.started);
        self.metrics.successes += 1;
        self.metrics.record_latency(latency_ms);
        Some(SyncOutcome::Completed { latency_ms })
    }

    /// Drop the open request because the peer went away.
    pub fn abort(&mut self, peer: &NodeId) -> bool {
        if self.in_flight.remove(peer).is_some() {
            self.metrics.failures += 1;
            true
        } else {
            false
        }
    }

    /// Remove and return requests whose deadline has passed.
    pub fn expire(&mut self, now: u64) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|(_, req)| now >= req.deadline)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &expired {
            self.in_flight.remove(peer);
            self.metrics.failures += 1;
        }
        expired
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            attempts: self.metrics.attempts,
            successes: self.metrics.successes,
            failures: self.metrics.failures,
            in_flight: self.in_flight.len(),
            success_rate: self.metrics.success_rate(),
            average_latency_ms: self.metrics.average_latency_ms(),
        }
    }
}
