//! Replication Types
//!
//! Core types for the replication system: node identities, operations and
//! the gossip envelopes that carry them between peers.

use crate::replication::clock::VectorClock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identity for this process instance.
    pub fn random() -> Self {
        Self(format!("node-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique operation identifier (`<origin>-<timestamp>-<suffix>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    /// Derive a new id from the origin, creation time and a random suffix.
    pub fn generate<R: Rng + ?Sized>(origin: &NodeId, timestamp: u64, rng: &mut R) -> Self {
        Self(format!("{}-{}-{:08x}", origin, timestamp, rng.gen::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for one live transport connection.
pub type ConnectionId = u64;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Delivery priority class of an operation.
///
/// Ordered so that `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Derive the priority class from an operation kind.
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "schema_change" | "consensus_checkpoint" => Priority::Critical,
            "node_delete" | "edge_delete" | "fact_retract" => Priority::High,
            "node_create" | "node_update" | "edge_create" | "edge_update" | "fact_assert" => {
                Priority::Normal
            }
            _ => Priority::Low,
        }
    }
}

/// Change description handed to the merge collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    /// Operation kind, e.g. `node_create`
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier of the graph element being changed
    pub target: String,
    /// Change data, opaque to the sync core
    #[serde(default)]
    pub data: serde_json::Value,
}

impl OperationPayload {
    pub fn new(kind: impl Into<String>, target: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            data,
        }
    }
}

/// The unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub origin: NodeId,
    /// Snapshot of the origin's clock taken right after its tick
    pub vector_clock: VectorClock,
    pub timestamp: u64,
    pub priority: Priority,
    pub payload: OperationPayload,
}

impl Operation {
    /// Build an operation from an already-ticked clock snapshot.
    pub fn new<R: Rng + ?Sized>(
        origin: &NodeId,
        vector_clock: VectorClock,
        payload: OperationPayload,
        timestamp: u64,
        rng: &mut R,
    ) -> Self {
        Self {
            id: OperationId::generate(origin, timestamp, rng),
            origin: origin.clone(),
            vector_clock,
            timestamp,
            priority: Priority::for_kind(&payload.kind),
            payload,
        }
    }

    /// Position of this operation in its origin's sequence.
    pub fn origin_sequence(&self) -> u64 {
        self.vector_clock.get(&self.origin)
    }
}

/// Wraps an operation for epidemic relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipEnvelope {
    pub gossip_id: String,
    pub hop: u32,
    pub ttl: u32,
    pub operation: Operation,
}

impl GossipEnvelope {
    /// Fresh envelope for a newly originated operation.
    pub fn new(operation: Operation, max_hops: u32) -> Self {
        Self {
            gossip_id: uuid::Uuid::new_v4().to_string(),
            hop: 0,
            ttl: max_hops,
            operation,
        }
    }

    /// The envelope a relaying node forwards, or `None` once the bounds are spent.
    pub fn relayed(&self, max_hops: u32) -> Option<Self> {
        let hop = self.hop.checked_add(1).filter(|hop| *hop < max_hops)?;
        if self.ttl <= 1 {
            return None;
        }
        Some(Self {
            gossip_id: self.gossip_id.clone(),
            hop,
            ttl: self.ttl - 1,
            operation: self.operation.clone(),
        })
    }
}
