//! Reputation & Fault Detection
//!
//! Validates every inbound frame, counts protocol violations per peer and
//! maintains the smoothed reputation score used for gossip routing.
//! Suspicion only ever grows; once it passes the threshold the peer is
//! flagged for good.

use crate::replication::clock::VectorClock;
use crate::replication::message::{carried_operation, MessageBody, WireMessage};
use crate::replication::peers::PeerRecord;
use crate::replication::types::{NodeId, Operation};

/// Weight kept from the previous reputation on each update.
const REPUTATION_DECAY: f64 = 0.95;

/// Why an inbound message was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty node id")]
    EmptyNodeId,
    #[error("{0} received before identification")]
    Unidentified(&'static str),
    #[error("sender {claimed} does not match connection identity {actual}")]
    SenderMismatch { claimed: NodeId, actual: NodeId },
    #[error("peer claimed the local node id")]
    ImpersonatesLocal,
    #[error("timestamp skew of {skew_ms}ms is outside the freshness window")]
    Stale { skew_ms: u64 },
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("empty gossip id")]
    EmptyGossipId,
    #[error("gossip hop {hop} / ttl {ttl} outside the relay bounds")]
    HopBounds { hop: u32, ttl: u32 },
    #[error("clock claims local sequence {claimed}, ours is {local}")]
    ClockAhead { claimed: u64, local: u64 },
}

/// Blend a round-trip outcome into the previous reputation.
pub fn smoothed_reputation(old: f64, outcome: f64) -> f64 {
    (REPUTATION_DECAY * old + (1.0 - REPUTATION_DECAY) * outcome).clamp(0.0, 1.0)
}

/// Structural checks for a carried operation.
pub fn validate_operation(op: &Operation) -> Result<(), ProtocolViolation> {
    if op.id.as_str().is_empty() {
        return Err(ProtocolViolation::InvalidOperation("empty id"));
    }
    if op.origin.is_empty() {
        return Err(ProtocolViolation::InvalidOperation("empty origin"));
    }
    if op.payload.kind.is_empty() {
        return Err(ProtocolViolation::InvalidOperation("empty kind"));
    }
    if op.payload.target.is_empty() {
        return Err(ProtocolViolation::InvalidOperation("empty target"));
    }
    if op.origin_sequence() == 0 {
        return Err(ProtocolViolation::InvalidOperation("origin clock entry is zero"));
    }
    Ok(())
}

/// Reject a clock that claims more local operations than this node issued.
pub fn validate_local_entry(
    clock: &VectorClock,
    local: &NodeId,
    local_sequence: u64,
) -> Result<(), ProtocolViolation> {
    let claimed = clock.get(local);
    if claimed > local_sequence {
        return Err(ProtocolViolation::ClockAhead {
            claimed,
            local: local_sequence,
        });
    }
    Ok(())
}

/// Applies validation rules and suspicion bookkeeping.
#[derive(Debug, Clone)]
pub struct FaultDetector {
    suspicion_threshold: u32,
    freshness_ms: u64,
    max_hops: u32,
}

impl FaultDetector {
    pub fn new(suspicion_threshold: u32, freshness_ms: u64, max_hops: u32) -> Self {
        Self {
            suspicion_threshold,
            freshness_ms,
            max_hops,
        }
    }

    /// Decode a frame into a message.
    pub fn decode(&self, frame: &[u8]) -> Result<WireMessage, ProtocolViolation> {
        Ok(WireMessage::from_bytes(frame)?)
    }

    /// Validate a decoded message against the connection it arrived on.
    ///
    /// `identity` is the bound peer id, or `None` while the connection is
    /// still unidentified. `local_clock` is this node's clock: no clock on
    /// the message may run ahead of its local entry.
    pub fn validate(
        &self,
        msg: &WireMessage,
        identity: Option<&NodeId>,
        local: &NodeId,
        local_clock: &VectorClock,
        now: u64,
    ) -> Result<(), ProtocolViolation> {
        if msg.node_id.is_empty() {
            return Err(ProtocolViolation::EmptyNodeId);
        }
        if msg.node_id == *local {
            return Err(ProtocolViolation::ImpersonatesLocal);
        }

        let is_handshake = matches!(msg.body, MessageBody::Identification { .. });
        match identity {
            None if !is_handshake => return Err(ProtocolViolation::Unidentified(msg.type_name())),
            Some(actual) if !is_handshake && msg.node_id != *actual => {
                return Err(ProtocolViolation::SenderMismatch {
                    claimed: msg.node_id.clone(),
                    actual: actual.clone(),
                })
            }
            _ => {}
        }

        let skew_ms = now.abs_diff(msg.timestamp);
        if skew_ms > self.freshness_ms {
            return Err(ProtocolViolation::Stale { skew_ms });
        }

        let local_sequence = local_clock.get(local);
        validate_local_entry(&msg.vector_clock, local, local_sequence)?;

        if let MessageBody::Gossip { envelope } = &msg.body {
            if envelope.gossip_id.is_empty() {
                return Err(ProtocolViolation::EmptyGossipId);
            }
            if envelope.hop >= self.max_hops || envelope.ttl > self.max_hops {
                return Err(ProtocolViolation::HopBounds {
                    hop: envelope.hop,
                    ttl: envelope.ttl,
                });
            }
        }
        let Some(carried) = carried_operation(&msg.body) else {
            return Ok(());
        };
        validate_operation(carried)?;
        validate_local_entry(&carried.vector_clock, local, local_sequence)
    }

    /// Count one violation against a peer.
    ///
    /// Returns true only the first time the peer crosses the threshold.
    pub fn record_violation(&self, record: &mut PeerRecord) -> bool {
        record.suspicion = record.suspicion.saturating_add(1);
        if !record.flagged && record.suspicion > self.suspicion_threshold {
            record.flagged = true;
            return true;
        }
        false
    }

    /// Fold a sync round-trip outcome into the peer's reputation.
    pub fn record_outcome(&self, record: &mut PeerRecord, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        record.reputation = smoothed_reputation(record.reputation, outcome);
    }
}
