//! Wire Protocol
//!
//! Every frame exchanged between peers is one JSON object carrying the
//! message `type`, the sender's `nodeId`, its full `vectorClock` and a
//! wall-clock `timestamp`, plus the type-specific fields.

use crate::replication::clock::VectorClock;
use crate::replication::types::{GossipEnvelope, NodeId, Operation, OperationId};
use serde::{Deserialize, Serialize};

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub node_id: NodeId,
    pub vector_clock: VectorClock,
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Leader election step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionAction {
    Announce,
    Victory,
}

/// Type-specific part of a wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Handshake; `reply` is set when answering the dialer's handshake
    Identification {
        #[serde(default)]
        reply: bool,
    },
    Operation {
        operation: Operation,
    },
    Gossip {
        envelope: GossipEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        requester_clock: VectorClock,
        delta: bool,
        since: u64,
    },
    SyncResponse {
        success: bool,
        #[serde(default)]
        operations: Vec<Operation>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        truncated: bool,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        operation_id: OperationId,
    },
    LeaderElection {
        action: ElectionAction,
        candidate: NodeId,
    },
    Heartbeat,
    /// Reserved for coordinator-only extensions
    Consensus {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl MessageBody {
    /// Wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageBody::Identification { .. } => "identification",
            MessageBody::Operation { .. } => "operation",
            MessageBody::Gossip { .. } => "gossip",
            MessageBody::SyncRequest { .. } => "sync_request",
            MessageBody::SyncResponse { .. } => "sync_response",
            MessageBody::Ack { .. } => "ack",
            MessageBody::LeaderElection { .. } => "leader_election",
            MessageBody::Heartbeat => "heartbeat",
            MessageBody::Consensus { .. } => "consensus",
        }
    }
}

impl WireMessage {
    pub fn new(node_id: NodeId, vector_clock: VectorClock, timestamp: u64, body: MessageBody) -> Self {
        Self {
            node_id,
            vector_clock,
            timestamp,
            body,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    /// Serialize to the JSON frame payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a JSON frame payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Build a successful sync response body.
pub fn sync_response(operations: Vec<Operation>, truncated: bool) -> MessageBody {
    MessageBody::SyncResponse {
        success: true,
        operations,
        error: None,
        truncated,
    }
}

/// Build a refused sync response body.
pub fn sync_refusal(reason: impl Into<String>) -> MessageBody {
    MessageBody::SyncResponse {
        success: false,
        operations: Vec::new(),
        error: Some(reason.into()),
        truncated: false,
    }
}

/// Operation carried by a message, if any.
pub fn carried_operation(body: &MessageBody) -> Option<&Operation> {
    match body {
        MessageBody::Operation { operation } => Some(operation),
        MessageBody::Gossip { envelope } => Some(&envelope.operation),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::OperationPayload;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn operation() -> Operation {
        let origin = NodeId::new("node-a");
        let mut clock = VectorClock::new();
        clock.tick(&origin);
        Operation::new(
            &origin,
            clock,
            OperationPayload::new("node_create", "n1", serde_json::json!({})),
            1_000,
            &mut StdRng::seed_from_u64(3),
        )
    }

    fn message(body: MessageBody) -> WireMessage {
        let mut clock = VectorClock::new();
        clock.tick(&NodeId::new("node-a"));
        WireMessage::new(NodeId::new("node-a"), clock, 1_000, body)
    }

    #[test]
    fn test_envelope_fields_are_flat() {
        let json = serde_json::to_value(message(MessageBody::Heartbeat)).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["nodeId"], "node-a");
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(json["vectorClock"], serde_json::json!([["node-a", 1]]));
    }

    #[test]
    fn test_sync_request_field_names() {
        let msg = message(MessageBody::SyncRequest {
            requester_clock: VectorClock::new(),
            delta: true,
            since: 42,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync_request");
        assert_eq!(json["requesterClock"], serde_json::json!([]));
        assert_eq!(json["since"], 42);

        let decoded = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_gossip_message_decodes() {
        let envelope = GossipEnvelope::new(operation(), 5);
        let msg = message(MessageBody::Gossip {
            envelope: envelope.clone(),
        });
        let decoded = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        match decoded.body {
            MessageBody::Gossip { envelope: got } => {
                assert_eq!(got.gossip_id, envelope.gossip_id);
                assert_eq!(got.ttl, 5);
                assert_eq!(got.operation.id, envelope.operation.id);
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_identification_reply_defaults_to_false() {
        let raw = r#"{"type":"identification","nodeId":"b","vectorClock":[],"timestamp":5}"#;
        let decoded = WireMessage::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(decoded.body, MessageBody::Identification { reply: false });
    }

    #[test]
    fn test_ack_and_election_shapes() {
        let ack = serde_json::to_value(message(MessageBody::Ack {
            operation_id: OperationId::from("op-1"),
        }))
        .unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["operationId"], "op-1");

        let election = serde_json::to_value(message(MessageBody::LeaderElection {
            action: ElectionAction::Victory,
            candidate: NodeId::new("node-z"),
        }))
        .unwrap();
        assert_eq!(election["type"], "leader_election");
        assert_eq!(election["action"], "victory");
        assert_eq!(election["candidate"], "node-z");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","nodeId":"b","vectorClock":[],"timestamp":5}"#;
        assert!(WireMessage::from_bytes(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_envelope_field_is_rejected() {
        let raw = r#"{"type":"heartbeat","nodeId":"b","timestamp":5}"#;
        assert!(WireMessage::from_bytes(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_sync_refusal() {
        match sync_refusal("busy") {
            MessageBody::SyncResponse {
                success,
                operations,
                error,
                ..
            } => {
                assert!(!success);
                assert!(operations.is_empty());
                assert_eq!(error.as_deref(), Some("busy"));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_carried_operation() {
        let op = operation();
        let body = MessageBody::Operation {
            operation: op.clone(),
        };
        assert_eq!(carried_operation(&body).map(|o| &o.id), Some(&op.id));
        assert!(carried_operation(&MessageBody::Heartbeat).is_none());
    }
}
