//! Sync Engine
//!
//! Owns every piece of replication state for one node: the local clock, the
//! peer registry, the operation log, the gossip queue, sync cursors and the
//! election state. Inputs are transport events, local requests and timer
//! ticks; outputs are [`Action`]s for the caller to carry out.
//!
//! Uses Sans-IO pattern: no sockets, no timers, no tasks. Every entry point
//! takes `now` in milliseconds so runs are reproducible in tests.

use crate::replication::clock::VectorClock;
use crate::replication::config::SyncConfig;
use crate::replication::delta::{DeltaSynchronizer, SyncMetricsSnapshot, SyncOutcome};
use crate::replication::election::LeaderElection;
use crate::replication::gossip::{GossipDisseminator, GossipStats};
use crate::replication::merge::{MergeCollaborator, MergeError};
use crate::replication::message::{sync_refusal, sync_response, ElectionAction, MessageBody, WireMessage};
use crate::replication::oplog::OperationLog;
use crate::replication::peers::PeerRegistry;
use crate::replication::reputation::{
    validate_local_entry, validate_operation, FaultDetector, ProtocolViolation,
};
use crate::replication::types::{
    ConnectionId, GossipEnvelope, NodeId, Operation, OperationId, OperationPayload,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A peer finished its handshake
    PeerConnected(NodeId),
    /// A peer's last connection closed
    PeerDisconnected(NodeId),
    OperationPublished(OperationId),
    /// A remote operation was merged locally
    OperationApplied { id: OperationId, origin: NodeId },
    /// A local operation reached the replication factor
    OperationReplicated { id: OperationId, acks: usize },
    MergeFailed {
        id: OperationId,
        peer: NodeId,
        reason: String,
    },
    SyncCompleted {
        peer: NodeId,
        applied: usize,
        latency_ms: u64,
    },
    SyncFailed { peer: NodeId, reason: String },
    /// A peer crossed the suspicion threshold
    PeerSuspicious { peer: NodeId, suspicion: u32 },
    LeaderElected(NodeId),
}

/// Output action from the engine (Sans-IO pattern).
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a message on a connection
    Send {
        connection: ConnectionId,
        message: WireMessage,
    },
    /// Emit an event
    Emit(SyncEvent),
}

/// Why a local publish was rejected.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("local clock entry exhausted")]
    ClockExhausted,
}

/// Per-peer entry in the stats report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub connected: bool,
    pub address: Option<SocketAddr>,
    pub reputation: f64,
    pub suspicion: u32,
    pub flagged: bool,
    pub last_seen: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub known: usize,
    pub connected: usize,
    pub flagged: usize,
    pub connections: usize,
    pub list: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub pending: usize,
    pub history: usize,
    pub acknowledged: usize,
    pub published: u64,
    pub applied: u64,
    pub merge_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsStats {
    #[serde(flatten)]
    pub sync: SyncMetricsSnapshot,
    pub protocol_violations: u64,
    pub delivery_failures: u64,
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub node_id: NodeId,
    pub peers: PeerStats,
    pub operations: OperationStats,
    pub gossip: GossipStats,
    pub vector_clock: VectorClock,
    pub metrics: MetricsStats,
    pub leader: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Isolated,
}

/// Snapshot returned by `health_check`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub peers_connected: usize,
    pub sync_success_rate: f64,
    pub average_latency: f64,
}

#[derive(Debug, Default)]
struct Counters {
    published: u64,
    applied: u64,
    merge_failures: u64,
    violations: u64,
    delivery_failures: u64,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Protocol state machine for one node.
pub struct SyncEngine {
    local: NodeId,
    config: SyncConfig,
    clock: VectorClock,
    peers: PeerRegistry,
    log: OperationLog,
    gossip: GossipDisseminator,
    delta: DeltaSynchronizer,
    detector: FaultDetector,
    election: LeaderElection,
    merge: Arc<dyn MergeCollaborator>,
    rng: StdRng,
    counters: Counters,
}

impl SyncEngine {
    /// Create an engine; a random node id is generated when none is configured.
    pub fn new(config: SyncConfig, merge: Arc<dyn MergeCollaborator>) -> Self {
        Self::with_rng(config, merge, StdRng::from_entropy())
    }

    /// Create an engine with a deterministic random source.
    pub fn with_seed(config: SyncConfig, merge: Arc<dyn MergeCollaborator>, seed: u64) -> Self {
        Self::with_rng(config, merge, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: SyncConfig, merge: Arc<dyn MergeCollaborator>, rng: StdRng) -> Self {
        let local = if config.node_id.is_empty() {
            NodeId::random()
        } else {
            NodeId::new(config.node_id.clone())
        };

        Self {
            clock: VectorClock::new(),
            peers: PeerRegistry::new(),
            log: OperationLog::new(config.history_capacity),
            gossip: GossipDisseminator::new(
                config.gossip_fanout,
                config.gossip_max_hops,
                millis(config.gossip_retention),
                config.gossip_cache_capacity,
            ),
            delta: DeltaSynchronizer::new(
                millis(config.sync_timeout),
                config.sync_batch_size,
                config.delta_sync,
            ),
            detector: FaultDetector::new(
                config.suspicion_threshold,
                millis(config.freshness_window),
                config.gossip_max_hops,
            ),
            election: LeaderElection::new(local.clone(), millis(config.election_window)),
            local,
            config,
            merge,
            rng,
            counters: Counters::default(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.local
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.election.leader()
    }

    pub fn has_operation(&self, id: &OperationId) -> bool {
        self.log.is_acknowledged(id)
    }

    /// Every operation id applied on this node, sorted.
    pub fn acknowledged_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<OperationId> = self.log.acknowledged_ids().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_sync_in_flight(&self, peer: &NodeId) -> bool {
        self.delta.is_in_flight(peer)
    }

    pub fn queued_gossip(&self) -> usize {
        self.gossip.queue_len()
    }

    // ---- outbound helpers ----

    fn envelope(&self, body: MessageBody, now: u64) -> WireMessage {
        WireMessage::new(self.local.clone(), self.clock.clone(), now, body)
    }

    fn send(&mut self, actions: &mut Vec<Action>, connection: ConnectionId, body: MessageBody, now: u64) {
        let message = self.envelope(body, now);
        self.peers.record_sent(connection);
        actions.push(Action::Send {
            connection,
            message,
        });
    }

    fn broadcast(&mut self, actions: &mut Vec<Action>, body: MessageBody, now: u64) {
        for (_, connection) in self.peers.connected_links() {
            self.send(actions, connection, body.clone(), now);
        }
    }

    fn violation(&mut self, actions: &mut Vec<Action>, peer: &NodeId, reason: &ProtocolViolation) {
        self.counters.violations += 1;
        tracing::warn!("protocol violation from {}: {}", peer, reason);
        self.suspect(actions, peer);
    }

    fn suspect(&mut self, actions: &mut Vec<Action>, peer: &NodeId) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        if self.detector.record_violation(record) {
            tracing::warn!(
                "peer {} flagged as suspicious (suspicion {})",
                peer,
                record.suspicion
            );
            actions.push(Action::Emit(SyncEvent::PeerSuspicious {
                peer: peer.clone(),
                suspicion: record.suspicion,
            }));
        }
    }

    fn record_outcome(&mut self, peer: &NodeId, success: bool) {
        if let Some(record) = self.peers.get_mut(peer) {
            self.detector.record_outcome(record, success);
        }
    }

    // ---- transport events ----

    /// A transport connection opened. Outbound connections send our handshake first.
    pub fn handle_connected(
        &mut self,
        connection: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: bool,
        now: u64,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let temp = self.peers.attach(connection, addr, now);
        tracing::debug!("connection {} attached as {}", connection, temp);

        if outbound {
            self.send(
                &mut actions,
                connection,
                MessageBody::Identification { reply: false },
                now,
            );
            self.peers.mark_handshake_sent(connection);
        }
        actions
    }

    /// A transport connection closed.
    pub fn handle_disconnected(&mut self, connection: ConnectionId, _now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(detached) = self.peers.detach(connection) else {
            return actions;
        };
        if detached.temporary || !detached.disconnected {
            return actions;
        }

        if self.delta.abort(&detached.peer) {
            actions.push(Action::Emit(SyncEvent::SyncFailed {
                peer: detached.peer.clone(),
                reason: "peer disconnected".to_string(),
            }));
        }
        tracing::info!("peer {} disconnected", detached.peer);
        actions.push(Action::Emit(SyncEvent::PeerDisconnected(detached.peer)));
        actions
    }

    /// A raw frame arrived on a connection.
    pub fn handle_frame(&mut self, connection: ConnectionId, frame: &[u8], now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(peer) = self.peers.peer_for(connection).cloned() else {
            tracing::debug!("frame on unknown connection {}", connection);
            return actions;
        };
        match self.detector.decode(frame) {
            Ok(msg) => self.dispatch(&mut actions, connection, peer, msg, now),
            Err(e) => self.violation(&mut actions, &peer, &e),
        }
        actions
    }

    /// A decoded message arrived on a connection.
    pub fn handle_message(&mut self, connection: ConnectionId, msg: WireMessage, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(peer) = self.peers.peer_for(connection).cloned() {
            self.dispatch(&mut actions, connection, peer, msg, now);
        }
        actions
    }

    fn dispatch(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: NodeId,
        msg: WireMessage,
        now: u64,
    ) {
        let identified = self.peers.get(&peer).map(|r| !r.temporary).unwrap_or(false);
        if let Err(e) = self
            .detector
            .validate(&msg, identified.then_some(&peer), &self.local, &self.clock, now)
        {
            self.violation(actions, &peer, &e);
            return;
        }

        if let MessageBody::Identification { reply } = msg.body {
            self.on_identification(actions, connection, &peer, identified, &msg, reply, now);
            return;
        }

        self.peers.record_received(&peer, &msg.vector_clock, now);
        self.clock.merge(&msg.vector_clock);
        tracing::debug!("{} from {}", msg.type_name(), peer);

        match msg.body {
            MessageBody::Operation { operation } => {
                self.on_operation(actions, connection, &peer, operation, now);
            }
            MessageBody::Gossip { envelope } => {
                self.on_gossip(actions, connection, &peer, envelope, now);
            }
            MessageBody::SyncRequest {
                requester_clock,
                delta,
                since,
            } => {
                self.on_sync_request(actions, connection, &peer, &requester_clock, delta, since, now);
            }
            MessageBody::SyncResponse {
                success,
                operations,
                error,
                truncated,
            } => {
                self.on_sync_response(actions, connection, &peer, success, operations, error, truncated, now);
            }
            MessageBody::Ack { operation_id } => self.on_ack(actions, &peer, &operation_id),
            MessageBody::LeaderElection { action, candidate } => {
                self.on_election(actions, action, &candidate, now);
            }
            MessageBody::Consensus { .. } => {
                tracing::debug!("ignoring consensus message from {}", peer);
            }
            MessageBody::Identification { .. } | MessageBody::Heartbeat => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_identification(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        current: &NodeId,
        identified: bool,
        msg: &WireMessage,
        reply: bool,
        now: u64,
    ) {
        if identified && msg.node_id != *current {
            let violation = ProtocolViolation::SenderMismatch {
                claimed: msg.node_id.clone(),
                actual: current.clone(),
            };
            self.violation(actions, current, &violation);
            return;
        }

        let Some(outcome) = self
            .peers
            .identify(connection, &msg.node_id, &msg.vector_clock, now)
        else {
            return;
        };
        self.peers.record_received(&outcome.peer, &msg.vector_clock, now);
        self.clock.merge(&msg.vector_clock);

        if outcome.newly_connected {
            tracing::info!("peer {} connected", outcome.peer);
            actions.push(Action::Emit(SyncEvent::PeerConnected(outcome.peer.clone())));
        }
        if outcome.needs_reply && !reply {
            self.send(actions, connection, MessageBody::Identification { reply: true }, now);
            self.peers.mark_handshake_sent(connection);
        }
    }

    /// Merge a remote operation unless it is already known.
    ///
    /// Returns whether it was newly applied.
    fn apply_remote(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: &NodeId,
        operation: &Operation,
        ack_duplicates: bool,
        now: u64,
    ) -> Result<bool, MergeError> {
        if self.log.is_acknowledged(&operation.id) {
            if ack_duplicates {
                let ack = MessageBody::Ack {
                    operation_id: operation.id.clone(),
                };
                self.send(actions, connection, ack, now);
            }
            return Ok(false);
        }

        if let Err(e) = self
            .merge
            .apply_remote_update(&operation.payload.target, &operation.payload.data)
        {
            self.counters.merge_failures += 1;
            tracing::warn!("merge failed for {} from {}: {}", operation.id, peer, e);
            actions.push(Action::Emit(SyncEvent::MergeFailed {
                id: operation.id.clone(),
                peer: peer.clone(),
                reason: e.to_string(),
            }));
            self.suspect(actions, peer);
            return Err(e);
        }

        self.log.record_applied(operation);
        self.clock.merge(&operation.vector_clock);
        self.counters.applied += 1;
        actions.push(Action::Emit(SyncEvent::OperationApplied {
            id: operation.id.clone(),
            origin: operation.origin.clone(),
        }));
        let ack = MessageBody::Ack {
            operation_id: operation.id.clone(),
        };
        self.send(actions, connection, ack, now);
        Ok(true)
    }

    fn on_gossip(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: &NodeId,
        envelope: GossipEnvelope,
        now: u64,
    ) {
        if !self.gossip.observe(&envelope.gossip_id, now) {
            tracing::debug!("duplicate gossip {} from {}", envelope.gossip_id, peer);
            return;
        }
        match self.apply_remote(actions, connection, peer, &envelope.operation, false, now) {
            Ok(true) => self.relay(&envelope, peer),
            // Already applied through another path, which relayed it.
            Ok(false) => {}
            Err(_) => self.gossip.forget(&envelope.gossip_id),
        }
    }

    /// A directly pushed operation travels on as if it were hop 0 of a new envelope.
    fn on_operation(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: &NodeId,
        operation: Operation,
        now: u64,
    ) {
        if let Ok(true) = self.apply_remote(actions, connection, peer, &operation, true, now) {
            let envelope = GossipEnvelope::new(operation, self.gossip.max_hops());
            self.relay(&envelope, peer);
        }
    }

    fn relay(&mut self, envelope: &GossipEnvelope, sender: &NodeId) {
        if !self.gossip.enqueue_relay(envelope, sender) {
            tracing::debug!("gossip {} reached its hop limit", envelope.gossip_id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_sync_request(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: &NodeId,
        requester_clock: &VectorClock,
        delta: bool,
        since: u64,
        now: u64,
    ) {
        let flagged = self.peers.get(peer).map(|r| r.flagged).unwrap_or(false);
        if flagged {
            tracing::warn!("refusing sync request from flagged peer {}", peer);
            self.send(actions, connection, sync_refusal("peer flagged as suspicious"), now);
            return;
        }

        let (operations, truncated) =
            self.log
                .operations_for(requester_clock, since, delta, self.delta.batch_size());
        tracing::debug!(
            "serving {} operations to {} (truncated: {})",
            operations.len(),
            peer,
            truncated
        );
        self.send(actions, connection, sync_response(operations, truncated), now);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_sync_response(
        &mut self,
        actions: &mut Vec<Action>,
        connection: ConnectionId,
        peer: &NodeId,
        success: bool,
        operations: Vec<Operation>,
        error: Option<String>,
        truncated: bool,
        now: u64,
    ) {
        if !success {
            let reason = error.unwrap_or_else(|| "refused".to_string());
            if self.delta.complete(peer, false, None, now).is_some() {
                self.record_outcome(peer, false);
                tracing::warn!("sync with {} refused: {}", peer, reason);
                actions.push(Action::Emit(SyncEvent::SyncFailed {
                    peer: peer.clone(),
                    reason,
                }));
            }
            return;
        }

        let mut applied = 0;
        let local_sequence = self.clock.get(&self.local);
        for operation in &operations {
            let checked = validate_operation(operation)
                .and_then(|()| validate_local_entry(&operation.vector_clock, &self.local, local_sequence));
            if let Err(e) = checked {
                self.violation(actions, peer, &e);
                continue;
            }
            if let Ok(true) = self.apply_remote(actions, connection, peer, operation, false, now) {
                applied += 1;
            }
        }

        let newest = if truncated {
            operations.iter().map(|op| op.timestamp).max()
        } else {
            None
        };
        match self.delta.complete(peer, true, newest, now) {
            Some(SyncOutcome::Completed { latency_ms }) => {
                self.record_outcome(peer, true);
                tracing::debug!(
                    "sync with {} applied {} operations in {}ms",
                    peer,
                    applied,
                    latency_ms
                );
                actions.push(Action::Emit(SyncEvent::SyncCompleted {
                    peer: peer.clone(),
                    applied,
                    latency_ms,
                }));
            }
            _ => {
                tracing::debug!("late sync response from {} applied {} operations", peer, applied);
            }
        }
    }

    fn on_ack(&mut self, actions: &mut Vec<Action>, peer: &NodeId, id: &OperationId) {
        let known: Vec<NodeId> = self.peers.known_peers().map(|r| r.node_id.clone()).collect();
        let outcome = self
            .log
            .record_ack(id, peer, self.config.replication_factor, &known);

        if let Some(acks) = outcome.replicated {
            tracing::debug!("operation {} replicated to {} peers", id, acks);
            actions.push(Action::Emit(SyncEvent::OperationReplicated {
                id: id.clone(),
                acks,
            }));
        }
        if outcome.completed {
            tracing::debug!("operation {} acknowledged by every known peer", id);
        }
    }

    fn on_election(&mut self, actions: &mut Vec<Action>, action: ElectionAction, candidate: &NodeId, now: u64) {
        match action {
            ElectionAction::Announce => {
                if self.election.on_announce(candidate, now) {
                    tracing::info!("joining leader election announced by {}", candidate);
                    let body = MessageBody::LeaderElection {
                        action: ElectionAction::Announce,
                        candidate: self.local.clone(),
                    };
                    self.broadcast(actions, body, now);
                }
            }
            ElectionAction::Victory => {
                if let Some(leader) = self.election.on_victory(candidate) {
                    tracing::info!("adopted leader {}", leader);
                    actions.push(Action::Emit(SyncEvent::LeaderElected(leader)));
                }
            }
        }
    }

    // ---- local requests ----

    /// Publish a local mutation.
    ///
    /// The change is merged locally first; the clock only advances once that
    /// succeeds. Delivery to peers is best-effort and never awaited.
    pub fn publish(
        &mut self,
        payload: OperationPayload,
        now: u64,
    ) -> Result<(OperationId, Vec<Action>), PublishError> {
        if payload.kind.is_empty() {
            return Err(PublishError::InvalidPayload("empty kind"));
        }
        if payload.target.is_empty() {
            return Err(PublishError::InvalidPayload("empty target"));
        }
        let mut clock = self.clock.clone();
        clock.tick(&self.local).ok_or(PublishError::ClockExhausted)?;
        self.merge.apply_remote_update(&payload.target, &payload.data)?;

        self.clock = clock;
        let operation = Operation::new(&self.local, self.clock.clone(), payload, now, &mut self.rng);
        let id = operation.id.clone();
        self.log.record_local(operation.clone(), now);
        self.counters.published += 1;

        let mut actions = Vec::new();
        self.broadcast(
            &mut actions,
            MessageBody::Operation {
                operation: operation.clone(),
            },
            now,
        );
        self.gossip
            .enqueue_local(GossipEnvelope::new(operation, self.gossip.max_hops()), now);

        tracing::debug!("published operation {}", id);
        actions.push(Action::Emit(SyncEvent::OperationPublished(id.clone())));
        Ok((id, actions))
    }

    /// Open a sync request to one peer.
    ///
    /// Returns None if the peer is not connected or a request is already open.
    pub fn start_sync(&mut self, peer: &NodeId, delta: bool, now: u64) -> Option<Vec<Action>> {
        let connection = self.peers.connection_of(peer)?;
        let cursor = self.delta.begin(peer, now)?;

        let body = MessageBody::SyncRequest {
            requester_clock: self.log.frontier().to_clock(),
            delta,
            since: if delta { cursor } else { 0 },
        };
        let mut actions = Vec::new();
        self.send(&mut actions, connection, body, now);
        Some(actions)
    }

    /// Start a leader election unless one is running.
    pub fn trigger_election(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.election.start(now) {
            tracing::info!("starting leader election");
            let body = MessageBody::LeaderElection {
                action: ElectionAction::Announce,
                candidate: self.local.clone(),
            };
            self.broadcast(&mut actions, body, now);
        }
        actions
    }

    /// Count a frame the transport could not queue.
    pub fn record_delivery_failure(&mut self, connection: ConnectionId) {
        self.counters.delivery_failures += 1;
        tracing::warn!("dropped frame for connection {}: send queue full", connection);
    }

    // ---- timer ticks ----

    /// Flush the gossip queue to weighted random targets.
    pub fn on_gossip_tick(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        for queued in self.gossip.flush() {
            let targets = self.peers.select_gossip_targets(
                &queued.excluded_peers(),
                self.gossip.fanout(),
                now,
                &mut self.rng,
            );
            self.gossip.record_dispatch(&queued, targets.len());
            if targets.is_empty() {
                tracing::debug!("no eligible target for gossip {}", queued.envelope.gossip_id);
                continue;
            }
            for (_, connection) in targets {
                let body = MessageBody::Gossip {
                    envelope: queued.envelope.clone(),
                };
                self.send(&mut actions, connection, body, now);
            }
        }
        actions
    }

    /// Start a delta-sync round with a third of the idle peers.
    pub fn on_sync_tick(&mut self, now: u64) -> Vec<Action> {
        let candidates: Vec<NodeId> = self
            .peers
            .connected_links()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| self.peers.get(id).map(|r| !r.flagged).unwrap_or(false))
            .collect();
        let targets = self.delta.select_targets(&candidates, &mut self.rng);
        let delta = self.delta.delta_default();

        let mut actions = Vec::new();
        for peer in targets {
            if let Some(sent) = self.start_sync(&peer, delta, now) {
                actions.extend(sent);
            }
        }
        actions
    }

    pub fn on_heartbeat_tick(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        self.broadcast(&mut actions, MessageBody::Heartbeat, now);
        actions
    }

    /// Expire seen gossip ids and stale pending operations.
    pub fn on_cleanup_tick(&mut self, now: u64) -> Vec<Action> {
        let expired = self.gossip.purge_expired(now);
        let evicted = self
            .log
            .evict_expired(now, millis(self.config.operation_max_age));
        if expired > 0 || evicted > 0 {
            tracing::debug!(
                "cleanup: {} gossip ids expired, {} pending operations evicted",
                expired,
                evicted
            );
        }
        Vec::new()
    }

    /// Time out sync requests and resolve a finished election.
    pub fn on_fault_tick(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        for peer in self.delta.expire(now) {
            tracing::warn!("sync with {} timed out", peer);
            self.record_outcome(&peer, false);
            self.suspect(&mut actions, &peer);
            actions.push(Action::Emit(SyncEvent::SyncFailed {
                peer,
                reason: "timeout".to_string(),
            }));
        }

        if let Some(leader) = self.election.poll(now) {
            tracing::info!("leader elected: {}", leader);
            actions.push(Action::Emit(SyncEvent::LeaderElected(leader.clone())));
            if self.election.is_leader() {
                let body = MessageBody::LeaderElection {
                    action: ElectionAction::Victory,
                    candidate: leader,
                };
                self.broadcast(&mut actions, body, now);
            }
        }
        actions
    }

    // ---- reporting ----

    pub fn stats(&self) -> SyncStats {
        let mut list: Vec<PeerSummary> = self
            .peers
            .known_peers()
            .map(|r| PeerSummary {
                node_id: r.node_id.clone(),
                connected: r.is_connected(),
                address: r.addr,
                reputation: r.reputation,
                suspicion: r.suspicion,
                flagged: r.flagged,
                last_seen: r.last_seen,
                messages_sent: r.messages_sent,
                messages_received: r.messages_received,
            })
            .collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        SyncStats {
            node_id: self.local.clone(),
            peers: PeerStats {
                known: list.len(),
                connected: list.iter().filter(|p| p.connected).count(),
                flagged: list.iter().filter(|p| p.flagged).count(),
                connections: self.peers.connection_count(),
                list,
            },
            operations: OperationStats {
                pending: self.log.pending_len(),
                history: self.log.history_len(),
                acknowledged: self.log.acknowledged_len(),
                published: self.counters.published,
                applied: self.counters.applied,
                merge_failures: self.counters.merge_failures,
            },
            gossip: self.gossip.stats(),
            vector_clock: self.clock.clone(),
            metrics: MetricsStats {
                sync: self.delta.snapshot(),
                protocol_violations: self.counters.violations,
                delivery_failures: self.counters.delivery_failures,
            },
            leader: self.election.leader().cloned(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let peers_connected = self.peers.connected_peers().count();
        let status = if peers_connected < self.config.min_healthy_peers {
            HealthStatus::Isolated
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            peers_connected,
            sync_success_rate: self.delta.metrics().success_rate(),
            average_latency: self.delta.metrics().average_latency_ms(),
        }
    }
}
