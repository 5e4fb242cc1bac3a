//! Peer Registry
//!
//! Tracks every known peer, the live connections that map to it, and the
//! per-peer health data used for routing decisions. Records survive
//! disconnection so reputation and suspicion carry over to a reconnect.

use crate::replication::clock::VectorClock;
use crate::replication::types::{ConnectionId, NodeId};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Reputation assigned to a peer we know nothing about.
pub const INITIAL_REPUTATION: f64 = 0.5;

/// Seconds of silence at which recency drops to one half.
const RECENCY_HALF_LIFE_SECS: f64 = 10.0;

/// Everything we know about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    /// Live connection used for sending (None while disconnected)
    pub connection: Option<ConnectionId>,
    pub addr: Option<SocketAddr>,
    /// Last time (ms) a valid message arrived
    pub last_seen: u64,
    pub last_clock: VectorClock,
    /// Smoothed round-trip success in [0, 1]
    pub reputation: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Protocol violations observed; never decreases
    pub suspicion: u32,
    /// Set once suspicion exceeds the threshold; never cleared
    pub flagged: bool,
    /// Placeholder identity until the handshake arrives
    pub temporary: bool,
}

impl PeerRecord {
    fn new(node_id: NodeId, addr: Option<SocketAddr>, now: u64, temporary: bool) -> Self {
        Self {
            node_id,
            connection: None,
            addr,
            last_seen: now,
            last_clock: VectorClock::new(),
            reputation: INITIAL_REPUTATION,
            messages_sent: 0,
            messages_received: 0,
            suspicion: 0,
            flagged: false,
            temporary,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// 1.0 right after contact, decaying with silence.
    pub fn recency(&self, now: u64) -> f64 {
        let age_secs = now.saturating_sub(self.last_seen) as f64 / 1000.0;
        1.0 / (1.0 + age_secs / RECENCY_HALF_LIFE_SECS)
    }

    /// Gossip routing weight: 0.7 reputation + 0.3 recency.
    pub fn routing_weight(&self, now: u64) -> f64 {
        0.7 * self.reputation + 0.3 * self.recency(now)
    }

    /// Connected, identified and not flagged.
    pub fn is_routable(&self) -> bool {
        self.is_connected() && !self.temporary && !self.flagged
    }
}

#[derive(Debug, Clone)]
struct ConnectionState {
    peer: NodeId,
    addr: Option<SocketAddr>,
    handshake_sent: bool,
}

/// Result of binding a connection to a real identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identified {
    pub peer: NodeId,
    /// The peer had no live connection before this handshake
    pub newly_connected: bool,
    /// We still owe this connection our own handshake
    pub needs_reply: bool,
}

/// Result of a connection closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub peer: NodeId,
    /// The peer has no live connection left
    pub disconnected: bool,
    pub temporary: bool,
}

/// Bidirectional map of connections and peer records.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: HashMap<NodeId, PeerRecord>,
    connections: HashMap<ConnectionId, ConnectionState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection under a temporary identity.
    pub fn attach(&mut self, conn: ConnectionId, addr: Option<SocketAddr>, now: u64) -> NodeId {
        let temp_id = match addr {
            Some(addr) => NodeId::new(format!("peer-{}#{}", addr, conn)),
            None => NodeId::new(format!("peer-conn-{}", conn)),
        };
        let mut record = PeerRecord::new(temp_id.clone(), addr, now, true);
        record.connection = Some(conn);
        self.records.insert(temp_id.clone(), record);
        self.connections.insert(
            conn,
            ConnectionState {
                peer: temp_id.clone(),
                addr,
                handshake_sent: false,
            },
        );
        temp_id
    }

    /// Remember that our handshake went out on this connection.
    pub fn mark_handshake_sent(&mut self, conn: ConnectionId) {
        if let Some(state) = self.connections.get_mut(&conn) {
            state.handshake_sent = true;
        }
    }

    /// Bind a connection to the identity announced in its handshake.
    pub fn identify(
        &mut self,
        conn: ConnectionId,
        real_id: &NodeId,
        clock: &VectorClock,
        now: u64,
    ) -> Option<Identified> {
        let state = self.connections.get_mut(&conn)?;
        let needs_reply = !state.handshake_sent;
        let previous = std::mem::replace(&mut state.peer, real_id.clone());
        let addr = state.addr;

        // Whatever the placeholder accumulated belongs to the real peer.
        let from_placeholder = previous != *real_id
            && self.records.get(&previous).map(|r| r.temporary).unwrap_or(false);
        let placeholder = if from_placeholder {
            self.records.remove(&previous)
        } else {
            None
        };

        let record = self
            .records
            .entry(real_id.clone())
            .or_insert_with(|| PeerRecord::new(real_id.clone(), addr, now, false));
        let newly_connected = record.connection.is_none();
        record.connection = Some(conn);
        record.temporary = false;
        if addr.is_some() {
            record.addr = addr;
        }
        record.last_seen = now;
        record.last_clock.merge(clock);
        if let Some(old) = placeholder {
            record.messages_sent += old.messages_sent;
            record.messages_received += old.messages_received;
            record.suspicion = record.suspicion.max(old.suspicion);
            record.flagged |= old.flagged;
        }

        Some(Identified {
            peer: real_id.clone(),
            newly_connected,
            needs_reply,
        })
    }

    /// Drop a connection, keeping the peer record unless it was never identified.
    pub fn detach(&mut self, conn: ConnectionId) -> Option<Detached> {
        let state = self.connections.remove(&conn)?;
        let peer = state.peer;

        let temporary = self.records.get(&peer).map(|r| r.temporary).unwrap_or(false);
        if temporary {
            self.records.remove(&peer);
            return Some(Detached {
                peer,
                disconnected: true,
                temporary: true,
            });
        }

        let fallback = self
            .connections
            .iter()
            .find(|(_, s)| s.peer == peer)
            .map(|(id, _)| *id);

        let mut disconnected = false;
        if let Some(record) = self.records.get_mut(&peer) {
            if record.connection == Some(conn) {
                record.connection = fallback;
            }
            disconnected = record.connection.is_none();
        }

        Some(Detached {
            peer,
            disconnected,
            temporary: false,
        })
    }

    /// Identity currently bound to a connection.
    pub fn peer_for(&self, conn: ConnectionId) -> Option<&NodeId> {
        self.connections.get(&conn).map(|s| &s.peer)
    }

    pub fn get(&self, peer: &NodeId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    pub fn get_mut(&mut self, peer: &NodeId) -> Option<&mut PeerRecord> {
        self.records.get_mut(peer)
    }

    /// Connection to use when sending to an identified peer.
    pub fn connection_of(&self, peer: &NodeId) -> Option<ConnectionId> {
        self.records
            .get(peer)
            .filter(|r| !r.temporary)
            .and_then(|r| r.connection)
    }

    /// Record a valid inbound message.
    pub fn record_received(&mut self, peer: &NodeId, clock: &VectorClock, now: u64) {
        if let Some(record) = self.records.get_mut(peer) {
            record.messages_received += 1;
            record.last_seen = now;
            record.last_clock.merge(clock);
        }
    }

    /// Record an outbound message to the peer behind a connection.
    pub fn record_sent(&mut self, conn: ConnectionId) {
        if let Some(state) = self.connections.get(&conn) {
            if let Some(record) = self.records.get_mut(&state.peer) {
                record.messages_sent += 1;
            }
        }
    }

    /// All identified peers, connected or not.
    pub fn known_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values().filter(|r| !r.temporary)
    }

    /// Identified peers with a live connection.
    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records
            .values()
            .filter(|r| !r.temporary && r.is_connected())
    }

    /// Connected identified peers as (id, connection), ordered by id.
    pub fn connected_links(&self) -> Vec<(NodeId, ConnectionId)> {
        let mut links: Vec<(NodeId, ConnectionId)> = self
            .connected_peers()
            .filter_map(|r| r.connection.map(|c| (r.node_id.clone(), c)))
            .collect();
        links.sort();
        links
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Weighted random fan-out over routable peers.
    ///
    /// Sampling without replacement with keys `u^(1/w)`: heavier peers are
    /// preferred while near-equal candidates are ordered randomly.
    pub fn select_gossip_targets<R: Rng + ?Sized>(
        &self,
        exclude: &[NodeId],
        fanout: usize,
        now: u64,
        rng: &mut R,
    ) -> Vec<(NodeId, ConnectionId)> {
        let mut candidates: Vec<&PeerRecord> = self
            .records
            .values()
            .filter(|r| r.is_routable() && !exclude.contains(&r.node_id))
            .collect();
        // Stable draw order so a seeded rng gives repeatable picks.
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let mut keyed: Vec<(f64, NodeId, ConnectionId)> = candidates
            .into_iter()
            .filter_map(|r| {
                let conn = r.connection?;
                let weight = r.routing_weight(now).max(0.01);
                let key = rng.gen::<f64>().powf(1.0 / weight);
                Some((key, r.node_id.clone(), conn))
            })
            .collect();

        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        keyed
            .into_iter()
            .take(fanout)
            .map(|(_, id, conn)| (id, conn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(port: u16) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn identified(registry: &mut PeerRegistry, conn: ConnectionId, id: &str, now: u64) -> NodeId {
        registry.attach(conn, addr(9000 + conn as u16), now);
        registry
            .identify(conn, &NodeId::new(id), &VectorClock::new(), now)
            .unwrap()
            .peer
    }

    #[test]
    fn test_attach_allocates_temporary_identity() {
        let mut registry = PeerRegistry::new();
        let temp = registry.attach(1, addr(7000), 0);

        assert!(temp.as_str().starts_with("peer-127.0.0.1:7000"));
        let record = registry.get(&temp).unwrap();
        assert!(record.temporary);
        assert_eq!(record.connection, Some(1));
        assert_eq!(registry.connected_peers().count(), 0);
    }

    #[test]
    fn test_identify_replaces_temporary_record() {
        let mut registry = PeerRegistry::new();
        let temp = registry.attach(1, addr(7000), 0);
        registry.record_sent(1);

        let mut clock = VectorClock::new();
        clock.tick(&NodeId::new("b"));
        let outcome = registry.identify(1, &NodeId::new("b"), &clock, 10).unwrap();

        assert!(outcome.newly_connected);
        assert!(outcome.needs_reply);
        assert!(registry.get(&temp).is_none());
        let record = registry.get(&NodeId::new("b")).unwrap();
        assert!(!record.temporary);
        assert_eq!(record.messages_sent, 1);
        assert_eq!(record.last_clock, clock);
        assert_eq!(registry.peer_for(1), Some(&NodeId::new("b")));
    }

    #[test]
    fn test_identify_keeps_pre_handshake_suspicion() {
        let mut registry = PeerRegistry::new();
        let temp = registry.attach(1, addr(7000), 0);
        {
            let record = registry.get_mut(&temp).unwrap();
            record.suspicion = 6;
            record.flagged = true;
        }

        let peer = registry
            .identify(1, &NodeId::new("x"), &VectorClock::new(), 10)
            .unwrap()
            .peer;
        let record = registry.get(&peer).unwrap();
        assert_eq!(record.suspicion, 6);
        assert!(record.flagged);
        assert!(!record.is_routable());
    }

    #[test]
    fn test_identify_keeps_higher_known_suspicion() {
        let mut registry = PeerRegistry::new();
        let peer = identified(&mut registry, 1, "x", 0);
        registry.get_mut(&peer).unwrap().suspicion = 4;
        registry.detach(1);

        let temp = registry.attach(2, addr(7001), 5);
        registry.get_mut(&temp).unwrap().suspicion = 1;
        registry.identify(2, &peer, &VectorClock::new(), 5).unwrap();

        let record = registry.get(&peer).unwrap();
        assert_eq!(record.suspicion, 4);
        assert!(!record.flagged);
    }

    #[test]
    fn test_handshake_sent_suppresses_reply() {
        let mut registry = PeerRegistry::new();
        registry.attach(1, addr(7000), 0);
        registry.mark_handshake_sent(1);
        let outcome = registry
            .identify(1, &NodeId::new("b"), &VectorClock::new(), 0)
            .unwrap();
        assert!(!outcome.needs_reply);
    }

    #[test]
    fn test_detach_keeps_identified_record() {
        let mut registry = PeerRegistry::new();
        let peer = identified(&mut registry, 1, "b", 0);
        registry.get_mut(&peer).unwrap().suspicion = 2;

        let detached = registry.detach(1).unwrap();
        assert!(detached.disconnected);
        assert!(!detached.temporary);

        let record = registry.get(&peer).unwrap();
        assert!(!record.is_connected());
        assert_eq!(record.suspicion, 2);
    }

    #[test]
    fn test_detach_drops_temporary_record() {
        let mut registry = PeerRegistry::new();
        let temp = registry.attach(1, addr(7000), 0);
        let detached = registry.detach(1).unwrap();
        assert!(detached.temporary);
        assert!(registry.get(&temp).is_none());
    }

    #[test]
    fn test_reconnect_reuses_record() {
        let mut registry = PeerRegistry::new();
        let peer = identified(&mut registry, 1, "b", 0);
        registry.get_mut(&peer).unwrap().reputation = 0.9;
        registry.detach(1);

        let outcome = {
            registry.attach(2, addr(7001), 50);
            registry
                .identify(2, &peer, &VectorClock::new(), 50)
                .unwrap()
        };
        assert!(outcome.newly_connected);
        let record = registry.get(&peer).unwrap();
        assert_eq!(record.reputation, 0.9);
        assert_eq!(record.connection, Some(2));
    }

    #[test]
    fn test_duplicate_connection_falls_back_on_detach() {
        let mut registry = PeerRegistry::new();
        let peer = identified(&mut registry, 1, "b", 0);
        registry.attach(2, addr(7001), 0);
        let second = registry.identify(2, &peer, &VectorClock::new(), 0).unwrap();
        assert!(!second.newly_connected);
        assert_eq!(registry.connection_of(&peer), Some(2));

        let detached = registry.detach(2).unwrap();
        assert!(!detached.disconnected);
        assert_eq!(registry.connection_of(&peer), Some(1));
    }

    #[test]
    fn test_recency_decays() {
        let record = PeerRecord::new(NodeId::new("b"), None, 0, false);
        assert_eq!(record.recency(0), 1.0);
        assert!((record.recency(10_000) - 0.5).abs() < 1e-9);
        assert!(record.recency(60_000) < record.recency(10_000));
    }

    #[test]
    fn test_routing_weight() {
        let mut record = PeerRecord::new(NodeId::new("b"), None, 0, false);
        record.reputation = 1.0;
        assert!((record.routing_weight(0) - 1.0).abs() < 1e-9);
        record.reputation = 0.0;
        assert!((record.routing_weight(0) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_gossip_targets_skip_flagged_excluded_and_temporary() {
        let mut registry = PeerRegistry::new();
        let b = identified(&mut registry, 1, "b", 0);
        let c = identified(&mut registry, 2, "c", 0);
        let d = identified(&mut registry, 3, "d", 0);
        registry.attach(4, addr(7004), 0);
        registry.get_mut(&d).unwrap().flagged = true;

        let mut rng = StdRng::seed_from_u64(11);
        let targets = registry.select_gossip_targets(&[c.clone()], 10, 0, &mut rng);

        assert_eq!(targets, vec![(b, 1)]);
    }

    #[test]
    fn test_gossip_targets_respect_fanout() {
        let mut registry = PeerRegistry::new();
        for i in 0..8u64 {
            identified(&mut registry, i + 1, &format!("p{}", i), 0);
        }
        let mut rng = StdRng::seed_from_u64(5);
        let targets = registry.select_gossip_targets(&[], 3, 0, &mut rng);
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_gossip_targets_prefer_reputable_peers() {
        let mut registry = PeerRegistry::new();
        let good = identified(&mut registry, 1, "good", 0);
        let poor = identified(&mut registry, 2, "poor", 0);
        registry.get_mut(&good).unwrap().reputation = 1.0;
        registry.get_mut(&poor).unwrap().reputation = 0.0;

        let mut rng = StdRng::seed_from_u64(99);
        let mut good_first = 0;
        for _ in 0..500 {
            let targets = registry.select_gossip_targets(&[], 1, 60_000, &mut rng);
            if targets[0].0 == good {
                good_first += 1;
            }
        }
        assert!(good_first > 350, "good peer chosen {} times", good_first);
    }
}
