//! Leader Election
//!
//! Bully-style election: every node that takes part announces itself during
//! a fixed window and the highest node id wins. The result is informational;
//! nothing in the sync path depends on it.

use crate::replication::types::NodeId;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Electing {
        deadline: u64,
        candidates: BTreeSet<NodeId>,
    },
}

/// Election state machine.
#[derive(Debug)]
pub struct LeaderElection {
    local: NodeId,
    window_ms: u64,
    phase: Phase,
    leader: Option<NodeId>,
}

impl LeaderElection {
    pub fn new(local: NodeId, window_ms: u64) -> Self {
        Self {
            local,
            window_ms,
            phase: Phase::Idle,
            leader: None,
        }
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_electing(&self) -> bool {
        matches!(self.phase, Phase::Electing { .. })
    }

    /// Enter an election with ourselves as candidate.
    ///
    /// Returns false when one is already running (nothing to announce).
    pub fn start(&mut self, now: u64) -> bool {
        if self.is_electing() {
            return false;
        }
        let mut candidates = BTreeSet::new();
        candidates.insert(self.local.clone());
        self.phase = Phase::Electing {
            deadline: now + self.window_ms,
            candidates,
        };
        true
    }

    /// Handle a peer's announcement. Returns true if we just joined the election.
    pub fn on_announce(&mut self, candidate: &NodeId, now: u64) -> bool {
        let joined = self.start(now);
        if let Phase::Electing { candidates, .. } = &mut self.phase {
            candidates.insert(candidate.clone());
        }
        joined
    }

    /// Handle a victory broadcast. Returns the adopted leader if it changed.
    pub fn on_victory(&mut self, winner: &NodeId) -> Option<NodeId> {
        match &mut self.phase {
            Phase::Electing { candidates, .. } => {
                candidates.insert(winner.clone());
                None
            }
            Phase::Idle => {
                if self.leader.as_ref() == Some(winner) {
                    return None;
                }
                self.leader = Some(winner.clone());
                Some(winner.clone())
            }
        }
    }

    /// Resolve the election once its window has passed.
    pub fn poll(&mut self, now: u64) -> Option<NodeId> {
        let winner = match &self.phase {
            Phase::Electing {
                deadline,
                candidates,
            } if now >= *deadline => candidates.iter().next_back().cloned(),
            _ => return None,
        };
        self.phase = Phase::Idle;
        self.leader = winner.clone();
        winner
    }

    pub fn is_leader(&self) -> bool {
        self.leader.as_ref() == Some(&self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn test_lone_node_elects_itself() {
        let mut election = LeaderElection::new(id("node-b"), 5_000);
        assert!(election.start(0));
        assert!(election.is_electing());
        assert_eq!(election.poll(4_999), None);
        assert_eq!(election.poll(5_000), Some(id("node-b")));
        assert!(election.is_leader());
        assert!(!election.is_electing());
    }

    #[test]
    fn test_highest_id_wins() {
        let mut election = LeaderElection::new(id("node-b"), 5_000);
        election.start(0);
        election.on_announce(&id("node-c"), 10);
        election.on_announce(&id("node-a"), 20);
        assert_eq!(election.poll(5_000), Some(id("node-c")));
        assert!(!election.is_leader());
    }

    #[test]
    fn test_announce_while_idle_joins() {
        let mut election = LeaderElection::new(id("node-b"), 5_000);
        assert!(election.on_announce(&id("node-a"), 100));
        assert!(!election.on_announce(&id("node-c"), 200));
        assert_eq!(election.poll(5_100), Some(id("node-c")));
    }

    #[test]
    fn test_start_twice_is_noop() {
        let mut election = LeaderElection::new(id("node-b"), 5_000);
        assert!(election.start(0));
        assert!(!election.start(1_000));
        assert_eq!(election.poll(5_000), Some(id("node-b")));
    }

    #[test]
    fn test_victory_adopted_when_idle() {
        let mut election = LeaderElection::new(id("node-a"), 5_000);
        assert_eq!(election.on_victory(&id("node-z")), Some(id("node-z")));
        assert_eq!(election.on_victory(&id("node-z")), None);
        assert_eq!(election.leader(), Some(&id("node-z")));
    }

    #[test]
    fn test_victory_during_election_is_a_candidate() {
        let mut election = LeaderElection::new(id("node-a"), 5_000);
        election.start(0);
        assert_eq!(election.on_victory(&id("node-z")), None);
        assert_eq!(election.poll(5_000), Some(id("node-z")));
    }
}
