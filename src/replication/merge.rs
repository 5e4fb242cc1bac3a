//! Merge Collaborator Port
//!
//! The sync core never interprets operation payloads. Applying a change to
//! the replicated graph is delegated to a conflict-free merge collaborator,
//! which must be commutative and idempotent.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Rejection reported by the merge collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("update rejected for {target}: {reason}")]
    Rejected { target: String, reason: String },
    #[error("merge backend unavailable: {0}")]
    Unavailable(String),
}

/// Applies remote updates to the local replica.
///
/// This is an outbound port; the CRDT and graph storage live behind it.
pub trait MergeCollaborator: Send + Sync {
    /// Merge one change into the replica.
    fn apply_remote_update(&self, target: &str, data: &serde_json::Value) -> Result<(), MergeError>;
}

/// Minimal last-write-wins replica keyed by target.
///
/// Stands in for a real graph store when running a standalone node.
#[derive(Debug, Default)]
pub struct InMemoryReplica {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &str) -> Option<serde_json::Value> {
        self.entries.read().get(target).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MergeCollaborator for InMemoryReplica {
    fn apply_remote_update(&self, target: &str, data: &serde_json::Value) -> Result<(), MergeError> {
        if target.is_empty() {
            return Err(MergeError::Rejected {
                target: String::new(),
                reason: "empty target".to_string(),
            });
        }
        self.entries.write().insert(target.to_string(), data.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_replica_stores_latest_value() {
        let replica = InMemoryReplica::new();
        assert!(replica.is_empty());

        replica
            .apply_remote_update("n1", &serde_json::json!({"v": 1}))
            .unwrap();
        replica
            .apply_remote_update("n1", &serde_json::json!({"v": 2}))
            .unwrap();

        assert_eq!(replica.len(), 1);
        assert_eq!(replica.get("n1"), Some(serde_json::json!({"v": 2})));
    }

    #[test]
    fn test_in_memory_replica_rejects_empty_target() {
        let replica = InMemoryReplica::new();
        let err = replica
            .apply_remote_update("", &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, MergeError::Rejected { .. }));
    }

    #[test]
    fn test_merge_error_display() {
        let err = MergeError::Rejected {
            target: "n9".to_string(),
            reason: "schema".to_string(),
        };
        assert_eq!(err.to_string(), "update rejected for n9: schema");
    }
}
