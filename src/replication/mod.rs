//! Knowledge Replication Module
//!
//! Peer-to-peer replication of knowledge-graph changes. Every node applies
//! changes locally through a [`MergeCollaborator`] and spreads them to the
//! rest of the cluster without a central coordinator.
//!
//! ## Architecture
//!
//! - **Engine**: Sans-IO protocol state machine; inputs in, actions out
//! - **Gossip**: Epidemic dissemination with hop limits and duplicate suppression
//! - **Delta sync**: Anti-entropy pulls driven by vector clocks
//! - **Reputation**: Message validation, suspicion counters and peer scoring
//! - **Election**: Highest-id leader election over the same links
//! - **Transport (QUIC)**: Length-prefixed JSON frames over one stream per peer
//! - **Coordinator**: Async actor owning the engine, plus timers and seeds
//!
//! ## How It Works
//!
//! 1. Nodes dial their seeds and exchange identification messages
//! 2. A published change is merged locally, sent directly to connected peers
//!    and queued for gossip
//! 3. Peers relay gossip up to the hop limit and ack what they apply
//! 4. Periodic sync rounds pull whatever gossip missed
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knowledge_sync::replication::{InMemoryReplica, SyncConfig, SyncCoordinator};
//!
//! let config = SyncConfig::new("node-a")
//!     .listen_addr("0.0.0.0:4100".parse()?)
//!     .seed_peers(vec!["node-b.internal:4100".to_string()]);
//!
//! let node = SyncCoordinator::new(config, Arc::new(InMemoryReplica::new()))?;
//! node.initialize().await?;
//! node.publish(OperationPayload::new("node_create", "concept-1", data)).await?;
//! ```

mod clock;
mod config;
mod coordinator;
mod delta;
mod election;
mod engine;
mod gossip;
mod merge;
mod message;
mod oplog;
mod peers;
mod reputation;
mod transport;
mod types;

pub use clock::{ClockOrdering, VectorClock};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{SyncCoordinator, SyncError};
pub use delta::{DeltaSynchronizer, SyncMetricsSnapshot, SyncOutcome};
pub use election::LeaderElection;
pub use engine::{
    Action, HealthReport, HealthStatus, MetricsStats, OperationStats, PeerStats, PeerSummary,
    PublishError, SyncEngine, SyncEvent, SyncStats,
};
pub use gossip::{GossipDisseminator, GossipStats};
pub use merge::{InMemoryReplica, MergeCollaborator, MergeError};
pub use message::{ElectionAction, MessageBody, WireMessage};
pub use oplog::{DeliveryFrontier, OperationLog};
pub use peers::{PeerRecord, PeerRegistry, INITIAL_REPUTATION};
pub use reputation::{FaultDetector, ProtocolViolation};
pub use transport::{TransportError, TransportEvent, TransportService, MAX_FRAME_LEN};
pub use types::{
    now_millis, ConnectionId, GossipEnvelope, NodeId, Operation, OperationId, OperationPayload,
    Priority,
};
