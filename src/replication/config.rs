//! Sync Configuration
//!
//! Configuration for the knowledge synchronization engine. Every knob has a
//! default and can be overridden through the builder methods.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Unique identifier for this node; generated at startup when empty
    pub node_id: String,

    /// Address to bind for the peer transport (default: 0.0.0.0:4100)
    pub listen_addr: SocketAddr,

    /// Seed peers dialed on startup (e.g., ["10.0.0.2:4100"])
    pub seed_peers: Vec<String>,

    /// Batching window between gossip rounds (default: 1s)
    pub gossip_interval: Duration,

    /// Peers selected per gossip relay (default: 3)
    pub gossip_fanout: usize,

    /// Hop bound and initial ttl of gossip envelopes (default: 5)
    pub gossip_max_hops: u32,

    /// How long a gossip id stays in the seen set (default: 60s)
    pub gossip_retention: Duration,

    /// Maximum number of remembered gossip ids (default: 10000)
    pub gossip_cache_capacity: usize,

    /// Interval between delta-sync rounds (default: 5s)
    pub sync_interval: Duration,

    /// Maximum operations per sync response (default: 500)
    pub sync_batch_size: usize,

    /// Time to wait for a sync response (default: 10s)
    pub sync_timeout: Duration,

    /// Request only missing operations instead of full history (default: true)
    pub delta_sync: bool,

    /// Connection attempts per seed before waiting for the next heartbeat (default: 3)
    pub retry_attempts: u32,

    /// Suspicion count above which a peer is flagged (default: 5)
    pub suspicion_threshold: u32,

    /// Maximum clock skew accepted on inbound messages (default: 5min)
    pub freshness_window: Duration,

    /// Connected peers required to report healthy (default: 1)
    pub min_healthy_peers: usize,

    /// Acknowledgements after which an operation counts as replicated (default: 3)
    pub replication_factor: usize,

    /// Liveness heartbeat interval (default: 5s)
    pub heartbeat_interval: Duration,

    /// Garbage collection interval (default: 30s)
    pub cleanup_interval: Duration,

    /// Timeout and election check interval (default: 1s)
    pub fault_detection_interval: Duration,

    /// How long an election collects announcements (default: 5s)
    pub election_window: Duration,

    /// Age after which unacknowledged operations leave the pending set (default: 10min)
    pub operation_max_age: Duration,

    /// Operations retained for serving sync requests (default: 10000)
    pub history_capacity: usize,

    /// Outbound frames buffered per peer before sends are rejected (default: 256)
    pub peer_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4100)),
            seed_peers: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: 3,
            gossip_max_hops: 5,
            gossip_retention: Duration::from_secs(60),
            gossip_cache_capacity: 10_000,
            sync_interval: Duration::from_secs(5),
            sync_batch_size: 500,
            sync_timeout: Duration::from_secs(10),
            delta_sync: true,
            retry_attempts: 3,
            suspicion_threshold: 5,
            freshness_window: Duration::from_secs(300),
            min_healthy_peers: 1,
            replication_factor: 3,
            heartbeat_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            fault_detection_interval: Duration::from_secs(1),
            election_window: Duration::from_secs(5),
            operation_max_age: Duration::from_secs(600),
            history_capacity: 10_000,
            peer_queue_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the transport listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the seed peers.
    pub fn seed_peers(mut self, peers: Vec<String>) -> Self {
        self.seed_peers = peers;
        self
    }

    /// Set the gossip batching window.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the gossip fan-out.
    pub fn gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    /// Set the gossip hop bound.
    pub fn gossip_max_hops(mut self, hops: u32) -> Self {
        self.gossip_max_hops = hops;
        self
    }

    /// Set the delta-sync interval.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the sync response timeout.
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Enable or disable delta mode.
    pub fn delta_sync(mut self, enabled: bool) -> Self {
        self.delta_sync = enabled;
        self
    }

    /// Set the suspicion threshold.
    pub fn suspicion_threshold(mut self, threshold: u32) -> Self {
        self.suspicion_threshold = threshold;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the election window.
    pub fn election_window(mut self, window: Duration) -> Self {
        self.election_window = window;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gossip_fanout == 0 {
            return Err(ConfigError::ZeroFanout);
        }
        if self.gossip_max_hops == 0 {
            return Err(ConfigError::ZeroMaxHops);
        }
        if self.sync_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.peer_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        for (name, value) in [
            ("gossip_interval", self.gossip_interval),
            ("sync_interval", self.sync_interval),
            ("sync_timeout", self.sync_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("fault_detection_interval", self.fault_detection_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("gossip_fanout must be at least 1")]
    ZeroFanout,
    #[error("gossip_max_hops must be at least 1")]
    ZeroMaxHops,
    #[error("sync_batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("peer_queue_capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.node_id.is_empty());
        assert_eq!(config.listen_addr.port(), 4100);
        assert_eq!(config.gossip_fanout, 3);
        assert_eq!(config.gossip_max_hops, 5);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.sync_timeout, Duration::from_secs(10));
        assert_eq!(config.suspicion_threshold, 5);
        assert_eq!(config.freshness_window, Duration::from_secs(300));
        assert_eq!(config.election_window, Duration::from_secs(5));
        assert!(config.delta_sync);
    }

    #[test]
    fn test_builder_pattern() {
        let config = SyncConfig::new("node-a")
            .listen_addr("127.0.0.1:5100".parse().unwrap())
            .seed_peers(vec!["127.0.0.1:5101".to_string()])
            .gossip_fanout(2)
            .gossip_max_hops(3)
            .delta_sync(false);

        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.listen_addr.port(), 5100);
        assert_eq!(config.seed_peers.len(), 1);
        assert_eq!(config.gossip_fanout, 2);
        assert_eq!(config.gossip_max_hops, 3);
        assert!(!config.delta_sync);
    }

    #[test]
    fn test_validate_ok_without_node_id() {
        tokio_test::assert_ok!(SyncConfig::default().validate());
    }

    #[test]
    fn test_validate_zero_fanout() {
        let config = SyncConfig::new("n").gossip_fanout(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroFanout)));
    }

    #[test]
    fn test_validate_zero_hops() {
        let config = SyncConfig::new("n").gossip_max_hops(0);
        let err = tokio_test::assert_err!(config.validate());
        assert!(matches!(err, ConfigError::ZeroMaxHops));
    }

    #[test]
    fn test_validate_zero_interval_names_the_field() {
        let config = SyncConfig::new("n").sync_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval("sync_timeout")));
        assert_eq!(err.to_string(), "sync_timeout must be non-zero");
    }
}
