use crate::replication::SyncConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Process-level settings for the `knowledge-sync` binary.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub debug: bool,
    pub sync: SyncConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<NodeConfig> {
    let defaults = SyncConfig::default();

    let node_id = std::env::var("KGSYNC_NODE_ID").unwrap_or_default();

    let listen_addr: SocketAddr = match std::env::var("KGSYNC_LISTEN_ADDR") {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid KGSYNC_LISTEN_ADDR {}: {}", v, e))?,
        Err(_) => defaults.listen_addr,
    };

    let seed_peers = std::env::var("KGSYNC_SEED_PEERS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let debug = std::env::var("DEBUG").is_ok();

    let sync = SyncConfig {
        node_id,
        listen_addr,
        seed_peers,
        gossip_interval: env_millis("KGSYNC_GOSSIP_INTERVAL_MS", defaults.gossip_interval),
        gossip_fanout: env_parse("KGSYNC_GOSSIP_FANOUT", defaults.gossip_fanout),
        gossip_max_hops: env_parse("KGSYNC_GOSSIP_MAX_HOPS", defaults.gossip_max_hops),
        gossip_retention: env_millis("KGSYNC_GOSSIP_RETENTION_MS", defaults.gossip_retention),
        gossip_cache_capacity: env_parse("KGSYNC_GOSSIP_CACHE_CAPACITY", defaults.gossip_cache_capacity),
        sync_interval: env_millis("KGSYNC_SYNC_INTERVAL_MS", defaults.sync_interval),
        sync_batch_size: env_parse("KGSYNC_SYNC_BATCH_SIZE", defaults.sync_batch_size),
        sync_timeout: env_millis("KGSYNC_SYNC_TIMEOUT_MS", defaults.sync_timeout),
        delta_sync: env_flag("KGSYNC_DELTA_SYNC", defaults.delta_sync),
        retry_attempts: env_parse("KGSYNC_RETRY_ATTEMPTS", defaults.retry_attempts),
        suspicion_threshold: env_parse("KGSYNC_SUSPICION_THRESHOLD", defaults.suspicion_threshold),
        freshness_window: env_millis("KGSYNC_FRESHNESS_WINDOW_MS", defaults.freshness_window),
        min_healthy_peers: env_parse("KGSYNC_MIN_HEALTHY_PEERS", defaults.min_healthy_peers),
        replication_factor: env_parse("KGSYNC_REPLICATION_FACTOR", defaults.replication_factor),
        heartbeat_interval: env_millis("KGSYNC_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
        cleanup_interval: env_millis("KGSYNC_CLEANUP_INTERVAL_MS", defaults.cleanup_interval),
        fault_detection_interval: env_millis(
            "KGSYNC_FAULT_DETECTION_INTERVAL_MS",
            defaults.fault_detection_interval,
        ),
        election_window: env_millis("KGSYNC_ELECTION_WINDOW_MS", defaults.election_window),
        operation_max_age: env_millis("KGSYNC_OPERATION_MAX_AGE_MS", defaults.operation_max_age),
        history_capacity: env_parse("KGSYNC_HISTORY_CAPACITY", defaults.history_capacity),
        peer_queue_capacity: env_parse("KGSYNC_PEER_QUEUE_CAPACITY", defaults.peer_queue_capacity),
    };

    sync.validate()?;

    Ok(NodeConfig { debug, sync })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // Tests below mutate process env; each one only touches its own keys.

    #[test]
    fn test_default_node_config() {
        let cfg = NodeConfig::default();
        assert!(!cfg.debug);
        assert!(cfg.sync.node_id.is_empty());
        assert_eq!(cfg.sync.gossip_fanout, 3);
    }

    #[test]
    fn test_load_config_defaults() {
        std::env::remove_var("KGSYNC_GOSSIP_MAX_HOPS");
        std::env::remove_var("KGSYNC_SYNC_BATCH_SIZE");

        let cfg = load_config().unwrap();
        assert_eq!(cfg.sync.gossip_max_hops, 5);
        assert_eq!(cfg.sync.sync_batch_size, 500);
    }

    #[test]
    fn test_load_config_with_seed_peers() {
        std::env::set_var("KGSYNC_SEED_PEERS", "peer1:4100, peer2:4100,,");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.sync.seed_peers, vec!["peer1:4100", "peer2:4100"]);
        std::env::remove_var("KGSYNC_SEED_PEERS");
    }

    #[test]
    fn test_load_config_with_intervals() {
        std::env::set_var("KGSYNC_GOSSIP_INTERVAL_MS", "250");
        std::env::set_var("KGSYNC_SYNC_TIMEOUT_MS", "1500");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.sync.gossip_interval, Duration::from_millis(250));
        assert_eq!(cfg.sync.sync_timeout, Duration::from_millis(1500));
        std::env::remove_var("KGSYNC_GOSSIP_INTERVAL_MS");
        std::env::remove_var("KGSYNC_SYNC_TIMEOUT_MS");
    }

    #[test]
    fn test_load_config_with_delta_sync_disabled() {
        std::env::set_var("KGSYNC_DELTA_SYNC", "false");
        let cfg = load_config().unwrap();
        assert!(!cfg.sync.delta_sync);
        std::env::remove_var("KGSYNC_DELTA_SYNC");
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        std::env::set_var("KGSYNC_SUSPICION_THRESHOLD", "lots");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.sync.suspicion_threshold, 5);
        std::env::remove_var("KGSYNC_SUSPICION_THRESHOLD");
    }

    #[test]
    fn test_load_config_with_node_id_and_addr() {
        std::env::set_var("KGSYNC_NODE_ID", "node-eu-1");
        std::env::set_var("KGSYNC_LISTEN_ADDR", "127.0.0.1:4200");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.sync.node_id, "node-eu-1");
        assert_eq!(cfg.sync.listen_addr, "127.0.0.1:4200".parse().unwrap());
        std::env::remove_var("KGSYNC_NODE_ID");
        std::env::remove_var("KGSYNC_LISTEN_ADDR");
    }

    #[test]
    fn test_env_parse_helpers() {
        std::env::set_var("KGSYNC_TEST_PARSE", " 42 ");
        assert_eq!(env_parse("KGSYNC_TEST_PARSE", 1u32), 42);
        assert_eq!(env_parse("KGSYNC_TEST_MISSING", 7usize), 7);
        std::env::set_var("KGSYNC_TEST_FLAG", "TRUE");
        assert!(env_flag("KGSYNC_TEST_FLAG", false));
        std::env::remove_var("KGSYNC_TEST_PARSE");
        std::env::remove_var("KGSYNC_TEST_FLAG");
    }
}
