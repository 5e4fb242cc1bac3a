//! knowledge-sync - Peer-to-peer knowledge replication node
//!
//! Composition root: loads configuration, wires the coordinator to an
//! in-memory replica and runs until Ctrl+C or SIGTERM.

use knowledge_sync::infrastructure::shutdown_signal;
use knowledge_sync::{load_config, InMemoryReplica, SyncCoordinator, SyncEvent};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let replica = Arc::new(InMemoryReplica::new());
    let mut coordinator = SyncCoordinator::new(cfg.sync, replica.clone())?;
    let events = coordinator.take_event_rx();

    coordinator.initialize().await?;

    if let Some(mut events) = events {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SyncEvent::PeerSuspicious { peer, suspicion } => {
                        tracing::warn!("peer {} flagged (suspicion={})", peer, suspicion)
                    }
                    SyncEvent::SyncFailed { peer, reason } => {
                        tracing::warn!("sync with {} failed: {}", peer, reason)
                    }
                    SyncEvent::LeaderElected(leader) => tracing::info!("leader elected: {}", leader),
                    other => tracing::debug!("sync event: {:?}", other),
                }
            }
        });
    }

    shutdown_signal(coordinator.shutdown_controller()).await;
    coordinator.shutdown().await;
    tracing::info!("replica holds {} entities", replica.len());

    Ok(())
}
