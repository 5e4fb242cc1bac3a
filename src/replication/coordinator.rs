//! Sync Coordinator
//!
//! Runtime shell around [`SyncEngine`]. A single actor task owns the engine;
//! the public API, the transport and the periodic timers talk to it through
//! one command channel, so engine state is never shared between tasks.
//!
//! Tasks started by `initialize`:
//! - the actor
//! - a forwarder from transport events to actor commands
//! - one timer per protocol (gossip, sync, heartbeat, cleanup, fault detection)
//! - seed dialers, re-spawned on heartbeat ticks while a seed is unreachable

use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::config::{ConfigError, SyncConfig};
use crate::replication::engine::{Action, HealthReport, PublishError, SyncEngine, SyncEvent, SyncStats};
use crate::replication::merge::{MergeCollaborator, MergeError};
use crate::replication::transport::{TransportError, TransportEvent, TransportService};
use crate::replication::types::{now_millis, ConnectionId, NodeId, OperationId, OperationPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How long `shutdown` waits for link tasks to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the coordinator surface.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync coordinator not initialized")]
    NotInitialized,
    #[error("sync coordinator already initialized")]
    AlreadyInitialized,
    #[error("sync coordinator is shutting down")]
    ShuttingDown,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error("local merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("local clock entry exhausted")]
    ClockExhausted,
}

impl From<PublishError> for SyncError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::InvalidPayload(reason) => SyncError::InvalidPayload(reason),
            PublishError::Merge(e) => SyncError::Merge(e),
            PublishError::ClockExhausted => SyncError::ClockExhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Gossip,
    Sync,
    Heartbeat,
    Cleanup,
    Fault,
}

enum Command {
    Publish {
        payload: OperationPayload,
        reply: oneshot::Sender<Result<OperationId, PublishError>>,
    },
    Synchronize {
        peer: NodeId,
        delta: bool,
        reply: oneshot::Sender<bool>,
    },
    Stats(oneshot::Sender<SyncStats>),
    Health(oneshot::Sender<HealthReport>),
    Election,
    Transport(TransportEvent),
    Tick(Tick),
    Dialed {
        seed: String,
        connection: Option<ConnectionId>,
    },
}

struct Running {
    commands: mpsc::Sender<Command>,
    transport: Arc<TransportService>,
    local_addr: SocketAddr,
    actor: Option<JoinHandle<()>>,
}

/// Public facade of a sync node.
pub struct SyncCoordinator {
    config: SyncConfig,
    node_id: NodeId,
    merge: Arc<dyn MergeCollaborator>,
    shutdown: ShutdownController,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncCoordinator {
    /// Create a coordinator. Nothing runs until `initialize`.
    pub fn new(mut config: SyncConfig, merge: Arc<dyn MergeCollaborator>) -> Result<Self, SyncError> {
        config.validate()?;
        if config.node_id.is_empty() {
            config.node_id = NodeId::random().0;
        }
        let node_id = NodeId::new(config.node_id.clone());
        let (event_tx, event_rx) = mpsc::channel(1024);

        Ok(Self {
            config,
            node_id,
            merge,
            shutdown: ShutdownController::new(),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Get the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shutdown handle shared with the node's tasks.
    pub fn shutdown_controller(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Transport address once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Start the transport, the actor and the timers, then dial seeds and
    /// open a leader election.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.shutdown.is_shutdown() {
            return Err(SyncError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyInitialized);
        }

        tracing::info!(
            "starting sync node node_id={} listen={} seeds={}",
            self.node_id,
            self.config.listen_addr,
            self.config.seed_peers.len()
        );

        let mut transport = TransportService::new(
            self.config.listen_addr,
            self.config.peer_queue_capacity,
            self.shutdown.clone(),
        );
        let local_addr = match transport.start().await {
            Ok(addr) => addr,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let transport_rx = transport.take_event_rx();
        let transport = Arc::new(transport);

        let (commands, command_rx) = mpsc::channel(1024);
        if let Some(rx) = transport_rx {
            spawn_forwarder(rx, commands.clone(), self.shutdown.clone());
        }
        for (tick, period) in [
            (Tick::Gossip, self.config.gossip_interval),
            (Tick::Sync, self.config.sync_interval),
            (Tick::Heartbeat, self.config.heartbeat_interval),
            (Tick::Cleanup, self.config.cleanup_interval),
            (Tick::Fault, self.config.fault_detection_interval),
        ] {
            spawn_timer(tick, period, commands.clone(), self.shutdown.clone());
        }

        let engine = SyncEngine::new(self.config.clone(), self.merge.clone());
        let actor = Actor {
            engine,
            transport: transport.clone(),
            commands: commands.clone(),
            events: self.event_tx.clone(),
            waiters: HashMap::new(),
            seeds: self
                .config
                .seed_peers
                .iter()
                .map(|s| (s.clone(), SeedState::Idle))
                .collect(),
            retry_attempts: self.config.retry_attempts.max(1),
        };
        let actor = tokio::spawn(actor.run(command_rx, self.shutdown.subscribe()));

        *self.running.lock() = Some(Running {
            commands: commands.clone(),
            transport,
            local_addr,
            actor: Some(actor),
        });

        // Dial seeds right away instead of waiting for the first heartbeat.
        let _ = commands.send(Command::Tick(Tick::Heartbeat)).await;
        let _ = commands.send(Command::Election).await;

        tracing::info!("sync node {} listening on {}", self.node_id, local_addr);
        Ok(())
    }

    fn commands(&self) -> Result<mpsc::Sender<Command>, SyncError> {
        if self.shutdown.is_shutdown() {
            return Err(SyncError::ShuttingDown);
        }
        self.running
            .lock()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(SyncError::NotInitialized)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let commands = self.commands()?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Apply a change locally and replicate it.
    ///
    /// Returns once the change is applied here; peers are reached in the background.
    pub async fn publish(&self, payload: OperationPayload) -> Result<OperationId, SyncError> {
        let result = self
            .request(|reply| Command::Publish { payload, reply })
            .await?;
        Ok(result?)
    }

    /// Run one sync round with a peer; true when the response was applied.
    pub async fn synchronize_with_peer(&self, peer: &NodeId, delta_only: bool) -> Result<bool, SyncError> {
        let peer = peer.clone();
        self.request(|reply| Command::Synchronize {
            peer,
            delta: delta_only,
            reply,
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<SyncStats, SyncError> {
        self.request(Command::Stats).await
    }

    pub async fn health_check(&self) -> Result<HealthReport, SyncError> {
        self.request(Command::Health).await
    }

    /// Start a leader election.
    pub async fn trigger_election(&self) -> Result<(), SyncError> {
        self.commands()?
            .send(Command::Election)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Dial a peer directly.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionId, SyncError> {
        self.commands()?;
        let transport = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.transport.clone())
            .ok_or(SyncError::NotInitialized)?;
        Ok(transport.connect(addr).await?)
    }

    /// Stop every task and close all links.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        self.shutdown.shutdown();

        let Some(mut running) = running else {
            return;
        };
        running.transport.close();
        if let Some(actor) = running.actor.take() {
            let _ = actor.await;
        }
        self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
        tracing::info!("sync node {} stopped", self.node_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeedState {
    Idle,
    Dialing,
    Linked(ConnectionId),
}

/// Owns the engine and turns its actions into I/O.
struct Actor {
    engine: SyncEngine,
    transport: Arc<TransportService>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<SyncEvent>,
    waiters: HashMap<NodeId, Vec<oneshot::Sender<bool>>>,
    seeds: Vec<(String, SeedState)>,
    retry_attempts: u32,
}

impl Actor {
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut stop_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        // Pending sync callers learn the round did not complete.
        self.waiters.clear();
        tracing::debug!("sync actor stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = now_millis();
        match command {
            Command::Publish { payload, reply } => match self.engine.publish(payload, now) {
                Ok((id, actions)) => {
                    self.perform(actions);
                    let _ = reply.send(Ok(id));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Synchronize { peer, delta, reply } => match self.engine.start_sync(&peer, delta, now) {
                Some(actions) => {
                    self.waiters.entry(peer).or_default().push(reply);
                    self.perform(actions);
                }
                None if self.engine.is_sync_in_flight(&peer) => {
                    self.waiters.entry(peer).or_default().push(reply);
                }
                None => {
                    tracing::debug!("cannot sync with {}: not connected", peer);
                    let _ = reply.send(false);
                }
            },
            Command::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
            Command::Health(reply) => {
                let _ = reply.send(self.engine.health());
            }
            Command::Election => {
                let actions = self.engine.trigger_election(now);
                self.perform(actions);
            }
            Command::Transport(event) => self.on_transport(event, now),
            Command::Tick(tick) => self.on_tick(tick, now),
            Command::Dialed { seed, connection } => {
                let state = match connection {
                    Some(id) => SeedState::Linked(id),
                    None => SeedState::Idle,
                };
                if let Some(entry) = self.seeds.iter_mut().find(|(s, _)| *s == seed) {
                    entry.1 = state;
                }
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent, now: u64) {
        let actions = match event {
            TransportEvent::Connected {
                connection,
                addr,
                outbound,
            } => self.engine.handle_connected(connection, Some(addr), outbound, now),
            TransportEvent::Frame {
                connection,
                payload,
            } => self.engine.handle_frame(connection, &payload, now),
            TransportEvent::Disconnected(connection) => {
                for (_, state) in self.seeds.iter_mut() {
                    if *state == SeedState::Linked(connection) {
                        *state = SeedState::Idle;
                    }
                }
                self.engine.handle_disconnected(connection, now)
            }
        };
        self.perform(actions);
    }

    fn on_tick(&mut self, tick: Tick, now: u64) {
        let actions = match tick {
            Tick::Gossip => self.engine.on_gossip_tick(now),
            Tick::Sync => self.engine.on_sync_tick(now),
            Tick::Heartbeat => {
                self.redial_seeds();
                self.engine.on_heartbeat_tick(now)
            }
            Tick::Cleanup => self.engine.on_cleanup_tick(now),
            Tick::Fault => self.engine.on_fault_tick(now),
        };
        self.perform(actions);
    }

    fn redial_seeds(&mut self) {
        for (seed, state) in self.seeds.iter_mut() {
            if *state != SeedState::Idle {
                continue;
            }
            *state = SeedState::Dialing;
            tokio::spawn(dial_seed(
                seed.clone(),
                self.retry_attempts,
                self.transport.clone(),
                self.commands.clone(),
            ));
        }
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send {
                    connection,
                    message,
                } => {
                    let bytes = match message.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!("failed to encode {}: {}", message.type_name(), e);
                            continue;
                        }
                    };
                    match self.transport.send(connection, &bytes) {
                        Ok(()) => {}
                        Err(TransportError::QueueFull(_)) => self.engine.record_delivery_failure(connection),
                        Err(e) => tracing::debug!("send on connection {} failed: {}", connection, e),
                    }
                }
                Action::Emit(event) => {
                    self.resolve_waiters(&event);
                    if let Err(e) = self.events.try_send(event) {
                        tracing::debug!("sync event dropped: {}", e);
                    }
                }
            }
        }
    }

    fn resolve_waiters(&mut self, event: &SyncEvent) {
        let (peer, success) = match event {
            SyncEvent::SyncCompleted { peer, .. } => (peer, true),
            SyncEvent::SyncFailed { peer, .. } => (peer, false),
            _ => return,
        };
        if let Some(waiters) = self.waiters.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(success);
            }
        }
    }
}

/// Resolve and dial one seed, retrying a few times before giving up until
/// the next heartbeat.
#[cfg_attr(coverage_nightly, coverage(off))]
async fn dial_seed(
    seed: String,
    attempts: u32,
    transport: Arc<TransportService>,
    commands: mpsc::Sender<Command>,
) {
    let mut connection = None;
    for attempt in 1..=attempts {
        match try_dial(&seed, &transport).await {
            Ok(id) => {
                tracing::info!("connected to seed {}", seed);
                connection = Some(id);
                break;
            }
            Err(e) => {
                tracing::debug!("dial {} attempt {}/{} failed: {}", seed, attempt, attempts, e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
    }
    if connection.is_none() {
        tracing::warn!("seed {} unreachable; will retry on next heartbeat", seed);
    }
    let _ = commands.send(Command::Dialed { seed, connection }).await;
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn try_dial(seed: &str, transport: &TransportService) -> Result<ConnectionId, TransportError> {
    let addr = tokio::net::lookup_host(seed).await?.next().ok_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {}", seed),
        ))
    })?;
    transport.connect(addr).await
}

#[cfg_attr(coverage_nightly, coverage(off))]
fn spawn_forwarder(
    mut events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Sender<Command>,
    shutdown: ShutdownController,
) {
    let mut stop_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = stop_rx.recv() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if commands.send(Command::Transport(event)).await.is_err() {
                break;
            }
        }
    });
}

#[cfg_attr(coverage_nightly, coverage(off))]
fn spawn_timer(tick: Tick, period: Duration, commands: mpsc::Sender<Command>, shutdown: ShutdownController) {
    let mut stop_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        timer.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = timer.tick() => {
                    if commands.send(Command::Tick(tick)).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("{:?} timer stopped", tick);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::merge::InMemoryReplica;

    fn coordinator(config: SyncConfig) -> SyncCoordinator {
        SyncCoordinator::new(config, Arc::new(InMemoryReplica::new())).unwrap()
    }

    fn local_config(id: &str) -> SyncConfig {
        SyncConfig::new(id).listen_addr("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_new_generates_node_id() {
        let coordinator = coordinator(SyncConfig::default());
        assert!(coordinator.node_id().as_str().starts_with("node-"));
        assert_eq!(coordinator.config().node_id, coordinator.node_id().as_str());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = SyncCoordinator::new(
            SyncConfig::new("a").gossip_fanout(0),
            Arc::new(InMemoryReplica::new()),
        );
        assert!(matches!(result, Err(SyncError::Config(ConfigError::ZeroFanout))));
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut coordinator = coordinator(local_config("a"));
        assert!(coordinator.take_event_rx().is_some());
        assert!(coordinator.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail() {
        let coordinator = coordinator(local_config("a"));
        assert!(coordinator.local_addr().is_none());
        assert!(matches!(
            coordinator.get_stats().await,
            Err(SyncError::NotInitialized)
        ));
        let payload = OperationPayload::new("node_create", "n1", serde_json::Value::Null);
        assert!(matches!(
            coordinator.publish(payload).await,
            Err(SyncError::NotInitialized)
        ));
    }

    #[test]
    fn test_publish_error_mapping() {
        let err: SyncError = PublishError::InvalidPayload("empty target").into();
        assert!(matches!(err, SyncError::InvalidPayload("empty target")));
        let err: SyncError = PublishError::Merge(MergeError::Unavailable("down".into())).into();
        assert_eq!(err.to_string(), "local merge failed: merge backend unavailable: down");
    }

    #[tokio::test]
    async fn test_lifecycle_single_node() {
        let coordinator = coordinator(local_config("solo"));
        coordinator.initialize().await.unwrap();
        assert!(coordinator.local_addr().is_some());
        assert!(matches!(
            coordinator.initialize().await,
            Err(SyncError::AlreadyInitialized)
        ));

        let id = coordinator
            .publish(OperationPayload::new("node_create", "n1", serde_json::json!({})))
            .await
            .unwrap();
        assert!(id.as_str().starts_with("solo-"));

        let stats = coordinator.get_stats().await.unwrap();
        assert_eq!(stats.operations.published, 1);
        let health = coordinator.health_check().await.unwrap();
        assert_eq!(health.peers_connected, 0);

        let unknown = NodeId::new("nobody");
        assert!(!coordinator.synchronize_with_peer(&unknown, true).await.unwrap());

        coordinator.shutdown().await;
        assert!(matches!(
            coordinator.get_stats().await,
            Err(SyncError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_publish_invalid_payload_surfaces_error() {
        let coordinator = coordinator(local_config("solo"));
        coordinator.initialize().await.unwrap();
        let err = coordinator
            .publish(OperationPayload::new("node_create", "", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload("empty target")));
        coordinator.shutdown().await;
    }
}
