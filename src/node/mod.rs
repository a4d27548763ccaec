//! Node Runtime
//!
//! Wires one node together: registration, the heartbeat task, the outgoing
//! delivery task and the dispatch loop that owns [`NodeCore`]. Everything
//! else talks to the loop through [`NodeHandle`].

mod machine;
mod service;

pub use machine::NodeCore;
pub use service::{ClientRequest, ClientResponse, Delivery, NodeStatus, ResponseStatus, ServiceCall};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::clock::SyncConfig;
use crate::config::ChatMeshConfig;
use crate::network::{spawn_delivery, Transport};
use crate::registry::{NodeIdentity, Registry};
use crate::replication::Envelope;
use crate::state::{ElectionConfig, PersistedState, SnapshotFile};
use crate::error::{Error, Result};

const COMMAND_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 1024;
const DELIVERY_CAPACITY: usize = 1024;
const UNDELIVERED_CAPACITY: usize = 64;
const REGISTER_ATTEMPTS: u32 = 10;

/// Everything a node needs to run
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Unique node identifier
    pub node_id: String,
    /// Address peers deliver coordination traffic to
    pub address: String,
    pub election: ElectionConfig,
    pub sync: SyncConfig,
    /// Registry heartbeat period
    pub heartbeat_interval: Duration,
    /// Per-peer wait for a bootstrap snapshot
    pub bootstrap_timeout: Duration,
    /// Directory for the persisted snapshot, `None` to keep state in memory
    pub snapshot_dir: Option<PathBuf>,
    /// Starting physical clock skew
    pub initial_offset_ms: i64,
}

impl NodeSettings {
    /// Defaults for a node at `address`
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            election: ElectionConfig::default(),
            sync: SyncConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(3),
            snapshot_dir: None,
            initial_offset_ms: 0,
        }
    }

    /// Build settings from the configuration file
    pub fn from_config(config: &ChatMeshConfig) -> Self {
        Self {
            node_id: config.node.id.clone(),
            address: config.advertise_address().to_string(),
            election: ElectionConfig {
                ok_timeout: Duration::from_millis(config.election.ok_timeout_ms),
                coordinator_timeout: Duration::from_millis(config.election.coordinator_timeout_ms),
                ping_interval: Duration::from_millis(config.election.ping_interval_ms),
            },
            sync: SyncConfig {
                every_operations: config.sync.every_operations,
                window: Duration::from_millis(config.sync.window_ms),
            },
            heartbeat_interval: config.heartbeat_interval(),
            bootstrap_timeout: config.bootstrap_timeout(),
            snapshot_dir: config.node.persist.then(|| config.data_dir().clone()),
            initial_offset_ms: 0,
        }
    }
}

/// Registry updates forwarded by the heartbeat task
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// Fresh active member listing
    View { peers: Vec<NodeIdentity>, clock: u64 },
    /// The registry had forgotten this node, which registered again
    Reregistered { rank: u64, clock: u64 },
}

/// Commands accepted by the dispatch loop
#[derive(Debug)]
pub enum NodeCommand {
    Client {
        request: ClientRequest,
        reply: oneshot::Sender<ClientResponse>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    State {
        reply: oneshot::Sender<PersistedState>,
    },
    Shutdown,
}

/// Handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    identity: NodeIdentity,
    commands: mpsc::Sender<NodeCommand>,
    deliveries: broadcast::Sender<Delivery>,
}

impl NodeHandle {
    /// Identity the node registered with
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Submit a client request
    pub async fn request(&self, request: ClientRequest) -> Result<ClientResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Client { request, reply }).await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Current status report
    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Status { reply }).await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Current dataset in reporting shape
    pub async fn state(&self) -> Result<PersistedState> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::State { reply }).await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Subscribe to fan-out deliveries originated by this node
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.deliveries.subscribe()
    }

    /// Stop the dispatch loop
    pub async fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
    }

    async fn send(&self, command: NodeCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::ShuttingDown)
    }
}

/// Node entry point
pub struct Node;

impl Node {
    /// Register, restore, and start all node tasks
    ///
    /// `inbound` carries envelopes addressed to this node (from a
    /// [`NetworkServer`](crate::network::NetworkServer) or a
    /// [`MemoryNetwork`](crate::network::MemoryNetwork)).
    pub async fn spawn(
        settings: NodeSettings,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<(String, Envelope)>,
    ) -> Result<(NodeHandle, JoinHandle<()>)> {
        let registered = register_with_retry(registry.as_ref(), &settings).await?;
        tracing::info!(
            "Node '{}' registered at {} with rank {}",
            settings.node_id,
            settings.address,
            registered.body
        );

        let mut core = NodeCore::new(&settings, registered.body);
        core.observe_clock(registered.clock);

        let peers = match registry.list_active(core.logical_clock()).await {
            Ok(listing) => {
                core.observe_clock(listing.clock);
                listing.body.iter().map(|entry| entry.identity()).collect()
            }
            Err(e) => {
                tracing::warn!("Could not list members, starting alone: {}", e);
                Vec::new()
            }
        };

        let restored = match &settings.snapshot_dir {
            Some(dir) => SnapshotFile::new(dir, &settings.node_id).load().unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable snapshot: {}", e);
                None
            }),
            None => None,
        };

        core.start(Instant::now(), peers, restored);

        let identity = core.identity().clone();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (undelivered_tx, undelivered_rx) = mpsc::channel(UNDELIVERED_CAPACITY);
        let (deliveries_tx, _) = broadcast::channel(DELIVERY_CAPACITY);
        let (clock_tx, clock_rx) = watch::channel(core.logical_clock());

        spawn_delivery(transport, outgoing_rx, undelivered_tx);

        tokio::spawn(heartbeat_loop(
            registry,
            settings.node_id.clone(),
            settings.address.clone(),
            settings.heartbeat_interval,
            clock_rx,
            events_tx,
        ));

        let dispatch = DispatchLoop {
            core,
            commands: commands_rx,
            inbound,
            events: events_rx,
            undelivered: undelivered_rx,
            outgoing: outgoing_tx,
            deliveries: deliveries_tx.clone(),
            clock: clock_tx,
        };
        let task = tokio::spawn(dispatch.run());

        let handle = NodeHandle {
            identity,
            commands: commands_tx,
            deliveries: deliveries_tx,
        };
        Ok((handle, task))
    }
}

async fn register_with_retry(
    registry: &dyn Registry,
    settings: &NodeSettings,
) -> Result<crate::registry::Stamped<u64>> {
    let mut attempt = 1;
    loop {
        match registry.register(&settings.node_id, &settings.address, 0).await {
            Ok(registered) => return Ok(registered),
            Err(e) if e.is_retryable() && attempt < REGISTER_ATTEMPTS => {
                tracing::warn!("Registration attempt {} failed: {}", attempt, e);
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Keep the registry entry alive and forward membership listings
async fn heartbeat_loop(
    registry: Arc<dyn Registry>,
    node_id: String,
    address: String,
    period: Duration,
    clock: watch::Receiver<u64>,
    events: mpsc::Sender<MembershipEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if events.is_closed() {
            break;
        }

        let current = *clock.borrow();
        let registry_clock = match registry.heartbeat(&node_id, current).await {
            Ok(ack) if ack.body => ack.clock,
            Ok(ack) => {
                tracing::warn!("Registry no longer knows '{}', registering again", node_id);
                match registry.register(&node_id, &address, ack.clock).await {
                    Ok(registered) => {
                        let event = MembershipEvent::Reregistered {
                            rank: registered.body,
                            clock: registered.clock,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                        registered.clock
                    }
                    Err(e) => {
                        tracing::warn!("Re-registration failed: {}", e);
                        continue;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Heartbeat to registry failed: {}", e);
                continue;
            }
        };

        match registry.list_active(registry_clock).await {
            Ok(listing) => {
                let peers = listing.body.iter().map(|entry| entry.identity()).collect();
                let event = MembershipEvent::View {
                    peers,
                    clock: listing.clock,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Member listing failed: {}", e),
        }
    }

    tracing::debug!("Heartbeat loop for '{}' stopped", node_id);
}

struct DispatchLoop {
    core: NodeCore,
    commands: mpsc::Receiver<NodeCommand>,
    inbound: mpsc::Receiver<(String, Envelope)>,
    events: mpsc::Receiver<MembershipEvent>,
    undelivered: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<(String, Envelope)>,
    deliveries: broadcast::Sender<Delivery>,
    clock: watch::Sender<u64>,
}

impl DispatchLoop {
    async fn run(mut self) {
        tracing::info!("Node {} running", self.core.identity());
        self.flush().await;

        loop {
            let deadline = self.core.next_deadline();
            let mut pending_reply = None;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Client { request, reply }) => {
                        let response = self.core.handle_client(Instant::now(), request);
                        pending_reply = Some((reply, response));
                    }
                    Some(NodeCommand::Status { reply }) => {
                        let _ = reply.send(self.core.status());
                    }
                    Some(NodeCommand::State { reply }) => {
                        let _ = reply.send(self.core.state());
                    }
                    Some(NodeCommand::Shutdown) | None => break,
                },
                Some((_, envelope)) = self.inbound.recv() => {
                    self.core.handle_envelope(Instant::now(), envelope);
                }
                Some(event) = self.events.recv() => {
                    self.core.handle_membership(Instant::now(), event);
                }
                Some(address) = self.undelivered.recv() => {
                    self.core.handle_undelivered(&address);
                }
                _ = wait_for(deadline) => {
                    self.core.poll(Instant::now());
                }
            }

            self.flush().await;
            if let Some((reply, response)) = pending_reply {
                let _ = reply.send(response);
            }
        }

        self.flush().await;
        tracing::info!("Node {} stopped", self.core.identity());
    }

    async fn flush(&mut self) {
        for item in self.core.take_outgoing() {
            if self.outgoing.send(item).await.is_err() {
                tracing::warn!("Delivery task is gone, dropping outgoing traffic");
                break;
            }
        }

        for delivery in self.core.take_deliveries() {
            tracing::debug!("Delivery on topic '{}'", delivery.topic());
            let _ = self.deliveries.send(delivery);
        }

        self.clock.send_replace(self.core.logical_clock());
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
