//! Per-node heartbeat engine.
//!
//! One background task per watched node probes reachability on a fixed
//! cadence, updates the node record in the store, and publishes transitions
//! on a bounded event channel. The store is the source of truth; events are
//! informational and dropped when the channel is full.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use common::api::{NodeInfo, NodeStatus};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::remote::pool::{Pool, TransportError};
use crate::store::{self, Db};
use crate::telemetry;

/// How often each node is probed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Maximum time allowed for a single probe.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Command executed as the liveness probe.
pub const PROBE_COMMAND: &str = "echo __orbit_hb__";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Published when a node's status changes or a probe misses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// Node name.
    pub node: String,
    /// Status written to the store for this tick.
    pub status: NodeStatus,
}

/// Reachability probe abstraction; the pool is the production implementation.
#[async_trait]
pub trait NodeProber: Send + Sync {
    /// Probes the node once; `Ok(())` means reachable.
    async fn probe(&self, node: &NodeInfo) -> Result<(), TransportError>;
}

#[async_trait]
impl NodeProber for Pool {
    async fn probe(&self, node: &NodeInfo) -> Result<(), TransportError> {
        self.run(node, PROBE_COMMAND).await.map(|_| ())
    }
}

/// Probe cadence settings; the defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

/// Runs one watch task per node.
pub struct Engine {
    prober: Arc<dyn NodeProber>,
    db: Db,
    config: HeartbeatConfig,
    events: mpsc::Sender<NodeEvent>,
    cancels: StdMutex<HashMap<String, watch::Sender<bool>>>,
}

impl Engine {
    /// Creates an engine and the receive side of its event channel.
    pub fn new(
        prober: Arc<dyn NodeProber>,
        db: Db,
        config: HeartbeatConfig,
    ) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                prober,
                db,
                config,
                events,
                cancels: StdMutex::new(HashMap::new()),
            },
            receiver,
        )
    }

    /// Starts a watch task for the node. Idempotent: a second call for the
    /// same name is a no-op.
    pub fn watch(&self, node: NodeInfo) {
        let mut cancels = self.cancels.lock().unwrap_or_else(|err| err.into_inner());
        if cancels.contains_key(&node.spec.name) {
            return;
        }

        let (cancel, shutdown) = watch::channel(false);
        cancels.insert(node.spec.name.clone(), cancel);
        telemetry::record_nodes_watched(cancels.len());
        drop(cancels);

        let task = WatchTask {
            prober: Arc::clone(&self.prober),
            db: self.db.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        };
        info!(node = %node.spec.name, "heartbeat started");
        tokio::spawn(task.run(node, shutdown));
    }

    /// Stops the watch task for one node.
    pub fn unwatch(&self, name: &str) {
        let mut cancels = self.cancels.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(cancel) = cancels.remove(name) {
            let _ = cancel.send(true);
            info!(node = name, "heartbeat stopped");
        }
        telemetry::record_nodes_watched(cancels.len());
    }

    /// Stops all watch tasks.
    pub fn stop_all(&self) {
        let mut cancels = self.cancels.lock().unwrap_or_else(|err| err.into_inner());
        for (name, cancel) in cancels.drain() {
            let _ = cancel.send(true);
            info!(node = %name, "heartbeat stopped");
        }
        telemetry::record_nodes_watched(0);
    }
}

struct WatchTask {
    prober: Arc<dyn NodeProber>,
    db: Db,
    config: HeartbeatConfig,
    events: mpsc::Sender<NodeEvent>,
}

impl WatchTask {
    async fn run(self, node: NodeInfo, mut shutdown: watch::Receiver<bool>) {
        let name = node.spec.name.clone();
        let mut ticker = tokio::time::interval(self.config.interval);
        let mut fail_count: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let probe =
                        tokio::time::timeout(self.config.timeout, self.prober.probe(&node)).await;

                    if matches!(probe, Ok(Ok(()))) {
                        telemetry::record_heartbeat_probe("success");
                        let recovered = fail_count > 0;
                        fail_count = 0;
                        if let Err(err) =
                            store::nodes::update_node_status(&self.db, &name, NodeStatus::Online, 0)
                                .await
                        {
                            warn!(node = %name, %err, "heartbeat: state update failed");
                        }
                        if recovered {
                            info!(node = %name, "node recovered");
                            self.emit(NodeEvent {
                                node: name.clone(),
                                status: NodeStatus::Online,
                            });
                        }
                    } else {
                        telemetry::record_heartbeat_probe("miss");
                        fail_count += 1;
                        debug!(node = %name, fail_count, "heartbeat miss");

                        let status = NodeStatus::from_fail_count(fail_count);
                        if let Err(err) =
                            store::nodes::update_node_status(&self.db, &name, status, fail_count)
                                .await
                        {
                            warn!(node = %name, %err, "heartbeat: state update failed");
                        }
                        self.emit(NodeEvent {
                            node: name.clone(),
                            status,
                        });
                    }
                }
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(
                node = %err.into_inner().node,
                "heartbeat event channel full, dropping event"
            );
        }
    }
}
