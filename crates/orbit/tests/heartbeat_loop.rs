//! Heartbeat engine behaviour against a scripted prober.

mod support;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orbit::api::{NodeInfo, NodeStatus};
use orbit::remote::{Engine, HeartbeatConfig, NodeEvent, NodeProber, TransportError};
use orbit::store;
use support::{node_info, open_store};

/// Prober that replays a scripted sequence of outcomes, then stays healthy.
struct ScriptedProber {
    script: Mutex<VecDeque<bool>>,
    probes: AtomicUsize,
}

impl ScriptedProber {
    fn new(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            probes: AtomicUsize::new(0),
        })
    }

    fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeProber for ScriptedProber {
    async fn probe(&self, _node: &NodeInfo) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(false) => Err(TransportError::Session(anyhow::anyhow!("probe failed"))),
            _ => Ok(()),
        }
    }
}

fn fast_config() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(40),
        timeout: Duration::from_millis(500),
    }
}

async fn recv_event(rx: &mut tokio::sync::mpsc::Receiver<NodeEvent>) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open")
}

#[tokio::test]
async fn status_transitions_follow_probe_outcomes() {
    let (_dir, db) = open_store().await;
    let node = node_info("edge-1");
    store::nodes::put_node(&db, &node).await.expect("register");

    // ok, ok, err, err, err, ok → online, online, degraded(1), degraded(2),
    // offline(3), online(0).
    let prober = ScriptedProber::new(&[true, true, false, false, false, true]);
    let (engine, mut rx) = Engine::new(prober.clone(), db.clone(), fast_config());
    engine.watch(node.clone());

    // Events fire on every miss and on the recovery only.
    assert_eq!(
        recv_event(&mut rx).await,
        NodeEvent {
            node: "edge-1".into(),
            status: NodeStatus::Degraded
        }
    );
    assert_eq!(recv_event(&mut rx).await.status, NodeStatus::Degraded);
    assert_eq!(recv_event(&mut rx).await.status, NodeStatus::Offline);
    assert_eq!(recv_event(&mut rx).await.status, NodeStatus::Online);

    // The store converged to online with a reset counter; the recovery
    // event was emitted after the write.
    let info = store::nodes::get_node(&db, "edge-1")
        .await
        .expect("get")
        .expect("registered");
    assert_eq!(info.status, NodeStatus::Online);
    assert_eq!(info.fail_count, 0);
    assert_eq!(
        info.status,
        NodeStatus::from_fail_count(info.fail_count),
        "status stays derivable from the fail counter"
    );
    assert!(prober.probes() >= 6);

    engine.stop_all();
}

#[tokio::test]
async fn deep_offline_recovery_emits_a_single_online_event() {
    let (_dir, db) = open_store().await;
    let node = node_info("edge-1");
    store::nodes::put_node(&db, &node).await.expect("register");

    let prober = ScriptedProber::new(&[false, false, false, false, false, true, true]);
    let (engine, mut rx) = Engine::new(prober.clone(), db.clone(), fast_config());
    engine.watch(node.clone());

    let mut statuses = Vec::new();
    for _ in 0..6 {
        statuses.push(recv_event(&mut rx).await.status);
    }
    assert_eq!(
        statuses,
        vec![
            NodeStatus::Degraded,
            NodeStatus::Degraded,
            NodeStatus::Offline,
            NodeStatus::Offline,
            NodeStatus::Offline,
            NodeStatus::Online,
        ]
    );

    // Steady-state success after the recovery emits nothing further.
    let extra = tokio::time::timeout(Duration::from_millis(250), rx.recv()).await;
    assert!(extra.is_err(), "no events while the node stays online");

    let info = store::nodes::get_node(&db, "edge-1")
        .await
        .expect("get")
        .expect("registered");
    assert_eq!(info.status, NodeStatus::Online);
    assert_eq!(info.fail_count, 0);

    engine.stop_all();
}

#[tokio::test]
async fn watch_is_idempotent() {
    let (_dir, db) = open_store().await;
    let node = node_info("edge-1");
    store::nodes::put_node(&db, &node).await.expect("register");

    let prober = ScriptedProber::new(&[]);
    let (engine, _rx) = Engine::new(prober.clone(), db.clone(), fast_config());
    engine.watch(node.clone());
    engine.watch(node.clone());

    tokio::time::sleep(Duration::from_millis(190)).await;
    let probes = prober.probes();
    assert!(
        probes <= 6,
        "a second watch must not double the probe rate, saw {probes}"
    );
    assert!(probes >= 2, "the single task must be probing, saw {probes}");

    engine.stop_all();
}

#[tokio::test]
async fn unwatch_stops_the_task_and_rewatch_starts_fresh() {
    let (_dir, db) = open_store().await;
    let node = node_info("edge-1");
    store::nodes::put_node(&db, &node).await.expect("register");

    let prober = ScriptedProber::new(&[]);
    let (engine, _rx) = Engine::new(prober.clone(), db.clone(), fast_config());
    engine.watch(node.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.unwatch("edge-1");
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after_unwatch = prober.probes();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = prober.probes();
    assert!(
        later <= after_unwatch + 1,
        "probing must stop after unwatch ({after_unwatch} -> {later})"
    );

    // A fresh watch after unwatch starts a new task.
    engine.watch(node.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(prober.probes() > later, "rewatch must probe again");

    engine.stop_all();
}

#[tokio::test]
async fn slow_consumers_lose_events_but_never_block_the_loop() {
    let (_dir, db) = open_store().await;
    let node = node_info("edge-1");
    store::nodes::put_node(&db, &node).await.expect("register");

    // Every probe misses, producing one event per tick; nobody consumes.
    let all_misses: Vec<bool> = vec![false; 512];
    let prober = ScriptedProber::new(&all_misses);
    let (engine, mut rx) = Engine::new(
        prober.clone(),
        db.clone(),
        HeartbeatConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        },
    );
    engine.watch(node.clone());

    tokio::time::sleep(Duration::from_millis(700)).await;
    engine.stop_all();

    let probes = prober.probes();
    assert!(
        probes > 64,
        "the loop must keep probing with a full channel, saw {probes}"
    );

    // The channel holds at most its capacity of 64.
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    assert!(drained <= 64, "bounded channel drained {drained}");
    assert!(drained > 0);
}

#[tokio::test]
async fn store_updates_survive_missing_node_rows() {
    // A watch on an unregistered node keeps ticking; update failures are
    // absorbed by the loop.
    let (_dir, db) = open_store().await;
    let node = node_info("ghost");

    let prober = ScriptedProber::new(&[]);
    let (engine, _rx) = Engine::new(prober.clone(), db.clone(), fast_config());
    engine.watch(node.clone());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(prober.probes() >= 2, "loop keeps running despite write failures");

    engine.stop_all();
}
