//! Lifecycle (up/down) and scaling against the mock engine.

mod support;

use std::sync::Arc;

use orbit::api::ServiceStatus;
use orbit::hooks::HookRegistry;
use orbit::orchestrator::{Lifecycle, Scaler};
use orbit::store;
use support::{open_store, service_spec, MockRuntime};

#[tokio::test]
async fn up_starts_missing_services_and_persists_unknown_status() {
    let (_dir, db) = open_store().await;
    let runtime = MockRuntime::new();
    let lifecycle = Lifecycle::new(Arc::clone(&runtime) as _, db.clone());

    let specs = vec![service_spec("web", "nginx:1.24"), service_spec("api", "api:2")];
    lifecycle.up(&specs, "local", false).await.expect("up");

    let states = store::services::list_service_states(&db, Some("local"))
        .await
        .expect("list");
    assert_eq!(states.len(), 2);
    assert!(states.iter().all(|s| s.status == ServiceStatus::Unknown));
    assert!(states.iter().all(|s| !s.container_id.is_empty()));

    let web = runtime.container_named("web").expect("web container");
    assert_eq!(web.labels.get("orbit.service").map(String::as_str), Some("web"));
    assert_eq!(web.labels.get("orbit.node").map(String::as_str), Some("local"));
    assert!(web.labels.contains_key("orbit.started"));
}

#[tokio::test]
async fn up_skips_running_services_unless_forced() {
    let (_dir, db) = open_store().await;
    let runtime = MockRuntime::new();
    let lifecycle = Lifecycle::new(Arc::clone(&runtime) as _, db.clone());

    let specs = vec![service_spec("web", "nginx:1.24")];
    lifecycle.up(&specs, "local", false).await.expect("up");
    let first_id = store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .expect("state")
        .container_id;

    lifecycle.up(&specs, "local", false).await.expect("up again");
    let second_id = store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .expect("state")
        .container_id;
    assert_eq!(first_id, second_id, "running service is left alone");

    lifecycle.up(&specs, "local", true).await.expect("forced");
    let third_id = store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .expect("state")
        .container_id;
    assert_ne!(second_id, third_id, "force recreate replaces the container");
    assert!(runtime
        .calls()
        .contains(&format!("stop {second_id} remove=true")));
}

#[tokio::test]
async fn down_stops_and_forgets_selected_services() {
    let (_dir, db) = open_store().await;
    let runtime = MockRuntime::new();
    let lifecycle = Lifecycle::new(Arc::clone(&runtime) as _, db.clone());

    let specs = vec![service_spec("web", "nginx:1.24"), service_spec("api", "api:2")];
    lifecycle.up(&specs, "local", false).await.expect("up");

    lifecycle
        .down("local", &["web".to_string()])
        .await
        .expect("down web");

    assert!(store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .is_none());
    assert!(store::services::get_service_state(&db, "local", "api")
        .await
        .expect("get")
        .is_some());

    // An empty name list sweeps everything that is left.
    lifecycle.down("local", &[]).await.expect("down all");
    assert!(store::services::list_service_states(&db, Some("local"))
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn scale_up_then_down_adjusts_indexed_replicas() {
    let (_dir, db) = open_store().await;
    let runtime = MockRuntime::new();
    let hooks = Arc::new(HookRegistry::new());
    let lifecycle = Lifecycle::new(Arc::clone(&runtime) as _, db.clone());
    let scaler = Scaler::new(Arc::clone(&runtime) as _, db.clone(), hooks);

    let spec = service_spec("web", "nginx:1.24");
    lifecycle.up(&[spec.clone()], "local", false).await.expect("up");

    scaler.scale(&spec, "local", 3).await.expect("scale up");

    let names: Vec<String> = runtime.containers().into_iter().map(|c| c.name).collect();
    assert!(names.contains(&"web".to_string()));
    assert!(names.contains(&"web-2".to_string()));
    assert!(names.contains(&"web-3".to_string()));

    let replica = runtime.container_named("web-3").expect("web-3");
    assert_eq!(replica.labels.get("orbit.replica").map(String::as_str), Some("3"));

    let state = store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .expect("state");
    assert_eq!(state.replicas, 3);

    scaler.scale(&spec, "local", 1).await.expect("scale down");
    let remaining: Vec<String> = runtime.containers().into_iter().map(|c| c.name).collect();
    assert_eq!(remaining, vec!["web".to_string()], "excess replicas stopped from the end");

    let state = store::services::get_service_state(&db, "local", "web")
        .await
        .expect("get")
        .expect("state");
    assert_eq!(state.replicas, 1);
}

#[tokio::test]
async fn scale_to_current_count_is_a_no_op() {
    let (_dir, db) = open_store().await;
    let runtime = MockRuntime::new();
    let hooks = Arc::new(HookRegistry::new());
    let lifecycle = Lifecycle::new(Arc::clone(&runtime) as _, db.clone());
    let scaler = Scaler::new(Arc::clone(&runtime) as _, db.clone(), hooks);

    let spec = service_spec("web", "nginx:1.24");
    lifecycle.up(&[spec.clone()], "local", false).await.expect("up");

    let calls_before = runtime.calls().len();
    scaler.scale(&spec, "local", 1).await.expect("no-op scale");

    let new_calls: Vec<String> = runtime.calls()[calls_before..].to_vec();
    assert!(
        new_calls.iter().all(|c| c.starts_with("list")),
        "no container churn on a no-op scale: {new_calls:?}"
    );
}
