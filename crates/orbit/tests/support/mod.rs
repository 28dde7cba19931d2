//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orbit::api::{NodeInfo, NodeSpec, ServiceSpec, ServiceState, ServiceStatus, ServiceMetrics};
use orbit::runtime::{
    ContainerRuntime, ContainerState, ContainerSummary, RuntimeError, SERVICE_LABEL,
};
use orbit::store::{self, Db};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// One container tracked by the mock engine.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    containers: Vec<MockContainer>,
}

/// In-memory container engine recording every call.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    next_id: AtomicUsize,
    pub fail_pull: AtomicBool,
    pub fail_start: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state.lock().unwrap().containers.clone()
    }

    pub fn container_named(&self, name: &str) -> Option<MockContainer> {
        self.containers().into_iter().find(|c| c.name == name)
    }

    pub fn insert_container(&self, container: MockContainer) {
        self.state.lock().unwrap().containers.push(container);
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {image}"));
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RuntimeError::Pull {
                image: image.to_string(),
                source: anyhow::anyhow!("manifest unknown"),
            });
        }
        Ok(())
    }

    async fn run_container(&self, spec: &ServiceSpec, name: &str) -> Result<String, RuntimeError> {
        self.record(format!("run {name} image={}", spec.image));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Start {
                id: name.to_string(),
                source: anyhow::anyhow!("cannot start"),
            });
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.insert_container(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            running: true,
        });
        Ok(id)
    }

    async fn stop_container(&self, id: &str, remove: bool) -> Result<(), RuntimeError> {
        self.record(format!("stop {id} remove={remove}"));
        let mut state = self.state.lock().unwrap();
        if remove {
            state.containers.retain(|c| c.id != id);
        } else if let Some(container) = state.containers.iter_mut().find(|c| c.id == id) {
            container.running = false;
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.record(format!("inspect {id}"));
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        Ok(ContainerState {
            id: container.id.clone(),
            running: container.running,
            status: if container.running {
                "running".into()
            } else {
                "exited".into()
            },
        })
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.record(format!("rename {id} {new_name}"));
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.iter_mut().find(|c| c.id == id) {
            container.name = new_name.to_string();
        }
        Ok(())
    }

    async fn list_containers(
        &self,
        service: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record(format!("list service={service:?}"));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| match service {
                Some(service) => c.labels.get(SERVICE_LABEL).map(String::as_str) == Some(service),
                None => c.labels.contains_key(SERVICE_LABEL),
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                service: c.labels.get(SERVICE_LABEL).cloned(),
                state: if c.running { "running".into() } else { "exited".into() },
            })
            .collect())
    }

    async fn stream_logs(
        &self,
        id: &str,
        _follow: bool,
        _since_secs: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RuntimeError> {
        self.record(format!("logs {id}"));
        writer
            .write_all(b"mock logs\n")
            .await
            .map_err(|err| RuntimeError::Logs {
                id: id.to_string(),
                source: err.into(),
            })
    }

    async fn container_stats(&self, id: &str) -> Result<ServiceMetrics, RuntimeError> {
        self.record(format!("stats {id}"));
        Ok(ServiceMetrics::default())
    }
}

/// Opens a store on a fresh temp file; keep the dir alive for the test.
pub async fn open_store() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = store::open(&dir.path().join("state.db")).await.expect("open");
    (dir, db)
}

pub fn service_spec(name: &str, image: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.into(),
        image: image.into(),
        ports: vec![],
        environment: Default::default(),
        labels: Default::default(),
        volumes: vec![],
        user: None,
        restart_policy: None,
        health_check: None,
        proxy: None,
        deploy: None,
    }
}

pub fn node_info(name: &str) -> NodeInfo {
    NodeInfo::new(NodeSpec {
        name: name.into(),
        host: "10.0.0.5".into(),
        user: "deploy".into(),
        key: "/home/deploy/.ssh/id_ed25519".into(),
        port: 22,
        groups: vec![],
    })
}

pub fn healthy_state(node: &str, service: &str, image: &str, container_id: &str) -> ServiceState {
    ServiceState {
        name: service.into(),
        container_id: container_id.into(),
        image: image.into(),
        status: ServiceStatus::Healthy,
        replicas: 1,
        node: node.into(),
        started_at: chrono::Utc::now(),
    }
}
