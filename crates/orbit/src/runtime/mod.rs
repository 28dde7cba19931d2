//! Narrow interface to a container engine.
//!
//! Two implementations share this contract: [`DockerRuntime`] talks to the
//! local daemon over the Docker API, [`remote::RemoteRuntime`] drives a remote
//! daemon through the transport pool. Dispatch happens through
//! [`DynContainerRuntime`] at call sites.

use std::sync::Arc;

use async_trait::async_trait;
use common::api::{ServiceMetrics, ServiceSpec};
use thiserror::Error;
use tokio::io::AsyncWrite;

pub mod docker;
pub mod helpers;
pub mod remote;

pub use docker::DockerRuntime;
pub use remote::RemoteRuntime;

/// Label identifying the owning service on every managed container.
pub const SERVICE_LABEL: &str = "orbit.service";
/// Label identifying the target node on every managed container.
pub const NODE_LABEL: &str = "orbit.node";

/// Grace period before a stop escalates to a kill, in seconds.
pub const STOP_GRACE_SECS: i32 = 10;

/// Shared handle to a runtime implementation.
pub type DynContainerRuntime = Arc<dyn ContainerRuntime>;

/// Inspection snapshot of a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Container id.
    pub id: String,
    /// Whether the container is currently running.
    pub running: bool,
    /// Engine-reported status string.
    pub status: String,
}

/// One row of a filtered container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Value of the `orbit.service` label, when present.
    pub service: Option<String>,
    /// Engine-reported state string.
    pub state: String,
}

/// Container engine operations the core consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls an image, blocking until the pull completes.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates and starts a container from `spec` under the given name,
    /// applying ports, environment, labels, volumes, user, and restart
    /// policy. The caller is responsible for injecting the `orbit.*` labels.
    async fn run_container(&self, spec: &ServiceSpec, name: &str) -> Result<String, RuntimeError>;

    /// Stops a container with the standard grace period, optionally removing
    /// it afterwards.
    async fn stop_container(&self, id: &str, remove: bool) -> Result<(), RuntimeError>;

    /// Returns the current state of a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// Renames a container.
    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError>;

    /// Lists managed containers, filtered by the `orbit.service` label value
    /// when `service` is given.
    async fn list_containers(&self, service: Option<&str>)
        -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Streams container logs into `writer`; `since_secs` limits output to
    /// the given relative window when positive.
    async fn stream_logs(
        &self,
        id: &str,
        follow: bool,
        since_secs: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RuntimeError>;

    /// Returns a single resource usage snapshot.
    async fn container_stats(&self, id: &str) -> Result<ServiceMetrics, RuntimeError>;
}

/// Errors surfaced by runtime implementations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to runtime ({context}): {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to pull image {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create container {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to start container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to stop container {id}: {source}")]
    Stop {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to remove container {id}: {source}")]
    Remove {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to rename container {id}: {source}")]
    Rename {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to inspect container {id}: {source}")]
    Inspect {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to collect stats for container {id}: {source}")]
    Stats {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to stream logs for container {id}: {source}")]
    Logs {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list containers: {0}")]
    List(#[source] anyhow::Error),
    #[error("container {id} not found")]
    NotFound { id: String },
}

impl RuntimeError {
    /// Reports whether the engine itself was unreachable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RuntimeError::Connection { .. })
    }

    /// Reports whether the target container does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}
