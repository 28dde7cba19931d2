//! Shared API DTOs used across the Orbit core: the declarative specs decoded
//! from `orbit.yaml` and the runtime records persisted in the state store.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health state of a deployed service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Last probe passed.
    Healthy,
    /// Probes are flapping or partially failing.
    Degraded,
    /// Last probe failed.
    Unhealthy,
    /// No probe has run yet.
    Unknown,
}

impl ServiceStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "healthy" => Ok(ServiceStatus::Healthy),
            "degraded" => Ok(ServiceStatus::Degraded),
            "unhealthy" => Ok(ServiceStatus::Unhealthy),
            "unknown" => Ok(ServiceStatus::Unknown),
            other => Err(format!("unknown service status {other:?}")),
        }
    }
}

/// Connectivity state of a remote node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Last heartbeat probe succeeded.
    Online,
    /// One or two consecutive probes missed.
    Degraded,
    /// Three or more consecutive probes missed.
    Offline,
}

impl NodeStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Offline => "offline",
        }
    }

    /// Derives the status from a consecutive heartbeat failure count.
    pub fn from_fail_count(fail_count: u32) -> NodeStatus {
        match fail_count {
            0 => NodeStatus::Online,
            1..=2 => NodeStatus::Degraded,
            _ => NodeStatus::Offline,
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(NodeStatus::Online),
            "degraded" => Ok(NodeStatus::Degraded),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(format!("unknown node status {other:?}")),
        }
    }
}

/// Terminal outcome of a single deployment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployResult {
    /// New container promoted to the canonical name.
    Success,
    /// Deploy aborted; the prior container (if any) was left untouched.
    Failure,
    /// Health gate failed and the prior image was restarted.
    RolledBack,
}

impl DeployResult {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployResult::Success => "success",
            DeployResult::Failure => "failure",
            DeployResult::RolledBack => "rolledback",
        }
    }
}

impl FromStr for DeployResult {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(DeployResult::Success),
            "failure" => Ok(DeployResult::Failure),
            "rolledback" => Ok(DeployResult::RolledBack),
            other => Err(format!("unknown deploy result {other:?}")),
        }
    }
}

/// Declarative definition of a remote node from `orbit.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    /// Unique DNS-label name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH login user.
    pub user: String,
    /// Path to the private key used for public-key authentication.
    #[serde(default)]
    pub key: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Free-form group tags.
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Persisted runtime record for a registered node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// The declarative spec the node was registered with.
    pub spec: NodeSpec,
    /// Connectivity state derived from the heartbeat fail counter.
    pub status: NodeStatus,
    /// When the node was last successfully probed or registered.
    pub last_seen: DateTime<Utc>,
    /// MD5 colon-hex fingerprint of the trusted host key.
    #[serde(default)]
    pub key_fingerprint: String,
    /// Encoded `host type base64` host-key line.
    #[serde(default)]
    pub host_key: String,
    /// Whether the operator has explicitly trusted the host key.
    #[serde(default)]
    pub host_key_known: bool,
    /// Consecutive heartbeat failures.
    #[serde(default)]
    pub fail_count: u32,
}

impl NodeInfo {
    /// Builds the initial record for a freshly registered node.
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            status: NodeStatus::Offline,
            last_seen: Utc::now(),
            key_fingerprint: String::new(),
            host_key: String::new(),
            host_key_known: false,
            fail_count: 0,
        }
    }
}

/// Declarative definition of a service from `orbit.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    /// Unique service name; also the canonical container name.
    pub name: String,
    /// Container image, optionally tagged.
    pub image: String,
    /// Port mappings as `"hostPort:containerPort"`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Container labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Volume binds in Docker `host:container[:mode]` syntax.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Container user.
    #[serde(default)]
    pub user: Option<String>,
    /// Docker restart policy name.
    #[serde(default, rename = "restart")]
    pub restart_policy: Option<String>,
    /// Liveness probe configuration.
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    /// Reverse-proxy settings consumed by the proxy emitter.
    #[serde(default)]
    pub proxy: Option<ProxySpec>,
    /// Rolling deploy policy.
    #[serde(default)]
    pub deploy: Option<DeploySpec>,
}

/// Probe protocol for a health check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// HTTP GET against a URL.
    Http,
    /// TCP dial against a local port.
    Tcp,
    /// Local shell command.
    Cmd,
}

/// Health probe configuration for a service.
///
/// Defaults are applied at deserialization; an explicit `retries: 0` is
/// honored and means a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckSpec {
    /// Probe protocol.
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    /// URL for http probes.
    #[serde(default)]
    pub url: String,
    /// Port for tcp probes.
    #[serde(default)]
    pub port: u16,
    /// Shell command for cmd probes.
    #[serde(default)]
    pub command: String,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_probe_secs")]
    pub timeout_secs: u64,
    /// Sleep between attempts in seconds.
    #[serde(default = "default_probe_secs")]
    pub interval_secs: u64,
    /// Additional attempts after the first.
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    /// Exact HTTP status required; 0 accepts any 2xx.
    #[serde(default)]
    pub expected_code: u16,
}

impl HealthCheckSpec {
    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sleep between attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_probe_secs() -> u64 {
    5
}

fn default_probe_retries() -> u32 {
    3
}

/// Reverse-proxy settings for a service; consumed outside the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProxySpec {
    /// Public domain to route.
    #[serde(default)]
    pub domain: String,
    /// Whether to terminate TLS.
    #[serde(default)]
    pub ssl: bool,
    /// Listen port on the proxy.
    #[serde(default)]
    pub port: u16,
    /// Container port to proxy to.
    #[serde(default)]
    pub backend: u16,
}

/// Rollout strategy for a deploy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    /// Shadow container swapped in after passing the health gate.
    #[default]
    Rolling,
    /// Reserved; behaves as rolling.
    #[serde(rename = "blue-green")]
    BlueGreen,
}

/// Rolling deploy policy for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploySpec {
    /// Desired replica count.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Rollout strategy.
    #[serde(default)]
    pub strategy: DeployStrategy,
    /// Extra replicas allowed during a rollout.
    #[serde(default)]
    pub max_surge: u32,
    /// Restart the prior image when the health gate fails.
    #[serde(default)]
    pub rollback_on_failure: bool,
    /// Delay before the first readiness probe, in seconds.
    #[serde(default)]
    pub readiness_delay_secs: u64,
}

fn default_replicas() -> u32 {
    1
}

impl Default for DeploySpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            strategy: DeployStrategy::Rolling,
            max_surge: 0,
            rollback_on_failure: false,
            readiness_delay_secs: 0,
        }
    }
}

/// Persisted runtime state of a service deployed to a node.
///
/// `container_id` is non-empty whenever `status` is not [`ServiceStatus::Unknown`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceState {
    /// Service name.
    pub name: String,
    /// Id of the container currently backing the service.
    pub container_id: String,
    /// Image the container was started from, including tag.
    pub image: String,
    /// Health state.
    pub status: ServiceStatus,
    /// Replica count last applied.
    pub replicas: u32,
    /// Node the service runs on.
    pub node: String,
    /// When the backing container was started.
    pub started_at: DateTime<Utc>,
}

/// Immutable audit record of a deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    /// Unique record id.
    pub id: String,
    /// Service deployed.
    pub service: String,
    /// Target node.
    pub node: String,
    /// Image of the prior state, or empty on first deploy.
    #[serde(default)]
    pub from_image: String,
    /// Resolved image of this attempt.
    pub to_image: String,
    /// Attempt start time.
    pub started_at: DateTime<Utc>,
    /// Attempt completion time.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Terminal outcome.
    pub result: DeployResult,
    /// Error message; present iff the result is not success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time resource usage snapshot for a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceMetrics {
    /// CPU usage as a percentage of a single core.
    pub cpu_percent: f64,
    /// Memory usage in bytes.
    pub mem_bytes: u64,
    /// Memory limit in bytes.
    pub mem_limit: u64,
    /// Network bytes received.
    pub net_rx_bytes: u64,
    /// Network bytes transmitted.
    pub net_tx_bytes: u64,
    /// Number of processes in the container.
    pub pids: u32,
}
