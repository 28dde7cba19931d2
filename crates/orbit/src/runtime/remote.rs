//! Remote container engine adapter.
//!
//! Drives the `docker` CLI on a remote host through the transport pool,
//! parsing `--format` JSON output where structure is needed.

use std::sync::Arc;

use async_trait::async_trait;
use common::api::{NodeInfo, ServiceMetrics, ServiceSpec};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::remote::pool::{Pool, TransportError};
use crate::runtime::{
    helpers::{parse_bytes, parse_io_pair, parse_percent},
    ContainerRuntime, ContainerState, ContainerSummary, RuntimeError, SERVICE_LABEL,
    STOP_GRACE_SECS,
};

/// Adapter for a Docker daemon on a pooled remote node.
pub struct RemoteRuntime {
    pool: Arc<Pool>,
    node: NodeInfo,
}

impl RemoteRuntime {
    /// Binds the adapter to one node.
    pub fn new(pool: Arc<Pool>, node: NodeInfo) -> Self {
        Self { pool, node }
    }

    async fn run(&self, command: &str) -> Result<String, TransportError> {
        self.pool
            .run(&self.node, command)
            .await
            .map(|exec| exec.output)
    }
}

#[async_trait]
impl ContainerRuntime for RemoteRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&format!("docker pull {}", sh_quote(image)))
            .await
            .map(|_| ())
            .map_err(|err| map_exec_error(err, image, "pull_image", |image, source| {
                RuntimeError::Pull { image, source }
            }))
    }

    async fn run_container(&self, spec: &ServiceSpec, name: &str) -> Result<String, RuntimeError> {
        let command = build_run_command(spec, name);
        let output = self
            .run(&command)
            .await
            .map_err(|err| map_exec_error(err, name, "run_container", |name, source| {
                RuntimeError::Create { name, source }
            }))?;

        // `docker run -d` prints the new container id on the last line.
        let id = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::Start {
                id: name.to_string(),
                source: anyhow::anyhow!("docker run produced no container id"),
            });
        }
        Ok(id)
    }

    async fn stop_container(&self, id: &str, remove: bool) -> Result<(), RuntimeError> {
        self.run(&format!("docker stop -t {STOP_GRACE_SECS} {}", sh_quote(id)))
            .await
            .map_err(|err| map_exec_error(err, id, "stop_container", |id, source| {
                RuntimeError::Stop { id, source }
            }))?;

        if remove {
            self.run(&format!("docker rm {}", sh_quote(id)))
                .await
                .map_err(|err| map_exec_error(err, id, "remove_container", |id, source| {
                    RuntimeError::Remove { id, source }
                }))?;
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let output = self
            .run(&format!(
                "docker inspect --format {} {}",
                sh_quote("{{json .State}}"),
                sh_quote(id)
            ))
            .await
            .map_err(|err| map_exec_error(err, id, "inspect_container", |id, source| {
                RuntimeError::Inspect { id, source }
            }))?;

        let state: RemoteContainerState =
            serde_json::from_str(output.trim()).map_err(|err| RuntimeError::Inspect {
                id: id.to_string(),
                source: anyhow::anyhow!("unexpected inspect output: {err}"),
            })?;

        Ok(ContainerState {
            id: id.to_string(),
            running: state.running,
            status: state.status,
        })
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.run(&format!(
            "docker rename {} {}",
            sh_quote(id),
            sh_quote(new_name)
        ))
        .await
        .map(|_| ())
        .map_err(|err| map_exec_error(err, id, "rename_container", |id, source| {
            RuntimeError::Rename { id, source }
        }))
    }

    async fn list_containers(
        &self,
        service: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let output = self
            .run(&build_list_command(service))
            .await
            .map_err(|err| match err {
                TransportError::CommandFailed { exit_code, output } => RuntimeError::List(
                    anyhow::anyhow!("exit status {exit_code}: {}", output.trim()),
                ),
                other => RuntimeError::Connection {
                    context: "list_containers",
                    source: other.into(),
                },
            })?;

        let mut summaries = Vec::new();
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let row: RemotePsRow = serde_json::from_str(line).map_err(|err| {
                RuntimeError::List(anyhow::anyhow!("unexpected ps output: {err}"))
            })?;
            summaries.push(row.into_summary());
        }
        Ok(summaries)
    }

    async fn stream_logs(
        &self,
        id: &str,
        follow: bool,
        since_secs: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RuntimeError> {
        let command = build_logs_command(id, follow, since_secs);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);

        let pool = Arc::clone(&self.pool);
        let node = self.node.clone();
        let exec = tokio::spawn(async move { pool.run_streamed(&node, &command, tx).await });

        while let Some(chunk) = rx.recv().await {
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| RuntimeError::Logs {
                    id: id.to_string(),
                    source: err.into(),
                })?;
        }

        let exit_code = exec
            .await
            .map_err(|err| RuntimeError::Logs {
                id: id.to_string(),
                source: anyhow::anyhow!("log task aborted: {err}"),
            })?
            .map_err(|err| map_exec_error(err, id, "stream_logs", |id, source| {
                RuntimeError::Logs { id, source }
            }))?;

        if exit_code != 0 {
            return Err(RuntimeError::Logs {
                id: id.to_string(),
                source: anyhow::anyhow!("docker logs exited with status {exit_code}"),
            });
        }
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> Result<ServiceMetrics, RuntimeError> {
        let output = self
            .run(&format!(
                "docker stats --no-stream --format {} {}",
                sh_quote("{{json .}}"),
                sh_quote(id)
            ))
            .await
            .map_err(|err| map_exec_error(err, id, "container_stats", |id, source| {
                RuntimeError::Stats { id, source }
            }))?;

        let row: RemoteStatsRow =
            serde_json::from_str(output.trim()).map_err(|err| RuntimeError::Stats {
                id: id.to_string(),
                source: anyhow::anyhow!("unexpected stats output: {err}"),
            })?;
        Ok(row.into_metrics())
    }
}

#[derive(Debug, Deserialize)]
struct RemoteContainerState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RemotePsRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl RemotePsRow {
    fn into_summary(self) -> ContainerSummary {
        let service = self
            .labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == SERVICE_LABEL)
            .map(|(_, value)| value.to_string());
        ContainerSummary {
            id: self.id,
            name: self.names,
            image: self.image,
            service,
            state: self.state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteStatsRow {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

impl RemoteStatsRow {
    fn into_metrics(self) -> ServiceMetrics {
        let (mem_bytes, mem_limit) = match self.mem_usage.split_once('/') {
            Some((used, limit)) => (parse_bytes(used), parse_bytes(limit)),
            None => (parse_bytes(&self.mem_usage), 0),
        };
        let (net_rx_bytes, net_tx_bytes) = parse_io_pair(&self.net_io);
        ServiceMetrics {
            cpu_percent: parse_percent(&self.cpu_perc),
            mem_bytes,
            mem_limit,
            net_rx_bytes,
            net_tx_bytes,
            pids: self.pids.trim().parse().unwrap_or_default(),
        }
    }
}

fn map_exec_error(
    err: TransportError,
    resource: &str,
    context: &'static str,
    wrap: impl FnOnce(String, anyhow::Error) -> RuntimeError,
) -> RuntimeError {
    match err {
        TransportError::CommandFailed { exit_code, output } => {
            if output.contains("No such container") || output.contains("No such object") {
                RuntimeError::NotFound {
                    id: resource.to_string(),
                }
            } else {
                wrap(
                    resource.to_string(),
                    anyhow::anyhow!("exit status {exit_code}: {}", output.trim()),
                )
            }
        }
        other => RuntimeError::Connection {
            context,
            source: other.into(),
        },
    }
}

fn build_run_command(spec: &ServiceSpec, name: &str) -> String {
    let mut cmd = format!("docker run -d --name {}", sh_quote(name));

    let policy = spec.restart_policy.as_deref().unwrap_or("unless-stopped");
    cmd.push_str(&format!(" --restart {}", sh_quote(policy)));

    for port in &spec.ports {
        cmd.push_str(&format!(" -p {}", sh_quote(port)));
    }

    let mut env: Vec<(&String, &String)> = spec.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        cmd.push_str(&format!(" -e {}", sh_quote(&format!("{key}={value}"))));
    }

    let mut labels: Vec<(&String, &String)> = spec.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        cmd.push_str(&format!(" -l {}", sh_quote(&format!("{key}={value}"))));
    }

    for volume in &spec.volumes {
        cmd.push_str(&format!(" -v {}", sh_quote(volume)));
    }

    if let Some(user) = &spec.user {
        cmd.push_str(&format!(" --user {}", sh_quote(user)));
    }

    cmd.push_str(&format!(" {}", sh_quote(&spec.image)));
    cmd
}

fn build_list_command(service: Option<&str>) -> String {
    let filter = match service {
        Some(service) => format!("label={SERVICE_LABEL}={service}"),
        None => format!("label={SERVICE_LABEL}"),
    };
    format!(
        "docker ps -a --no-trunc --filter {} --format {}",
        sh_quote(&filter),
        sh_quote("{{json .}}")
    )
}

fn build_logs_command(id: &str, follow: bool, since_secs: i64) -> String {
    let mut cmd = String::from("docker logs --timestamps");
    if follow {
        cmd.push_str(" --follow");
    }
    if since_secs > 0 {
        cmd.push_str(&format!(" --since {since_secs}s"));
    }
    cmd.push_str(&format!(" {}", sh_quote(id)));
    cmd
}

pub(crate) fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
