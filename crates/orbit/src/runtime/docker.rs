//! Local container engine adapter backed by the Docker API.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    errors::Error as DockerError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptionsBuilder, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
        StatsOptionsBuilder, StopContainerOptions,
    },
    Docker,
};
use common::api::{ServiceMetrics, ServiceSpec};
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::runtime::{
    helpers::{build_ports, calculate_cpu_percent, format_env, network_bytes, restart_policy},
    ContainerRuntime, ContainerState, ContainerSummary, RuntimeError, SERVICE_LABEL,
    STOP_GRACE_SECS,
};

/// Adapter for the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the standard environment (`DOCKER_HOST` or the default
    /// socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_defaults().map_err(|err| RuntimeError::Connection {
            context: "connect",
            source: err.into(),
        })?;
        Ok(Self { docker })
    }

    /// Wraps an existing client, mainly for tests.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(image.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            progress.map_err(|err| {
                map_connection_or(err, "pull_image", |source| RuntimeError::Pull {
                    image: image.to_string(),
                    source: source.into(),
                })
            })?;
        }

        Ok(())
    }

    async fn run_container(&self, spec: &ServiceSpec, name: &str) -> Result<String, RuntimeError> {
        let (port_bindings, exposed_ports) = build_ports(&spec.ports);

        let host_config = HostConfig {
            port_bindings,
            binds: if spec.volumes.is_empty() {
                None
            } else {
                Some(spec.volumes.clone())
            },
            restart_policy: Some(restart_policy(spec.restart_policy.as_deref())),
            ..Default::default()
        };

        let container_config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: format_env(&spec.environment),
            exposed_ports,
            host_config: Some(host_config),
            user: spec.user.clone(),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: Some(name.to_string()),
            platform: String::new(),
        };

        let created = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(|err| {
                map_connection_or(err, "create_container", |source| RuntimeError::Create {
                    name: name.to_string(),
                    source: source.into(),
                })
            })?;

        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // Keep the engine clean: a created-but-unstartable container
            // would otherwise block the name.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        v: false,
                        force: true,
                        link: false,
                    }),
                )
                .await;
            return Err(map_connection_or(err, "start_container", |source| {
                RuntimeError::Start {
                    id: created.id.clone(),
                    source: source.into(),
                }
            }));
        }

        Ok(created.id)
    }

    async fn stop_container(&self, id: &str, remove: bool) -> Result<(), RuntimeError> {
        let stopped = self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    signal: None,
                    t: Some(STOP_GRACE_SECS),
                }),
            )
            .await;

        match stopped {
            Ok(()) => {}
            Err(err) if is_not_modified(&err) => {}
            Err(err) => {
                return Err(map_docker_error(err, id, "stop_container", |id, source| {
                    RuntimeError::Stop {
                        id,
                        source: source.into(),
                    }
                }))
            }
        }

        if remove {
            self.docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        v: false,
                        force: false,
                        link: false,
                    }),
                )
                .await
                .map_err(|err| {
                    map_docker_error(err, id, "remove_container", |id, source| {
                        RuntimeError::Remove {
                            id,
                            source: source.into(),
                        }
                    })
                })?;
        }

        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| {
                map_docker_error(err, id, "inspect_container", |id, source| {
                    RuntimeError::Inspect {
                        id,
                        source: source.into(),
                    }
                })
            })?;

        let state = details.state.as_ref();
        Ok(ContainerState {
            id: details.id.clone().unwrap_or_else(|| id.to_string()),
            running: state.and_then(|s| s.running).unwrap_or(false),
            status: state
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.docker
            .rename_container(
                id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| {
                map_docker_error(err, id, "rename_container", |id, source| {
                    RuntimeError::Rename {
                        id,
                        source: source.into(),
                    }
                })
            })
    }

    async fn list_containers(
        &self,
        service: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        let label_filter = match service {
            Some(service) => format!("{SERVICE_LABEL}={service}"),
            None => SERVICE_LABEL.to_string(),
        };
        filters.insert("label".to_string(), vec![label_filter]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|err| {
                map_connection_or(err, "list_containers", |source| {
                    RuntimeError::List(source.into())
                })
            })?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                service: c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(SERVICE_LABEL).cloned()),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect())
    }

    async fn stream_logs(
        &self,
        id: &str,
        follow: bool,
        since_secs: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RuntimeError> {
        let mut opts = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .follow(follow)
            .timestamps(true);
        if since_secs > 0 {
            opts = opts.since((chrono::Utc::now().timestamp() - since_secs) as i32);
        }

        let mut stream = self.docker.logs(id, Some(opts.build()));
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                map_docker_error(err, id, "stream_logs", |id, source| RuntimeError::Logs {
                    id,
                    source: source.into(),
                })
            })?;
            writer
                .write_all(&chunk.into_bytes())
                .await
                .map_err(|err| RuntimeError::Logs {
                    id: id.to_string(),
                    source: err.into(),
                })?;
        }

        Ok(())
    }

    async fn container_stats(&self, id: &str) -> Result<ServiceMetrics, RuntimeError> {
        let mut stream = self
            .docker
            .stats(
                id,
                Some(
                    StatsOptionsBuilder::default()
                        .stream(false)
                        .one_shot(true)
                        .build(),
                ),
            )
            .take(1);

        let stats = stream
            .try_next()
            .await
            .map_err(|err| {
                map_docker_error(err, id, "container_stats", |id, source| RuntimeError::Stats {
                    id,
                    source: source.into(),
                })
            })?
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;

        let memory = stats.memory_stats.as_ref();
        Ok(ServiceMetrics {
            cpu_percent: calculate_cpu_percent(&stats).unwrap_or_default(),
            mem_bytes: memory.and_then(|mem| mem.usage).unwrap_or_default(),
            mem_limit: memory.and_then(|mem| mem.limit).unwrap_or_default(),
            net_rx_bytes: network_bytes(&stats, |net| net.rx_bytes),
            net_tx_bytes: network_bytes(&stats, |net| net.tx_bytes),
            pids: stats
                .pids_stats
                .as_ref()
                .and_then(|pids| pids.current)
                .unwrap_or_default() as u32,
        })
    }
}

fn map_connection_or<F>(err: DockerError, context: &'static str, wrap: F) -> RuntimeError
where
    F: FnOnce(DockerError) -> RuntimeError,
{
    if is_connection_error(&err) {
        RuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(err)
    }
}

fn map_docker_error<F>(err: DockerError, id: &str, context: &'static str, wrap: F) -> RuntimeError
where
    F: FnOnce(String, DockerError) -> RuntimeError,
{
    if is_not_found(&err) {
        RuntimeError::NotFound { id: id.to_string() }
    } else if is_connection_error(&err) {
        RuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(id.to_string(), err)
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn is_connection_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
            | DockerError::SocketNotFoundError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_connection_or_wraps_connection_errors() {
        let err = DockerError::RequestTimeoutError;
        let mapped = map_connection_or(err, "pull_image", |source| RuntimeError::Pull {
            image: "img".into(),
            source: source.into(),
        });
        match mapped {
            RuntimeError::Connection { context, .. } => assert_eq!(context, "pull_image"),
            other => panic!("expected connection error, got {other:?}"),
        }

        let err = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        let mapped = map_connection_or(err, "pull_image", |source| RuntimeError::Pull {
            image: "img".into(),
            source: source.into(),
        });
        match mapped {
            RuntimeError::Pull { image, .. } => assert_eq!(image, "img"),
            other => panic!("expected pull error, got {other:?}"),
        }
    }

    #[test]
    fn map_docker_error_handles_not_found() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "missing".into(),
        };
        let mapped = map_docker_error(not_found, "id-1", "inspect", |id, source| {
            RuntimeError::Inspect {
                id,
                source: source.into(),
            }
        });
        match mapped {
            RuntimeError::NotFound { id } => assert_eq!(id, "id-1"),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn not_modified_detection() {
        let not_modified = DockerError::DockerResponseServerError {
            status_code: 304,
            message: "unchanged".into(),
        };
        assert!(is_not_modified(&not_modified));
        assert!(!is_not_found(&not_modified));
    }

    #[test]
    fn connection_error_detection() {
        assert!(is_connection_error(&DockerError::RequestTimeoutError));
        assert!(is_connection_error(&DockerError::SocketNotFoundError(
            "sock".into()
        )));
        assert!(!is_connection_error(
            &DockerError::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            }
        ));
    }
}
