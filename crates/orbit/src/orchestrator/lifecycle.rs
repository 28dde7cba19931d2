//! Bulk service lifecycle: `up` and `down` for a set of services on a node.

use chrono::Utc;
use common::api::{ServiceSpec, ServiceState, ServiceStatus};
use tracing::{info, warn};

use crate::error::{ErrorKind, OrbitError};
use crate::orchestrator::deploy::short_id;
use crate::runtime::{DynContainerRuntime, NODE_LABEL, SERVICE_LABEL};
use crate::store::{self, Db};
use crate::Result;

/// Label recording when a container was started by `up`.
const STARTED_LABEL: &str = "orbit.started";

/// Starts and stops sets of services.
pub struct Lifecycle {
    runtime: DynContainerRuntime,
    db: Db,
}

impl Lifecycle {
    /// Builds a lifecycle manager bound to one runtime adapter.
    pub fn new(runtime: DynContainerRuntime, db: Db) -> Self {
        Self { runtime, db }
    }

    /// Ensures every service in `specs` is running on `node`. Services whose
    /// container is verified running are skipped unless `force_recreate`.
    pub async fn up(
        &self,
        specs: &[ServiceSpec],
        node: &str,
        force_recreate: bool,
    ) -> Result<()> {
        for spec in specs {
            self.up_one(spec, node, force_recreate).await?;
        }
        Ok(())
    }

    async fn up_one(&self, spec: &ServiceSpec, node: &str, force_recreate: bool) -> Result<()> {
        let existing = store::services::get_service_state(&self.db, node, &spec.name).await?;

        if let Some(state) = &existing {
            if !state.container_id.is_empty() && !force_recreate {
                if let Ok(details) = self.runtime.inspect_container(&state.container_id).await {
                    if details.running {
                        info!(service = %spec.name, "service already running, skipping");
                        return Ok(());
                    }
                }
            }
        }

        if let Some(state) = &existing {
            if !state.container_id.is_empty() {
                let _ = self.runtime.stop_container(&state.container_id, true).await;
            }
        }

        let mut run_spec = spec.clone();
        run_spec
            .labels
            .insert(SERVICE_LABEL.to_string(), spec.name.clone());
        run_spec
            .labels
            .insert(NODE_LABEL.to_string(), node.to_string());
        run_spec
            .labels
            .insert(STARTED_LABEL.to_string(), Utc::now().to_rfc3339());

        let id = self
            .runtime
            .run_container(&run_spec, &spec.name)
            .await
            .map_err(|err| {
                OrbitError::new(ErrorKind::ServiceStart, "up.run", err)
                    .with_resource(spec.name.clone())
            })?;

        store::services::put_service_state(
            &self.db,
            &ServiceState {
                name: spec.name.clone(),
                container_id: id,
                image: spec.image.clone(),
                status: ServiceStatus::Unknown,
                replicas: 1,
                node: node.to_string(),
                started_at: Utc::now(),
            },
        )
        .await
    }

    /// Stops, removes, and forgets the named services on `node`; all of them
    /// when `names` is empty. Stop failures are logged and do not abort the
    /// sweep.
    pub async fn down(&self, node: &str, names: &[String]) -> Result<()> {
        let states = store::services::list_service_states(&self.db, Some(node)).await?;

        for state in states {
            if !names.is_empty() && !names.contains(&state.name) {
                continue;
            }
            info!(service = %state.name, id = %short_id(&state.container_id), "stopping service");
            if let Err(err) = self.runtime.stop_container(&state.container_id, true).await {
                warn!(service = %state.name, %err, "stop failed");
            }
            if let Err(err) =
                store::services::delete_service_state(&self.db, node, &state.name).await
            {
                warn!(service = %state.name, %err, "failed to forget service state");
            }
        }
        Ok(())
    }
}
