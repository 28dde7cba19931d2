//! Replica scaling with a container-per-replica model.
//!
//! Replicas beyond the first run under indexed names (`<service>-2`,
//! `<service>-3`, …). The store keeps a single state per `(node, service)`;
//! scaling updates its replica count rather than persisting each replica.

use std::sync::Arc;

use common::api::ServiceSpec;
use tracing::{info, warn};

use crate::error::{ErrorKind, OrbitError};
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::orchestrator::deploy::short_id;
use crate::runtime::{DynContainerRuntime, NODE_LABEL, SERVICE_LABEL};
use crate::store::{self, Db};
use crate::Result;

/// Label carrying the replica index on scaled-out containers.
const REPLICA_LABEL: &str = "orbit.replica";

/// Adjusts the running replica count for services.
pub struct Scaler {
    runtime: DynContainerRuntime,
    db: Db,
    hooks: Arc<HookRegistry>,
}

impl Scaler {
    /// Builds a scaler bound to one runtime adapter.
    pub fn new(runtime: DynContainerRuntime, db: Db, hooks: Arc<HookRegistry>) -> Self {
        Self { runtime, db, hooks }
    }

    /// Brings the running replica count for the service to `target`.
    pub async fn scale(&self, spec: &ServiceSpec, node: &str, target: u32) -> Result<()> {
        let mut ctx = HookContext {
            service: Some(spec.clone()),
            node: Some(node.to_string()),
            ..Default::default()
        };
        ctx.metadata.insert("target".into(), target.to_string());
        self.hooks.fire(HookPoint::PreScale, &ctx);

        let mut running = self
            .runtime
            .list_containers(Some(&spec.name))
            .await
            .map_err(|err| {
                OrbitError::new(ErrorKind::RuntimeInspect, "scale.list", err)
                    .with_resource(spec.name.clone())
            })?;
        running.sort_by(|a, b| a.name.cmp(&b.name));

        let current = running.len() as u32;
        info!(service = %spec.name, current, target, "scale");

        if current == target {
            info!(service = %spec.name, "already at target replica count");
            self.hooks.fire(HookPoint::PostScale, &ctx);
            return Ok(());
        }

        // Scale up: start additional indexed replicas.
        for index in current..target {
            let name = format!("{}-{}", spec.name, index + 1);
            let mut replica_spec = spec.clone();
            replica_spec
                .labels
                .insert(SERVICE_LABEL.to_string(), spec.name.clone());
            replica_spec
                .labels
                .insert(NODE_LABEL.to_string(), node.to_string());
            replica_spec
                .labels
                .insert(REPLICA_LABEL.to_string(), (index + 1).to_string());

            let id = self
                .runtime
                .run_container(&replica_spec, &name)
                .await
                .map_err(|err| {
                    OrbitError::new(ErrorKind::ServiceStart, "scale.up", err)
                        .with_resource(name.clone())
                })?;
            info!(replica = %name, id = %short_id(&id), "replica started");
        }

        // Scale down: stop excess replicas from the end.
        if current > target {
            for summary in running.iter().rev().take((current - target) as usize) {
                info!(replica = %summary.name, id = %short_id(&summary.id), "stopping excess replica");
                if let Err(err) = self.runtime.stop_container(&summary.id, true).await {
                    warn!(replica = %summary.name, %err, "scale down: stop failed");
                }
            }
        }

        // Keep the single persisted state in step with the target.
        match store::services::get_service_state(&self.db, node, &spec.name).await {
            Ok(Some(mut state)) => {
                state.replicas = target;
                if let Err(err) = store::services::put_service_state(&self.db, &state).await {
                    warn!(service = %spec.name, %err, "failed to persist replica count");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(service = %spec.name, %err, "failed to load service state"),
        }

        self.hooks.fire(HookPoint::PostScale, &ctx);
        Ok(())
    }
}
