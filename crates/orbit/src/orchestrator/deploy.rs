//! Rolling deploy state machine with health-gated promotion and rollback.
//!
//! A deploy pulls the new image, starts a shadow container under a unique
//! temporary name, probes it until healthy, then promotes it: the prior
//! container is stopped and removed, the shadow takes the canonical service
//! name, and the service state is persisted. When the health gate fails the
//! shadow is always stopped and removed first; rollback (when enabled and a
//! prior state exists) then restarts the prior image under the canonical
//! name. Every terminal edge appends a deployment record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::api::{DeployResult, DeploymentRecord, ServiceSpec, ServiceState, ServiceStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, OrbitError};
use crate::health::Checker;
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::runtime::{DynContainerRuntime, NODE_LABEL, SERVICE_LABEL};
use crate::store::{self, Db};
use crate::telemetry;
use crate::Result;

/// Bound on the Wait-Healthy loop when neither the options nor the health
/// check provide one.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-deploy overrides.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Replaces the tag portion of the spec's image.
    pub tag: Option<String>,
    /// Overrides the health-gate bound.
    pub timeout: Option<Duration>,
    /// Log the plan without touching the runtime or the store.
    pub dry_run: bool,
}

/// Orchestrates rolling updates for a single service on a single node.
///
/// Deploys are linearizable per `(service, node)` pair; callers must not
/// issue concurrent deploys for the same pair.
pub struct Deployer {
    runtime: DynContainerRuntime,
    db: Db,
    checker: Checker,
    hooks: Arc<HookRegistry>,
}

impl Deployer {
    /// Builds a deployer bound to one runtime adapter.
    pub fn new(
        runtime: DynContainerRuntime,
        db: Db,
        checker: Checker,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            runtime,
            db,
            checker,
            hooks,
        }
    }

    /// Performs a rolling update of `spec` on `node`.
    pub async fn deploy(&self, spec: &ServiceSpec, node: &str, opts: DeployOptions) -> Result<()> {
        let image = resolve_image(&spec.image, opts.tag.as_deref());
        let timeout = effective_timeout(spec, &opts);
        let started_at = Utc::now();

        info!(
            service = %spec.name,
            node,
            image = %image,
            dry_run = opts.dry_run,
            "deploy started"
        );
        self.hooks.fire(
            HookPoint::PreDeploy,
            &hook_ctx(spec, node, "", &image, opts.dry_run),
        );

        if opts.dry_run {
            info!(service = %spec.name, "dry run, no changes made");
            self.finish(spec, node, "", &image, started_at, DeployResult::Success, None)
                .await;
            return Ok(());
        }

        let existing = match store::services::get_service_state(&self.db, node, &spec.name).await {
            Ok(state) => state,
            Err(err) => {
                self.finish(
                    spec,
                    node,
                    "",
                    &image,
                    started_at,
                    DeployResult::Failure,
                    Some(err.to_string()),
                )
                .await;
                return Err(err);
            }
        };
        let from_image = existing
            .as_ref()
            .map(|state| state.image.clone())
            .unwrap_or_default();

        // Pull before anything is mutated; a failure here needs no cleanup.
        if let Err(err) = self.runtime.pull_image(&image).await {
            let err = OrbitError::new(ErrorKind::RuntimePull, "deploy.pull", err)
                .with_resource(node.to_string())
                .with_advice("Check your registry credentials and image name");
            self.finish(
                spec,
                node,
                &from_image,
                &image,
                started_at,
                DeployResult::Failure,
                Some(err.to_string()),
            )
            .await;
            return Err(err);
        }

        // Start the shadow container under a unique temporary name.
        let shadow_name = format!("{}-new-{}", spec.name, Utc::now().timestamp());
        let mut shadow_spec = spec.clone();
        shadow_spec.image = image.clone();
        shadow_spec
            .labels
            .insert(SERVICE_LABEL.to_string(), spec.name.clone());
        shadow_spec
            .labels
            .insert(NODE_LABEL.to_string(), node.to_string());

        let shadow_id = match self.runtime.run_container(&shadow_spec, &shadow_name).await {
            Ok(id) => id,
            Err(err) => {
                let err = OrbitError::new(ErrorKind::RuntimeRun, "deploy.run", err)
                    .with_resource(node.to_string());
                self.finish(
                    spec,
                    node,
                    &from_image,
                    &image,
                    started_at,
                    DeployResult::Failure,
                    Some(err.to_string()),
                )
                .await;
                return Err(err);
            }
        };

        if spec.health_check.is_some() {
            info!(service = %spec.name, ?timeout, "waiting for health gate");

            let gate =
                tokio::time::timeout(timeout, self.checker.wait_healthy(&shadow_spec, &shadow_id))
                    .await
                    .unwrap_or_else(|_| {
                        Err(anyhow::anyhow!("health check timed out after {timeout:?}"))
                    });

            if let Err(probe_err) = gate {
                warn!(service = %spec.name, err = %probe_err, "health gate failed");

                // The shadow is always cleared before any rollback so the
                // canonical name cannot collide.
                if let Err(err) = self.runtime.stop_container(&shadow_id, true).await {
                    warn!(service = %spec.name, %err, "failed to remove shadow container");
                }

                let rollback = spec
                    .deploy
                    .as_ref()
                    .is_some_and(|deploy| deploy.rollback_on_failure);
                let result = match (&existing, rollback) {
                    (Some(prior), true) => {
                        warn!(
                            service = %spec.name,
                            prior_image = %prior.image,
                            "rolling back to previous image"
                        );
                        let mut rollback_spec = shadow_spec.clone();
                        rollback_spec.image = prior.image.clone();
                        if let Err(err) =
                            self.runtime.run_container(&rollback_spec, &spec.name).await
                        {
                            warn!(service = %spec.name, %err, "rollback start failed");
                        }
                        DeployResult::RolledBack
                    }
                    _ => DeployResult::Failure,
                };

                let err = OrbitError::new(
                    ErrorKind::ServiceHealthFail,
                    "deploy.healthcheck",
                    probe_err,
                )
                .with_resource(node.to_string())
                .with_advice(format!(
                    "New container failed health check. Run: orbit logs {}",
                    spec.name
                ));
                self.finish(
                    spec,
                    node,
                    &from_image,
                    &image,
                    started_at,
                    result,
                    Some(err.to_string()),
                )
                .await;
                return Err(err);
            }
        }

        // Promote: clear the prior container, take the canonical name,
        // persist the new state. Failures past this point are logged but do
        // not change the outcome.
        if let Some(prior) = &existing {
            if !prior.container_id.is_empty() {
                info!(id = %short_id(&prior.container_id), "stopping previous container");
                if let Err(err) = self.runtime.stop_container(&prior.container_id, true).await {
                    warn!(service = %spec.name, %err, "failed to stop previous container");
                }
            }
        }

        if let Err(err) = self.runtime.rename_container(&shadow_id, &spec.name).await {
            warn!(service = %spec.name, %err, "failed to rename shadow container");
        }

        let state = ServiceState {
            name: spec.name.clone(),
            container_id: shadow_id,
            image: image.clone(),
            status: ServiceStatus::Healthy,
            replicas: spec.deploy.as_ref().map(|d| d.replicas).unwrap_or(1),
            node: node.to_string(),
            started_at: Utc::now(),
        };
        if let Err(err) = store::services::put_service_state(&self.db, &state).await {
            warn!(service = %spec.name, %err, "failed to persist service state");
        }

        self.hooks.fire(
            HookPoint::PostDeploy,
            &hook_ctx(spec, node, &from_image, &image, false),
        );
        self.finish(
            spec,
            node,
            &from_image,
            &image,
            started_at,
            DeployResult::Success,
            None,
        )
        .await;
        info!(service = %spec.name, image = %image, "deploy complete");
        Ok(())
    }

    /// Appends the audit record for a terminal edge. Persistence failures
    /// are logged and never mask the deployment's own result.
    async fn finish(
        &self,
        spec: &ServiceSpec,
        node: &str,
        from_image: &str,
        to_image: &str,
        started_at: chrono::DateTime<Utc>,
        result: DeployResult,
        error: Option<String>,
    ) {
        telemetry::record_deploy_result(result.as_str());

        let completed_at = Utc::now();
        let record = DeploymentRecord {
            id: Uuid::new_v4().to_string(),
            service: spec.name.clone(),
            node: node.to_string(),
            from_image: from_image.to_string(),
            to_image: to_image.to_string(),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            result,
            error,
        };
        if let Err(err) = store::deployments::put_deployment(&self.db, &record).await {
            warn!(service = %spec.name, %err, "failed to persist deployment record");
        }
    }
}

/// Applies a tag override: the substring after the final `:` is replaced,
/// or the tag is appended when the image has none.
pub(crate) fn resolve_image(image: &str, tag: Option<&str>) -> String {
    match tag {
        None | Some("") => image.to_string(),
        Some(tag) => match image.rfind(':') {
            Some(idx) => format!("{}:{tag}", &image[..idx]),
            None => format!("{image}:{tag}"),
        },
    }
}

/// Effective bound on the Wait-Healthy loop: the explicit override when
/// positive, then `timeout × (retries + 2)` from the health check, then the
/// fixed default.
pub(crate) fn effective_timeout(spec: &ServiceSpec, opts: &DeployOptions) -> Duration {
    if let Some(timeout) = opts.timeout {
        if timeout > Duration::ZERO {
            return timeout;
        }
    }
    if let Some(hc) = &spec.health_check {
        return hc.timeout() * (hc.retries + 2);
    }
    DEFAULT_DEPLOY_TIMEOUT
}

fn hook_ctx(
    spec: &ServiceSpec,
    node: &str,
    image_from: &str,
    image_to: &str,
    dry_run: bool,
) -> HookContext {
    HookContext {
        service: Some(spec.clone()),
        node: Some(node.to_string()),
        image_from: image_from.to_string(),
        image_to: image_to.to_string(),
        dry_run,
        metadata: Default::default(),
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
