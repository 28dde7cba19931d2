//! In-process lifecycle hook registry.
//!
//! Callables register at program start and fire at fixed lifecycle points.
//! Hook errors are logged and never abort the operation that fired them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use common::api::ServiceSpec;
use tracing::warn;

/// A callable registered for a lifecycle point.
pub type HookFn = Arc<dyn Fn(&HookContext) -> anyhow::Result<()> + Send + Sync>;

/// Lifecycle points at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before a deploy mutates anything.
    PreDeploy,
    /// After a deploy promoted the new container.
    PostDeploy,
    /// Before a scale operation.
    PreScale,
    /// After a scale operation.
    PostScale,
    /// After a new transport was dialed.
    NodeConnect,
    /// After a transport was released.
    NodeDisconnect,
    /// Fired by the certificate manager on renewal.
    SslRenew,
}

impl HookPoint {
    /// Canonical hook name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreDeploy => "pre-deploy",
            HookPoint::PostDeploy => "post-deploy",
            HookPoint::PreScale => "pre-scale",
            HookPoint::PostScale => "post-scale",
            HookPoint::NodeConnect => "node-connect",
            HookPoint::NodeDisconnect => "node-disconnect",
            HookPoint::SslRenew => "ssl-renew",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contextual data passed to hooks.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Service involved, when applicable.
    pub service: Option<ServiceSpec>,
    /// Node name involved, when applicable.
    pub node: Option<String>,
    /// Image being replaced; empty on first deploy.
    pub image_from: String,
    /// Image being rolled out.
    pub image_to: String,
    /// Whether the operation is a dry run.
    pub dry_run: bool,
    /// Free-form extension data.
    pub metadata: HashMap<String, String>,
}

/// Registry of named hooks per lifecycle point.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookPoint, Vec<(String, HookFn)>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named hook at a lifecycle point. Hooks fire in
    /// registration order.
    pub fn register(&self, point: HookPoint, name: impl Into<String>, hook: HookFn) {
        let mut hooks = self.hooks.write().unwrap_or_else(|err| err.into_inner());
        hooks.entry(point).or_default().push((name.into(), hook));
    }

    /// Fires all hooks registered at a point. Errors are logged; later hooks
    /// still run.
    pub fn fire(&self, point: HookPoint, ctx: &HookContext) {
        let hooks: Vec<(String, HookFn)> = {
            let map = self.hooks.read().unwrap_or_else(|err| err.into_inner());
            map.get(&point).cloned().unwrap_or_default()
        };

        for (name, hook) in hooks {
            if let Err(err) = hook(ctx) {
                warn!(hook = %point, name = %name, ?err, "hook returned error");
            }
        }
    }

    /// Names of hooks registered at a point, in firing order.
    pub fn names(&self, point: HookPoint) -> Vec<String> {
        let map = self.hooks.read().unwrap_or_else(|err| err.into_inner());
        map.get(&point)
            .map(|hooks| hooks.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }
}
