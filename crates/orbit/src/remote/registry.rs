//! Node registry: CRUD and trust operations backed by the store.

use common::api::{NodeInfo, NodeSpec, NodeStatus};

use crate::error::{ErrorKind, OrbitError};
use crate::store::{self, Db};
use crate::Result;

/// Node-specific store operations.
pub struct Registry {
    db: Db,
}

impl Registry {
    /// Wraps the store handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Registers a new node. The record starts offline with a zero fail
    /// counter regardless of the caller's view.
    pub async fn add(&self, spec: NodeSpec) -> Result<NodeInfo> {
        if store::nodes::get_node(&self.db, &spec.name).await?.is_some() {
            return Err(OrbitError::msg(
                ErrorKind::Validation,
                "registry.add",
                format!("node {:?} already registered", spec.name),
            )
            .with_resource(spec.name.clone())
            .with_advice("Remove the existing node first"));
        }

        let info = NodeInfo::new(spec);
        store::nodes::put_node(&self.db, &info).await?;
        Ok(info)
    }

    /// Removes a node from the registry.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.get(name).await?;
        store::nodes::delete_node(&self.db, name).await
    }

    /// Returns the record for a registered node.
    pub async fn get(&self, name: &str) -> Result<NodeInfo> {
        store::nodes::get_node(&self.db, name).await?.ok_or_else(|| {
            OrbitError::msg(
                ErrorKind::NodeNotFound,
                "registry.get",
                format!("node {name:?} not registered"),
            )
            .with_resource(name.to_string())
            .with_advice("Register the node before using it")
        })
    }

    /// Lists all registered nodes.
    pub async fn list(&self) -> Result<Vec<NodeInfo>> {
        store::nodes::list_nodes(&self.db).await
    }

    /// Records the host key for a node, enabling strict verification on
    /// subsequent dials. Both the fingerprint and the encoded key are
    /// required.
    pub async fn trust(&self, name: &str, fingerprint: &str, host_key: &str) -> Result<()> {
        if fingerprint.is_empty() || host_key.is_empty() {
            return Err(OrbitError::msg(
                ErrorKind::Validation,
                "registry.trust",
                "fingerprint and host key are both required",
            )
            .with_resource(name.to_string()));
        }

        let mut info = self.get(name).await?;
        info.key_fingerprint = fingerprint.to_string();
        info.host_key = host_key.to_string();
        info.host_key_known = true;
        store::nodes::put_node(&self.db, &info).await
    }

    /// Marks a node online and resets its fail counter.
    pub async fn mark_online(&self, name: &str) -> Result<()> {
        store::nodes::update_node_status(&self.db, name, NodeStatus::Online, 0).await
    }

    /// Records a heartbeat miss, deriving the status from the counter.
    pub async fn mark_offline(&self, name: &str, fail_count: u32) -> Result<()> {
        let status = NodeStatus::from_fail_count(fail_count.max(1));
        store::nodes::update_node_status(&self.db, name, status, fail_count).await
    }
}
