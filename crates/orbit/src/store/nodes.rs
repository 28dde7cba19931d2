//! Node registry records.

use chrono::{DateTime, Utc};
use common::api::{NodeInfo, NodeSpec, NodeStatus};
use sqlx::types::Json;
use sqlx::FromRow;

use super::Db;
use crate::error::{ErrorKind, OrbitError};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
struct NodeRow {
    #[sqlx(rename = "spec_json")]
    spec: Json<NodeSpec>,
    status: String,
    last_seen: DateTime<Utc>,
    key_fingerprint: String,
    host_key: String,
    host_key_known: bool,
    fail_count: i64,
}

impl NodeRow {
    fn into_info(self) -> Result<NodeInfo> {
        let status = self
            .status
            .parse::<NodeStatus>()
            .map_err(|err| OrbitError::msg(ErrorKind::StateRead, "state.decode_node", err))?;
        Ok(NodeInfo {
            spec: self.spec.0,
            status,
            last_seen: self.last_seen,
            key_fingerprint: self.key_fingerprint,
            host_key: self.host_key,
            host_key_known: self.host_key_known,
            fail_count: self.fail_count.max(0) as u32,
        })
    }
}

const NODE_COLUMNS: &str = r#"
    spec_json,
    status,
    last_seen,
    key_fingerprint,
    host_key,
    host_key_known,
    fail_count
"#;

/// Upserts a node record.
pub async fn put_node(db: &Db, info: &NodeInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO nodes (
            name,
            spec_json,
            status,
            last_seen,
            key_fingerprint,
            host_key,
            host_key_known,
            fail_count
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(name) DO UPDATE SET
            spec_json = excluded.spec_json,
            status = excluded.status,
            last_seen = excluded.last_seen,
            key_fingerprint = excluded.key_fingerprint,
            host_key = excluded.host_key,
            host_key_known = excluded.host_key_known,
            fail_count = excluded.fail_count
        "#,
    )
    .bind(&info.spec.name)
    .bind(Json(&info.spec))
    .bind(info.status.as_str())
    .bind(info.last_seen)
    .bind(&info.key_fingerprint)
    .bind(&info.host_key)
    .bind(info.host_key_known)
    .bind(i64::from(info.fail_count))
    .execute(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateWrite, "state.put_node", err)
            .with_resource(info.spec.name.clone())
    })?;

    Ok(())
}

/// Retrieves a node by name; `None` when not registered.
pub async fn get_node(db: &Db, name: &str) -> Result<Option<NodeInfo>> {
    let row = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateRead, "state.get_node", err).with_resource(name.to_string())
    })?;

    row.map(NodeRow::into_info).transpose()
}

/// Removes a node record.
pub async fn delete_node(db: &Db, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM nodes WHERE name = ?1")
        .bind(name)
        .execute(db)
        .await
        .map_err(|err| {
            OrbitError::new(ErrorKind::StateWrite, "state.delete_node", err)
                .with_resource(name.to_string())
        })?;
    Ok(())
}

/// Lists all registered nodes.
pub async fn list_nodes(db: &Db) -> Result<Vec<NodeInfo>> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes ORDER BY name ASC"
    ))
    .fetch_all(db)
    .await
    .map_err(|err| OrbitError::new(ErrorKind::StateRead, "state.list_nodes", err))?;

    rows.into_iter().map(NodeRow::into_info).collect()
}

/// Atomically overwrites only the status, last-seen, and fail-count fields.
pub async fn update_node_status(
    db: &Db,
    name: &str,
    status: NodeStatus,
    fail_count: u32,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET status = ?2, last_seen = ?3, fail_count = ?4
        WHERE name = ?1
        "#,
    )
    .bind(name)
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(i64::from(fail_count))
    .execute(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateWrite, "state.update_node_status", err)
            .with_resource(name.to_string())
    })?;

    if result.rows_affected() == 0 {
        return Err(OrbitError::msg(
            ErrorKind::NodeNotFound,
            "state.update_node_status",
            format!("node {name:?} not found"),
        )
        .with_resource(name.to_string()));
    }

    Ok(())
}
