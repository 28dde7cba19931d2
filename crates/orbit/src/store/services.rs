//! Per-service runtime state, keyed by `(node, service)`.

use chrono::{DateTime, Utc};
use common::api::{ServiceState, ServiceStatus};
use sqlx::FromRow;

use super::Db;
use crate::error::{ErrorKind, OrbitError};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
struct ServiceStateRow {
    node: String,
    service: String,
    container_id: String,
    image: String,
    status: String,
    replicas: i64,
    started_at: DateTime<Utc>,
}

impl ServiceStateRow {
    fn into_state(self) -> Result<ServiceState> {
        let status = self
            .status
            .parse::<ServiceStatus>()
            .map_err(|err| OrbitError::msg(ErrorKind::StateRead, "state.decode_service", err))?;
        Ok(ServiceState {
            name: self.service,
            container_id: self.container_id,
            image: self.image,
            status,
            replicas: self.replicas.max(0) as u32,
            node: self.node,
            started_at: self.started_at,
        })
    }
}

const STATE_COLUMNS: &str = r#"
    node,
    service,
    container_id,
    image,
    status,
    replicas,
    started_at
"#;

/// Upserts the runtime state of a service on a node.
pub async fn put_service_state(db: &Db, state: &ServiceState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO service_states (
            node,
            service,
            container_id,
            image,
            status,
            replicas,
            started_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(node, service) DO UPDATE SET
            container_id = excluded.container_id,
            image = excluded.image,
            status = excluded.status,
            replicas = excluded.replicas,
            started_at = excluded.started_at
        "#,
    )
    .bind(&state.node)
    .bind(&state.name)
    .bind(&state.container_id)
    .bind(&state.image)
    .bind(state.status.as_str())
    .bind(i64::from(state.replicas))
    .bind(state.started_at)
    .execute(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateWrite, "state.put_service_state", err)
            .with_resource(format!("{}/{}", state.node, state.name))
    })?;

    Ok(())
}

/// Retrieves the state of a service on a node; `None` when never deployed.
pub async fn get_service_state(db: &Db, node: &str, service: &str) -> Result<Option<ServiceState>> {
    let row = sqlx::query_as::<_, ServiceStateRow>(&format!(
        "SELECT {STATE_COLUMNS} FROM service_states WHERE node = ?1 AND service = ?2"
    ))
    .bind(node)
    .bind(service)
    .fetch_optional(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateRead, "state.get_service_state", err)
            .with_resource(format!("{node}/{service}"))
    })?;

    row.map(ServiceStateRow::into_state).transpose()
}

/// Lists service states, optionally filtered by node.
pub async fn list_service_states(db: &Db, node: Option<&str>) -> Result<Vec<ServiceState>> {
    let rows = sqlx::query_as::<_, ServiceStateRow>(&format!(
        r#"
        SELECT {STATE_COLUMNS}
        FROM service_states
        WHERE ?1 IS NULL OR node = ?1
        ORDER BY node ASC, service ASC
        "#
    ))
    .bind(node)
    .fetch_all(db)
    .await
    .map_err(|err| OrbitError::new(ErrorKind::StateRead, "state.list_service_states", err))?;

    rows.into_iter().map(ServiceStateRow::into_state).collect()
}

/// Removes the state of a service on a node after an explicit stop+remove.
pub async fn delete_service_state(db: &Db, node: &str, service: &str) -> Result<()> {
    sqlx::query("DELETE FROM service_states WHERE node = ?1 AND service = ?2")
        .bind(node)
        .bind(service)
        .execute(db)
        .await
        .map_err(|err| {
            OrbitError::new(ErrorKind::StateWrite, "state.delete_service_state", err)
                .with_resource(format!("{node}/{service}"))
        })?;
    Ok(())
}
