//! Append-only deployment audit history.

use chrono::{DateTime, Utc};
use common::api::{DeployResult, DeploymentRecord};
use sqlx::FromRow;

use super::Db;
use crate::error::{ErrorKind, OrbitError};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
struct DeploymentRow {
    id: String,
    service: String,
    node: String,
    from_image: String,
    to_image: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: i64,
    result: String,
    error: Option<String>,
}

impl DeploymentRow {
    fn into_record(self) -> Result<DeploymentRecord> {
        let result = self
            .result
            .parse::<DeployResult>()
            .map_err(|err| OrbitError::msg(ErrorKind::StateRead, "state.decode_deployment", err))?;
        Ok(DeploymentRecord {
            id: self.id,
            service: self.service,
            node: self.node,
            from_image: self.from_image,
            to_image: self.to_image,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            result,
            error: self.error,
        })
    }
}

const DEPLOYMENT_COLUMNS: &str = r#"
    id,
    service,
    node,
    from_image,
    to_image,
    started_at,
    completed_at,
    duration_ms,
    result,
    error
"#;

/// Appends a deployment record. Records are immutable; an id collision is an
/// error rather than an overwrite.
pub async fn put_deployment(db: &Db, record: &DeploymentRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deployments (
            id,
            service,
            node,
            from_image,
            to_image,
            started_at,
            completed_at,
            duration_ms,
            result,
            error
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&record.id)
    .bind(&record.service)
    .bind(&record.node)
    .bind(&record.from_image)
    .bind(&record.to_image)
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_ms)
    .bind(record.result.as_str())
    .bind(&record.error)
    .execute(db)
    .await
    .map_err(|err| {
        OrbitError::new(ErrorKind::StateWrite, "state.put_deployment", err)
            .with_resource(record.service.clone())
    })?;

    Ok(())
}

/// Lists deployment records in start-time order, optionally filtered by
/// service name.
pub async fn list_deployments(db: &Db, service: Option<&str>) -> Result<Vec<DeploymentRecord>> {
    let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        SELECT {DEPLOYMENT_COLUMNS}
        FROM deployments
        WHERE ?1 IS NULL OR service = ?1
        ORDER BY started_at ASC, id ASC
        "#
    ))
    .bind(service)
    .fetch_all(db)
    .await
    .map_err(|err| OrbitError::new(ErrorKind::StateRead, "state.list_deployments", err))?;

    rows.into_iter().map(DeploymentRow::into_record).collect()
}
