//! Persistent state store backed by a single SQLite file.
//!
//! Three tables mirror the three logical buckets: `nodes`, `service_states`,
//! and `deployments`. The file is opened with `locking_mode=EXCLUSIVE` and a
//! single connection, so one Orbit process owns the store for its lifetime; a
//! second opener fails within the busy timeout.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::SqlitePool;

use crate::error::{ErrorKind, OrbitError};
use crate::Result;

pub mod deployments;
pub mod nodes;
pub mod services;

/// Handle to the state database.
pub type Db = SqlitePool;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Bounded wait before a second opener gives up on the exclusive file lock.
const OPEN_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens (or creates) the state database at the given path.
pub async fn open(path: &Path) -> Result<Db> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Truncate)
        .locking_mode(SqliteLockingMode::Exclusive)
        .busy_timeout(OPEN_BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .map_err(|err| {
            OrbitError::new(ErrorKind::StateRead, "state.open", err)
                .with_resource(path.display().to_string())
        })?;

    // Running migrations writes immediately, which takes the exclusive lock
    // for the process lifetime and makes a concurrent opener fail fast.
    MIGRATOR.run(&pool).await.map_err(|err| {
        OrbitError::new(ErrorKind::StateWrite, "state.migrate", err)
            .with_resource(path.display().to_string())
    })?;

    Ok(pool)
}

/// Closes the database and releases the file lock.
pub async fn close(db: &Db) {
    db.close().await;
}
