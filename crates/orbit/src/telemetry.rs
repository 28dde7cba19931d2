//! Tracing initialisation and metrics recording helpers.

use std::fs::OpenOptions;
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Installs the global tracing subscriber according to the logging policy.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// is a no-op.
pub fn init_tracing(cfg: &LogConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);

    match &cfg.file {
        Some(path) => {
            let file = Arc::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        anyhow::anyhow!("failed to open log file {}: {err}", path.display())
                    })?,
            );
            match cfg.format {
                LogFormat::Json => {
                    let _ = registry.with(fmt::layer().json().with_writer(file)).try_init();
                }
                LogFormat::Text => {
                    let _ = registry
                        .with(fmt::layer().with_ansi(false).with_writer(file))
                        .try_init();
                }
            }
        }
        None => match cfg.format {
            LogFormat::Json => {
                let _ = registry.with(fmt::layer().json()).try_init();
            }
            LogFormat::Text => {
                let _ = registry.with(fmt::layer()).try_init();
            }
        },
    }

    Ok(())
}

/// Counts terminal deployment outcomes by result.
pub fn record_deploy_result(result: &str) {
    counter!(
        "orbit_deployments_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Counts heartbeat probe outcomes.
pub fn record_heartbeat_probe(result: &str) {
    counter!(
        "orbit_heartbeat_probes_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Tracks the number of nodes with an active heartbeat task.
pub fn record_nodes_watched(count: usize) {
    gauge!("orbit_nodes_watched").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_accepts_file_sink_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = LogConfig {
            level: "debug".into(),
            format: LogFormat::Json,
            file: Some(dir.path().join("orbit.log")),
        };

        init_tracing(&cfg).expect("first init");
        init_tracing(&cfg).expect("second init is a no-op");
        assert!(dir.path().join("orbit.log").exists());
    }

    #[test]
    fn init_tracing_reports_unwritable_file() {
        let cfg = LogConfig {
            level: "info".into(),
            format: LogFormat::Text,
            file: Some("/nonexistent-dir/orbit.log".into()),
        };
        let err = init_tracing(&cfg).expect_err("should fail");
        assert!(err.to_string().contains("failed to open log file"));
    }

    #[test]
    fn metric_helpers_do_not_panic_without_recorder() {
        record_deploy_result("success");
        record_heartbeat_probe("miss");
        record_nodes_watched(3);
    }
}
