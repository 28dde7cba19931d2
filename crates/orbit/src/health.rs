//! Multi-protocol health probes for services.

use std::time::Duration;

use anyhow::{bail, Context};
use common::api::{ProbeKind, ServiceSpec, ServiceStatus};
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// Maximum redirects followed by the http probe.
const MAX_REDIRECTS: usize = 5;

/// Dispatches health probes for a service spec.
#[derive(Clone)]
pub struct Checker {
    client: Client,
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker {
    /// Builds a checker with a shared http client.
    ///
    /// Panics if the TLS backend cannot be initialised, matching
    /// `reqwest::Client::new`.
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent("orbit-health/1.0")
            .build()
            .expect("failed to build health probe http client");
        Self { client }
    }

    /// Performs a single probe; `Ok(())` means healthy. A service without a
    /// health check is assumed healthy.
    pub async fn check(&self, spec: &ServiceSpec, _container_id: &str) -> anyhow::Result<()> {
        let Some(hc) = &spec.health_check else {
            return Ok(());
        };

        match hc.kind {
            ProbeKind::Http => {
                check_http(&self.client, &hc.url, hc.expected_code, hc.timeout()).await
            }
            ProbeKind::Tcp => check_tcp("localhost", hc.port, hc.timeout()).await,
            ProbeKind::Cmd => check_cmd(&hc.command, hc.timeout()).await,
        }
    }

    /// Polls the probe until it passes, making `retries + 1` attempts with a
    /// sleep of `interval` between attempts (not before the first).
    pub async fn wait_healthy(&self, spec: &ServiceSpec, container_id: &str) -> anyhow::Result<()> {
        let Some(hc) = &spec.health_check else {
            return Ok(());
        };
        let interval = hc.interval();
        let retries = hc.retries;

        let mut last_err = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                time::sleep(interval).await;
            }

            match self.check(spec, container_id).await {
                Ok(()) => {
                    info!(service = %spec.name, attempt = attempt + 1, "health check passed");
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        service = %spec.name,
                        attempt = attempt + 1,
                        of = retries + 1,
                        %err,
                        "health check attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        let cause = last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made"));
        bail!("health check failed after {} attempts: {cause}", retries + 1)
    }

    /// One-off probe mapped to a service status.
    pub async fn probe(&self, spec: &ServiceSpec, container_id: &str) -> ServiceStatus {
        match self.check(spec, container_id).await {
            Ok(()) => ServiceStatus::Healthy,
            Err(err) => {
                debug!(service = %spec.name, %err, "health probe unhealthy");
                ServiceStatus::Unhealthy
            }
        }
    }
}

/// HTTP GET against `url`; when `expected_code` is 0 any 2xx passes.
async fn check_http(
    client: &Client,
    url: &str,
    expected_code: u16,
    timeout: Duration,
) -> anyhow::Result<()> {
    if url.is_empty() {
        bail!("http health check: url is required");
    }

    let response = time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| anyhow::anyhow!("http get {url:?} timed out after {timeout:?}"))?
        .with_context(|| format!("http get {url:?}"))?;

    let status = response.status().as_u16();
    if expected_code != 0 {
        if status != expected_code {
            bail!("expected status {expected_code}, got {status}");
        }
    } else if !(200..300).contains(&status) {
        bail!("non-2xx status: {status}");
    }
    Ok(())
}

/// TCP dial against `host:port`; an established connection passes.
async fn check_tcp(host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
    if port == 0 {
        bail!("tcp health check: port is required");
    }

    let addr = format!("{host}:{port}");
    let stream = time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow::anyhow!("tcp dial {addr:?} timed out after {timeout:?}"))?
        .with_context(|| format!("tcp dial {addr:?}"))?;
    drop(stream);
    Ok(())
}

/// Local shell command; exit status 0 passes.
async fn check_cmd(command: &str, timeout: Duration) -> anyhow::Result<()> {
    if command.is_empty() {
        bail!("cmd health check: command is required");
    }

    let output = time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("cmd probe {command:?} timed out after {timeout:?}"))?
    .with_context(|| format!("cmd probe {command:?}"))?;

    if !output.status.success() {
        bail!(
            "cmd probe {command:?} exited non-zero: {} (output: {})",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::api::HealthCheckSpec;
    use httpmock::Method::GET;
    use httpmock::MockServer;

    fn http_spec(url: String, retries: u32, expected_code: u16) -> ServiceSpec {
        ServiceSpec {
            name: "web".into(),
            image: "nginx:1.24".into(),
            ports: vec![],
            environment: Default::default(),
            labels: Default::default(),
            volumes: vec![],
            user: None,
            restart_policy: None,
            health_check: Some(HealthCheckSpec {
                kind: ProbeKind::Http,
                url,
                port: 0,
                command: String::new(),
                timeout_secs: 2,
                interval_secs: 0,
                retries,
                expected_code,
            }),
            proxy: None,
            deploy: None,
        }
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx_by_default() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(204);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 0, 0);
        checker.check(&spec, "c-1").await.expect("healthy");
    }

    #[tokio::test]
    async fn http_probe_requires_exact_code_when_set() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(204);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 0, 200);
        let err = checker.check(&spec, "c-1").await.expect_err("wrong code");
        assert!(err.to_string().contains("expected status 200"));

        let spec = http_spec(server.url("/healthz"), 0, 204);
        checker.check(&spec, "c-1").await.expect("exact match");
    }

    #[tokio::test]
    async fn http_probe_rejects_5xx() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 0, 0);
        let err = checker.check(&spec, "c-1").await.expect_err("unhealthy");
        assert!(err.to_string().contains("non-2xx status: 500"));
    }

    #[tokio::test]
    async fn wait_healthy_makes_exactly_one_attempt_with_zero_retries() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 0, 0);
        let err = checker.wait_healthy(&spec, "c-1").await.expect_err("fails");
        assert!(err.to_string().contains("after 1 attempts"));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn wait_healthy_makes_n_plus_one_attempts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 2, 0);
        let err = checker.wait_healthy(&spec, "c-1").await.expect_err("fails");
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(mock.hits(), 3);
    }

    #[tokio::test]
    async fn wait_healthy_recovers_mid_sequence() {
        let server = MockServer::start();
        let mut fail = server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });

        let checker = Checker::new();
        let spec = http_spec(server.url("/healthz"), 5, 0);

        let handle = tokio::spawn({
            let checker = checker.clone();
            let spec = spec.clone();
            async move { checker.wait_healthy(&spec, "c-1").await }
        });

        // Flip the endpoint to healthy after the first attempt lands.
        while fail.hits() == 0 {
            time::sleep(Duration::from_millis(5)).await;
        }
        fail.delete();
        server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(200);
        });

        handle.await.expect("join").expect("eventually healthy");
    }

    #[tokio::test]
    async fn cancellation_stops_wait_healthy_promptly() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });

        let checker = Checker::new();
        let mut spec = http_spec(server.url("/healthz"), 50, 0);
        if let Some(hc) = spec.health_check.as_mut() {
            hc.interval_secs = 1;
        }

        let result = time::timeout(Duration::from_millis(300), checker.wait_healthy(&spec, "c-1"))
            .await;
        assert!(result.is_err(), "outer deadline should fire first");
        assert_eq!(mock.hits(), 1, "no attempts after cancellation");
    }

    #[tokio::test]
    async fn tcp_probe_connects_and_rejects_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        check_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .expect("open port");

        drop(listener);
        let err = check_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .expect_err("closed port");
        assert!(err.to_string().contains("tcp dial"));

        let err = check_tcp("127.0.0.1", 0, Duration::from_secs(1))
            .await
            .expect_err("missing port");
        assert!(err.to_string().contains("port is required"));
    }

    #[tokio::test]
    async fn cmd_probe_maps_exit_status() {
        check_cmd("true", Duration::from_secs(2)).await.expect("ok");

        let err = check_cmd("exit 3", Duration::from_secs(2))
            .await
            .expect_err("non-zero");
        assert!(err.to_string().contains("exited non-zero"));

        let err = check_cmd("", Duration::from_secs(2))
            .await
            .expect_err("empty command");
        assert!(err.to_string().contains("command is required"));
    }

    #[tokio::test]
    async fn probe_maps_to_service_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/ok");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(GET).path("/bad");
            then.status(503);
        });

        let checker = Checker::new();
        assert_eq!(
            checker.probe(&http_spec(server.url("/ok"), 0, 0), "c").await,
            ServiceStatus::Healthy
        );
        assert_eq!(
            checker.probe(&http_spec(server.url("/bad"), 0, 0), "c").await,
            ServiceStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn missing_health_check_is_healthy() {
        let checker = Checker::new();
        let mut spec = http_spec("http://unused/".into(), 0, 0);
        spec.health_check = None;
        checker.check(&spec, "c").await.expect("assumed healthy");
        checker.wait_healthy(&spec, "c").await.expect("assumed healthy");
    }
}
