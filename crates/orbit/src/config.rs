//! Layered configuration loader.
//!
//! Merge order, lowest to highest precedence: built-in defaults, the global
//! file at `$HOME/.orbit/config.yaml`, the project `orbit.yaml` (auto-discovered
//! by walking upward from the working directory, or an explicit path), and
//! `ORBIT_*` environment variables. `${VAR}` placeholders in string fields are
//! resolved from the process environment after decoding.

use std::env;
use std::path::{Path, PathBuf};

use common::api::{NodeSpec, ServiceSpec};
use serde::Deserialize;

use crate::error::{ErrorKind, OrbitError};
use crate::Result;

/// Project manifest file name discovered by walking upward.
pub const PROJECT_FILE: &str = "orbit.yaml";

/// Fully decoded configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Schema version; must be `"1"`.
    pub version: String,
    /// Project metadata.
    #[serde(default)]
    pub project: ProjectConfig,
    /// Remote nodes.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Services.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Reverse-proxy settings, consumed by the proxy emitter.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// ACME settings, consumed by the certificate manager.
    #[serde(default)]
    pub ssl: SslConfig,
    /// Logging policy.
    #[serde(default)]
    pub log: LogConfig,
}

/// Project-level metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Project name.
    #[serde(default)]
    pub name: String,
    /// Deployment environment label.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            environment: default_environment(),
        }
    }
}

/// Reverse-proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Proxy backend: `nginx` or `caddy`.
    #[serde(default = "default_proxy_backend")]
    pub backend: String,
    /// Output path for the generated proxy configuration.
    #[serde(default)]
    pub config_path: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend: default_proxy_backend(),
            config_path: None,
        }
    }
}

/// ACME settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    /// ACME directory URL.
    #[serde(default = "default_acme_url")]
    pub acme_url: String,
    /// Account email for certificate issuance.
    #[serde(default)]
    pub email: String,
    /// Directory where issued certificates are stored.
    #[serde(default)]
    pub cert_dir: Option<String>,
    /// Renew when expiry is closer than this many days.
    #[serde(default)]
    pub renew_days: u32,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            acme_url: default_acme_url(),
            email: String::new(),
            cert_dir: None,
            renew_days: 0,
        }
    }
}

/// Log rendering format.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    Text,
    /// Structured JSON lines.
    Json,
}

/// Logging policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Minimum level: debug, info, warn, or error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Rendering format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Optional log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_environment() -> String {
    "development".into()
}

fn default_proxy_backend() -> String {
    "nginx".into()
}

fn default_acme_url() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

// (ENV_NAME, config key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ORBIT_PROJECT_NAME", "project.name"),
    ("ORBIT_PROJECT_ENVIRONMENT", "project.environment"),
    ("ORBIT_LOG_LEVEL", "log.level"),
    ("ORBIT_LOG_FORMAT", "log.format"),
    ("ORBIT_LOG_FILE", "log.file"),
    ("ORBIT_PROXY_BACKEND", "proxy.backend"),
    ("ORBIT_PROXY_CONFIG_PATH", "proxy.config_path"),
    ("ORBIT_SSL_ACME_URL", "ssl.acme_url"),
    ("ORBIT_SSL_EMAIL", "ssl.email"),
    ("ORBIT_SSL_CERT_DIR", "ssl.cert_dir"),
    ("ORBIT_SSL_RENEW_DAYS", "ssl.renew_days"),
];

impl From<config::ConfigError> for OrbitError {
    fn from(err: config::ConfigError) -> Self {
        OrbitError::new(ErrorKind::Config, "config.load", err)
    }
}

/// Loads the merged configuration, discovering the project file when no
/// explicit path is given.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder().set_default("version", "1")?;

    let global = orbit_home().join("config.yaml");
    if global.is_file() {
        builder = builder.add_source(config::File::from(global));
    }

    let project = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => env::current_dir()
            .ok()
            .and_then(|cwd| discover_project_file(&cwd)),
    };
    if let Some(path) = project {
        builder = builder.add_source(config::File::from(path).required(explicit.is_some()));
    }

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let mut cfg: Config = builder.build()?.try_deserialize()?;
    expand_env(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

impl Config {
    /// Returns the service spec with the given name, if configured.
    pub fn service_by_name(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|svc| svc.name == name)
    }

    /// Returns the node spec with the given name, if configured.
    pub fn node_by_name(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

/// Returns the Orbit home directory (`~/.orbit`).
pub fn orbit_home() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".orbit"),
        None => PathBuf::from(".orbit"),
    }
}

/// Default location of the state database.
pub fn state_db_path() -> PathBuf {
    orbit_home().join("state.db")
}

/// Walks upward from `start` looking for the project manifest.
fn discover_project_file(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        let candidate = dir.join(PROJECT_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
}

/// Resolves `${VAR}` placeholders in string fields that commonly carry
/// secrets. Unset variables expand to the empty string.
fn expand_env(cfg: &mut Config) {
    for service in &mut cfg.services {
        for value in service.environment.values_mut() {
            *value = expand_placeholders(value);
        }
    }
    cfg.ssl.email = expand_placeholders(&cfg.ssl.email);
}

fn expand_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Matches `^[a-z0-9][a-z0-9-]{0,62}$`.
pub fn is_valid_service_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Matches a DNS label: alphanumeric ends, hyphens inside, at most 63 chars.
pub fn is_valid_node_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn validate(cfg: &Config) -> Result<()> {
    let invalid = |message: String| OrbitError::msg(ErrorKind::Validation, "config.validate", message);

    if cfg.version != "1" {
        return Err(invalid(format!(
            "unsupported config version {:?}; expected \"1\"",
            cfg.version
        )));
    }

    match cfg.log.level.as_str() {
        "debug" | "info" | "warn" | "error" => {}
        other => return Err(invalid(format!("unknown log level {other:?}"))),
    }

    match cfg.proxy.backend.as_str() {
        "nginx" | "caddy" => {}
        other => return Err(invalid(format!("unsupported proxy backend {other:?}"))),
    }

    let mut seen = std::collections::HashSet::new();
    for service in &cfg.services {
        if service.name.is_empty() {
            return Err(invalid("service with empty name is not allowed".into()));
        }
        if !is_valid_service_name(&service.name) {
            return Err(invalid(format!("invalid service name {:?}", service.name)));
        }
        if !seen.insert(service.name.as_str()) {
            return Err(invalid(format!("duplicate service name {:?}", service.name)));
        }
        if service.image.is_empty() {
            return Err(invalid(format!(
                "service {:?}: image is required",
                service.name
            )));
        }
    }

    let mut seen_nodes = std::collections::HashSet::new();
    for node in &cfg.nodes {
        if !is_valid_node_name(&node.name) {
            return Err(invalid(format!("invalid node name {:?}", node.name)));
        }
        if !seen_nodes.insert(node.name.as_str()) {
            return Err(invalid(format!("duplicate node name {:?}", node.name)));
        }
        if node.host.is_empty() {
            return Err(invalid(format!("node {:?}: host is required", node.name)));
        }
    }

    Ok(())
}
