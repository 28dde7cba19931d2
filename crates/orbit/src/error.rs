//! Structured errors with machine-parseable codes.
//!
//! Every error names the operation chain that produced it, optionally the
//! resource involved, and optionally a remediation hint shown to operators.

use std::fmt;

/// Machine-parseable error identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unclassified internal failure.
    Internal,
    /// Configuration could not be loaded or decoded.
    Config,
    /// Configuration was loaded but is semantically invalid.
    Validation,
    /// Node is not present in the registry.
    NodeNotFound,
    /// Transport to the node could not be established or used.
    NodeConnect,
    /// Node operation exceeded its deadline.
    NodeTimeout,
    /// Presented host key does not match the trusted fingerprint.
    NodeKeyMismatch,
    /// Host key is not trusted yet.
    NodeUnknownKey,
    /// Service is not present in the configuration or store.
    ServiceNotFound,
    /// Service container failed to start.
    ServiceStart,
    /// Service container failed to stop.
    ServiceStop,
    /// Health gate failed during a deploy.
    ServiceHealthFail,
    /// Rollback to the prior image failed.
    ServiceRollback,
    /// Container engine is unreachable.
    RuntimeConnect,
    /// Image pull failed.
    RuntimePull,
    /// Container create/start failed.
    RuntimeRun,
    /// Container removal failed.
    RuntimeRemove,
    /// Container inspection failed.
    RuntimeInspect,
    /// Store read failed.
    StateRead,
    /// Store write failed.
    StateWrite,
}

impl ErrorKind {
    /// Stable code identifier rendered in user-facing and structured output.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Internal => "ERR-001",
            ErrorKind::Config => "ERR-002",
            ErrorKind::Validation => "ERR-003",
            ErrorKind::NodeNotFound => "ERR-NODE-001",
            ErrorKind::NodeConnect => "ERR-NODE-002",
            ErrorKind::NodeTimeout => "ERR-NODE-003",
            ErrorKind::NodeKeyMismatch => "ERR-NODE-004",
            ErrorKind::NodeUnknownKey => "ERR-NODE-005",
            ErrorKind::ServiceNotFound => "ERR-SVC-001",
            ErrorKind::ServiceStart => "ERR-SVC-002",
            ErrorKind::ServiceStop => "ERR-SVC-003",
            ErrorKind::ServiceHealthFail => "ERR-SVC-004",
            ErrorKind::ServiceRollback => "ERR-SVC-005",
            ErrorKind::RuntimeConnect => "ERR-RUNTIME-001",
            ErrorKind::RuntimePull => "ERR-RUNTIME-002",
            ErrorKind::RuntimeRun => "ERR-RUNTIME-003",
            ErrorKind::RuntimeRemove => "ERR-RUNTIME-004",
            ErrorKind::RuntimeInspect => "ERR-RUNTIME-005",
            ErrorKind::StateRead => "ERR-STATE-001",
            ErrorKind::StateWrite => "ERR-STATE-002",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Standard structured error used across all Orbit components.
#[derive(Debug)]
pub struct OrbitError {
    /// Machine-parseable classification.
    pub kind: ErrorKind,
    /// Operation chain, e.g. `deploy.healthcheck`.
    pub op: String,
    /// Resource identifier (node name, service name, path).
    pub resource: Option<String>,
    /// Wrapped upstream error.
    pub cause: Option<anyhow::Error>,
    /// Human-readable remediation hint.
    pub advice: Option<String>,
}

/// Crate-wide result alias.
pub type Result<T, E = OrbitError> = std::result::Result<T, E>;

impl OrbitError {
    /// Wraps an upstream error at an operation boundary.
    pub fn new(kind: ErrorKind, op: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            op: op.into(),
            resource: None,
            cause: Some(cause.into()),
            advice: None,
        }
    }

    /// Builds an error from a plain message instead of an upstream cause.
    pub fn msg(kind: ErrorKind, op: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            kind,
            op: op.into(),
            resource: None,
            cause: Some(anyhow::anyhow!("{message}")),
            advice: None,
        }
    }

    /// Sets the resource identifier.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Sets the remediation hint.
    pub fn with_advice(mut self, advice: impl Into<String>) -> Self {
        self.advice = Some(advice.into());
        self
    }

    /// Reports whether the error carries the given kind.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Formatted user-facing message including the remediation hint.
    pub fn user_message(&self) -> String {
        let mut msg = format!("{}: {}", self.kind.code(), self.op);
        if let Some(resource) = &self.resource {
            msg.push_str(&format!(" (resource: {resource})"));
        }
        if let Some(advice) = &self.advice {
            msg.push_str(&format!("\n  → {advice}"));
        }
        msg
    }
}

impl fmt::Display for OrbitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "[{}] {} ({})", self.kind.code(), self.op, resource)?,
            None => write!(f, "[{}] {}", self.kind.code(), self.op)?,
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for OrbitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|cause| {
            let err: &(dyn std::error::Error + Send + Sync + 'static) = cause.as_ref();
            err as &(dyn std::error::Error + 'static)
        })
    }
}
