//! Error types for fleet operations.

use std::time::Duration;

use thiserror::Error;

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by placement, allocation, and reconciliation.
#[derive(Debug, Error)]
pub enum FleetError {
    /// No host can take the workload and none can be provisioned.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The machine pool could not supply a host.
    #[error("no machines available: {0}")]
    NoMachinesAvailable(String),

    /// Caller passed something the fleet does not know or cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A daemon command exited non-zero.
    #[error("`{command}` failed with exit code {exit_code}: {stderr}")]
    BuildFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Daemon output or a callback marker had an unexpected shape.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// A bounded wait expired.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The command channel itself failed (spawn, I/O).
    #[error("daemon channel error: {0}")]
    Daemon(String),

    /// Configuration could not be loaded or resolved.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Stable machine-readable code for logs and reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ResourceUnavailable(_) => "resource_unavailable",
            Self::NoMachinesAvailable(_) => "no_machines_available",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::BuildFailure { .. } => "build_failure",
            Self::ParseFailure(_) => "parse_failure",
            Self::Timeout { .. } => "timeout",
            Self::Daemon(_) => "daemon_error",
            Self::Config(_) => "config_error",
        }
    }
}

impl From<dockfleet_id::IdError> for FleetError {
    fn from(err: dockfleet_id::IdError) -> Self {
        Self::ParseFailure(err.to_string())
    }
}

impl From<dockfleet_reconcile::ReconcileError> for FleetError {
    fn from(err: dockfleet_reconcile::ReconcileError) -> Self {
        Self::ParseFailure(err.to_string())
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Daemon(err.to_string())
    }
}
