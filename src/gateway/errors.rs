//! Gateway error types and startup reporting.

use std::fmt;

use thiserror::Error;

use crate::backend::errors::BackendError;

/// Capability kinds, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Server,
    Tool,
    Resource,
    Prompt,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapabilityKind::Server => "server",
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        })
    }
}

/// One backend that failed to start or stop.
#[derive(Debug)]
pub struct ServerFailure {
    pub server: String,
    pub error: BackendError,
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.server, self.error)
    }
}

fn summarize(failures: &[ServerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the aggregator.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The effective backend set was empty.
    #[error("no servers configured")]
    NoServers,

    #[error("gateway is already started")]
    AlreadyStarted,

    /// Every backend failed to start.
    #[error("all {} servers failed to start: {}", .failures.len(), summarize(.failures))]
    AllServersFailed { failures: Vec<ServerFailure> },

    /// Unknown public name, or its backend is gone.
    #[error("{kind} not found: '{name}'")]
    NotFound { kind: CapabilityKind, name: String },

    #[error("server '{name}' is already registered")]
    DuplicateServer { name: String },

    /// A backend failed while serving a request.
    #[error("server '{server}' failed: {source}")]
    Backend {
        server: String,
        #[source]
        source: BackendError,
    },

    /// Some backends failed to stop; the rest were stopped.
    #[error("failed to stop {} server(s): {}", .failures.len(), summarize(.failures))]
    StopFailed { failures: Vec<ServerFailure> },

    /// Configuration error (unreadable file, bad YAML).
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl GatewayError {
    pub fn not_found(kind: CapabilityKind, name: &str) -> Self {
        GatewayError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

/// Outcome of a successful `start`.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Servers now active, sorted.
    pub started: Vec<String>,
    /// Servers that failed; non-empty means a partial start.
    pub failures: Vec<ServerFailure>,
}

impl StartupReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_servers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.server.as_str()).collect()
    }
}
