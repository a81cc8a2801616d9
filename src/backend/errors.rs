//! Backend connection error types.

use thiserror::Error;

use crate::gateway::retry::Retryable;

/// Errors that can occur while talking to a single backend server.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The server process could not be spawned (missing command, bad cwd).
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The remote endpoint could not be reached.
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectFailed { name: String, reason: String },

    /// The `initialize` handshake was rejected or returned garbage.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The `initialize` handshake did not complete in time.
    #[error("server '{name}' initialization timed out after {timeout_ms}ms")]
    InitTimeout { name: String, timeout_ms: u64 },

    /// `start` was called on a connection that is already running.
    #[error("server '{name}' is already started")]
    AlreadyStarted { name: String },

    /// An operation needed a running connection.
    #[error("server '{name}' is not started")]
    NotStarted { name: String },

    /// The connection was stopped and cannot be reused.
    #[error("server '{name}' connection is closed")]
    Closed { name: String },

    /// I/O failure on an established transport.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// The server answered with something that is not a valid MCP payload.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request exceeded its deadline.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Explicitly marked as safe to retry, whatever the inner error is.
    #[error("{source}")]
    Retryable {
        #[source]
        source: Box<BackendError>,
    },

    /// Every retry attempt failed.
    #[error("failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// Tag an error so the retry executor always retries it.
    pub fn retryable(err: BackendError) -> Self {
        BackendError::Retryable {
            source: Box::new(err),
        }
    }

    /// Whether the error happened while establishing the transport.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.root_cause(),
            BackendError::SpawnFailed { .. }
                | BackendError::ConnectFailed { .. }
                | BackendError::Transport { .. }
        )
    }

    /// Whether the error happened during capability negotiation.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self.root_cause(),
            BackendError::InitFailed { .. } | BackendError::InitTimeout { .. }
        )
    }

    /// Whether this is a JSON-RPC "method not found" reply.
    ///
    /// Servers that do not implement resources or prompts answer listing
    /// requests this way.
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            BackendError::Server { code, .. }
                if *code == super::types::error_codes::METHOD_NOT_FOUND
        )
    }

    /// Peel off retry wrappers and return the underlying error.
    pub fn root_cause(&self) -> &BackendError {
        match self {
            BackendError::Retryable { source } | BackendError::RetryExhausted { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        match self {
            BackendError::Retryable { .. } => true,
            BackendError::Cancelled
            | BackendError::Timeout { .. }
            | BackendError::NotStarted { .. } => false,
            _ => true,
        }
    }

    fn cancelled() -> Self {
        BackendError::Cancelled
    }

    fn exhausted(attempts: u32, last: Self) -> Self {
        BackendError::RetryExhausted {
            attempts,
            source: Box::new(last),
        }
    }
}
