//! A single backend server connection.
//!
//! Owns the transport and the lifecycle of one backend: spawn or connect,
//! the MCP `initialize` handshake, capability listing and call forwarding.
//! A connection is used for one lifetime only; once stopped it cannot be
//! started again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::env::EnvironmentBuilder;
use super::errors::BackendError;
use super::handle::{Lifecycle, PromptCapability, ResourceCapability, ToolCapability};
use super::http::{HttpTransport, RemoteEndpoint, SseTransport};
use super::transport::{StdioProcess, StdioSpawn, Transport};
use super::types::{
    CallToolResult, GetPromptResult, InitializeParams, InitializeResult, Prompt,
    ReadResourceResult, Resource, ServerCapabilities, Tool,
};
use crate::config::{BackendDescriptor, GatewaySettings, RemoteKind, TransportSpec};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Deadlines applied by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Deadline for the `initialize` handshake.
    pub init_timeout: Duration,
    /// Deadline for every other request.
    pub call_timeout: Duration,
    /// Grace period before a stdio backend is killed.
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&GatewaySettings::default())
    }
}

impl From<&GatewaySettings> for ConnectionSettings {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            init_timeout: settings.init_timeout(),
            call_timeout: settings.call_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

// ─── BackendConnection ───────────────────────────────────────────────────────

enum ConnectionState {
    Unstarted,
    Started(Session),
    Stopped,
}

struct Session {
    transport: Transport,
    init: InitializeResult,
}

/// Connection to one backend server.
///
/// The state lock is held for the whole of each outbound call, so requests
/// to one backend never interleave.
pub struct BackendConnection {
    descriptor: BackendDescriptor,
    env: Arc<dyn EnvironmentBuilder>,
    project: Option<String>,
    settings: ConnectionSettings,
    state: Mutex<ConnectionState>,
}

impl BackendConnection {
    pub fn new(
        descriptor: BackendDescriptor,
        env: Arc<dyn EnvironmentBuilder>,
        project: Option<String>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            descriptor,
            env,
            project,
            settings,
            state: Mutex::new(ConnectionState::Unstarted),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Capabilities advertised during the handshake, if started.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.state.lock().await {
            ConnectionState::Started(session) => Some(session.init.capabilities.clone()),
            _ => None,
        }
    }

    /// Open the transport and perform the handshake.
    ///
    /// A failed start leaves the connection unstarted.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnectionState::Started(_) => {
                return Err(BackendError::AlreadyStarted {
                    name: self.name().to_string(),
                })
            }
            ConnectionState::Stopped => {
                return Err(BackendError::Closed {
                    name: self.name().to_string(),
                })
            }
            ConnectionState::Unstarted => {}
        }

        let transport = self.open_transport(cancel).await?;

        let init = match self.handshake(cancel, &transport).await {
            Ok(init) => init,
            Err(e) => {
                let stderr = transport.diagnostics();
                if !stderr.is_empty() {
                    tracing::warn!(
                        server = %self.name(),
                        stderr = %stderr,
                        "server stderr captured on failure"
                    );
                }
                if let Err(close_err) = transport.close(self.settings.shutdown_timeout).await {
                    tracing::debug!(server = %self.name(), error = %close_err, "cleanup after failed start");
                }
                return Err(with_stderr(e, &stderr));
            }
        };

        let server_info = init.server_info.as_ref();
        tracing::info!(
            server = %self.name(),
            remote_name = server_info.and_then(|s| s.name.as_deref()).unwrap_or("?"),
            remote_version = server_info.and_then(|s| s.version.as_deref()).unwrap_or("?"),
            protocol = init.protocol_version.as_deref().unwrap_or("?"),
            "server initialized"
        );

        *state = ConnectionState::Started(Session { transport, init });
        Ok(())
    }

    /// Release the transport. Idempotent; the connection is terminal afterwards.
    pub async fn stop(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ConnectionState::Stopped) {
            ConnectionState::Started(session) => {
                tracing::debug!(server = %self.name(), "stopping server");
                session
                    .transport
                    .close(self.settings.shutdown_timeout)
                    .await
            }
            ConnectionState::Unstarted | ConnectionState::Stopped => Ok(()),
        }
    }

    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, BackendError> {
        self.list_paginated(cancel, "tools/list", "tools").await
    }

    pub async fn list_resources(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, BackendError> {
        self.list_paginated(cancel, "resources/list", "resources")
            .await
    }

    pub async fn list_prompts(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Prompt>, BackendError> {
        self.list_paginated(cancel, "prompts/list", "prompts").await
    }

    /// Forward a tool call using the backend-local tool name.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult, BackendError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.request(cancel, "tools/call", Some(params)).await?;
        self.decode("tools/call", result)
    }

    pub async fn read_resource(
        &self,
        cancel: &CancellationToken,
        uri: &str,
    ) -> Result<ReadResourceResult, BackendError> {
        let params = serde_json::json!({ "uri": uri });
        let result = self.request(cancel, "resources/read", Some(params)).await?;
        self.decode("resources/read", result)
    }

    pub async fn get_prompt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<GetPromptResult, BackendError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.request(cancel, "prompts/get", Some(params)).await?;
        self.decode("prompts/get", result)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn open_transport(&self, cancel: &CancellationToken) -> Result<Transport, BackendError> {
        let name = self.name();
        let spec = self
            .descriptor
            .transport_spec()
            .ok_or_else(|| BackendError::ConnectFailed {
                name: name.to_string(),
                reason: "neither command nor url configured".into(),
            })?;

        match spec {
            TransportSpec::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let spawn = StdioSpawn {
                    command,
                    args,
                    cwd,
                    env: self.env.build(env, self.project.as_deref()),
                };
                Ok(Transport::Stdio(StdioProcess::spawn(name, &spawn)?))
            }
            TransportSpec::Remote {
                kind,
                url,
                headers,
                bearer_token,
            } => {
                let remote = RemoteEndpoint {
                    url,
                    headers,
                    bearer_token,
                };
                match kind {
                    RemoteKind::Http => Ok(Transport::Http(HttpTransport::connect(
                        name,
                        &remote,
                        self.settings.call_timeout,
                    )?)),
                    RemoteKind::Sse => {
                        let sse = guarded(
                            cancel,
                            self.settings.init_timeout,
                            "connect",
                            SseTransport::connect(name, &remote, self.settings.init_timeout),
                        )
                        .await?;
                        Ok(Transport::Sse(sse))
                    }
                }
            }
        }
    }

    async fn handshake(
        &self,
        cancel: &CancellationToken,
        transport: &Transport,
    ) -> Result<InitializeResult, BackendError> {
        let name = self.name();
        let init_failed = |reason: String| BackendError::InitFailed {
            name: name.to_string(),
            reason,
        };
        // Remote transports first touch the network here, so an unreachable
        // endpoint keeps its connect error instead of becoming `InitFailed`.
        let exchange_failed = |e: BackendError| {
            if matches!(
                e.root_cause(),
                BackendError::ConnectFailed { .. } | BackendError::SpawnFailed { .. }
            ) {
                e
            } else {
                init_failed(e.to_string())
            }
        };

        let exchange = async {
            let params = serde_json::to_value(InitializeParams::gateway())
                .map_err(|e| init_failed(format!("failed to encode initialize params: {e}")))?;
            let result = transport
                .request("initialize", Some(params))
                .await
                .map_err(exchange_failed)?;
            let init: InitializeResult = serde_json::from_value(result)
                .map_err(|e| init_failed(format!("failed to parse initialize response: {e}")))?;
            transport
                .notify("notifications/initialized", None)
                .await
                .map_err(exchange_failed)?;
            Ok::<_, BackendError>(init)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            outcome = tokio::time::timeout(self.settings.init_timeout, exchange) => {
                outcome.unwrap_or_else(|_| Err(BackendError::InitTimeout {
                    name: name.to_string(),
                    timeout_ms: self.settings.init_timeout.as_millis() as u64,
                }))
            }
        }
    }

    /// Send one request on the started transport, bounded by the call timeout.
    async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BackendError> {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            state = self.state.lock() => state,
        };

        let ConnectionState::Started(session) = &*state else {
            return Err(BackendError::NotStarted {
                name: self.name().to_string(),
            });
        };

        guarded(
            cancel,
            self.settings.call_timeout,
            method,
            session.transport.request(method, params),
        )
        .await
    }

    /// Fetch every page of a `*/list` endpoint.
    async fn list_paginated<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        field: &str,
    ) -> Result<Vec<T>, BackendError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let mut page = self.request(cancel, method, params).await?;

            let batch = page
                .get_mut(field)
                .map(serde_json::Value::take)
                .unwrap_or_else(|| serde_json::json!([]));
            let batch: Vec<T> = self.decode(method, batch)?;
            items.extend(batch);

            match page.get("nextCursor").and_then(|c| c.as_str()) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }

        tracing::debug!(server = %self.name(), method, count = items.len(), "listed");
        Ok(items)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        method: &str,
        value: serde_json::Value,
    ) -> Result<T, BackendError> {
        serde_json::from_value(value).map_err(|e| BackendError::InvalidResponse {
            server: self.name().to_string(),
            reason: format!("malformed '{method}' result: {e}"),
        })
    }
}

/// Race an operation against cancellation and a deadline.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    fut: F,
) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        outcome = tokio::time::timeout(timeout, fut) => {
            outcome.unwrap_or_else(|_| Err(BackendError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }))
        }
    }
}

/// Append captured stderr to a handshake failure reason.
fn with_stderr(err: BackendError, stderr: &str) -> BackendError {
    match err {
        BackendError::InitFailed { name, reason } if !stderr.is_empty() => {
            BackendError::InitFailed {
                name,
                reason: format!("{reason} | stderr: {}", stderr.trim()),
            }
        }
        other => other,
    }
}

// ─── Capability impls ────────────────────────────────────────────────────────

#[async_trait]
impl Lifecycle for BackendConnection {
    async fn stop(&self) -> Result<(), BackendError> {
        BackendConnection::stop(self).await
    }
}

#[async_trait]
impl ToolCapability for BackendConnection {
    async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, BackendError> {
        BackendConnection::list_tools(self, cancel).await
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult, BackendError> {
        BackendConnection::call_tool(self, cancel, name, arguments).await
    }
}

#[async_trait]
impl ResourceCapability for BackendConnection {
    async fn list_resources(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, BackendError> {
        BackendConnection::list_resources(self, cancel).await
    }

    async fn read_resource(
        &self,
        cancel: &CancellationToken,
        uri: &str,
    ) -> Result<ReadResourceResult, BackendError> {
        BackendConnection::read_resource(self, cancel, uri).await
    }
}

#[async_trait]
impl PromptCapability for BackendConnection {
    async fn list_prompts(&self, cancel: &CancellationToken) -> Result<Vec<Prompt>, BackendError> {
        BackendConnection::list_prompts(self, cancel).await
    }

    async fn get_prompt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<GetPromptResult, BackendError> {
        BackendConnection::get_prompt(self, cancel, name, arguments).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
