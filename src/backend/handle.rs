//! Capability traits and the handle the aggregator holds per backend.
//!
//! Tools are mandatory for every backend; resources and prompts are optional
//! and resolved once, when the handle is built.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::connection::BackendConnection;
use super::errors::BackendError;
use super::types::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};

/// Shutdown of a started backend.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Release the backend. Calling it twice is harmless.
    async fn stop(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ToolCapability: Send + Sync {
    async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, BackendError>;

    /// Invoke a tool by its backend-local name.
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult, BackendError>;
}

#[async_trait]
pub trait ResourceCapability: Send + Sync {
    async fn list_resources(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, BackendError>;

    /// Read a resource by its backend-local URI.
    async fn read_resource(
        &self,
        cancel: &CancellationToken,
        uri: &str,
    ) -> Result<ReadResourceResult, BackendError>;
}

#[async_trait]
pub trait PromptCapability: Send + Sync {
    async fn list_prompts(&self, cancel: &CancellationToken) -> Result<Vec<Prompt>, BackendError>;

    async fn get_prompt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<GetPromptResult, BackendError>;
}

/// A started backend as seen by the aggregator.
#[derive(Clone)]
pub struct BackendHandle {
    name: String,
    lifecycle: Arc<dyn Lifecycle>,
    tools: Arc<dyn ToolCapability>,
    resources: Option<Arc<dyn ResourceCapability>>,
    prompts: Option<Arc<dyn PromptCapability>>,
}

impl BackendHandle {
    /// A handle exposing tools only; add the optional capabilities with the
    /// `with_*` builders.
    pub fn new<B>(name: &str, backend: Arc<B>) -> Self
    where
        B: Lifecycle + ToolCapability + 'static,
    {
        Self {
            name: name.to_string(),
            lifecycle: backend.clone(),
            tools: backend,
            resources: None,
            prompts: None,
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceCapability>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptCapability>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Wrap a started connection, exposing what its server advertised.
    pub async fn from_connection(connection: Arc<BackendConnection>) -> Self {
        let capabilities = connection.server_capabilities().await.unwrap_or_default();
        let name = connection.name().to_string();

        let mut handle = Self::new(&name, connection.clone());
        if capabilities.resources.is_some() {
            handle = handle.with_resources(connection.clone());
        }
        if capabilities.prompts.is_some() {
            handle = handle.with_prompts(connection);
        }
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &Arc<dyn ToolCapability> {
        &self.tools
    }

    pub fn resources(&self) -> Option<&Arc<dyn ResourceCapability>> {
        self.resources.as_ref()
    }

    pub fn prompts(&self) -> Option<&Arc<dyn PromptCapability>> {
        self.prompts.as_ref()
    }

    pub async fn stop(&self) -> Result<(), BackendError> {
        self.lifecycle.stop().await
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name)
            .field("resources", &self.resources.is_some())
            .field("prompts", &self.prompts.is_some())
            .finish()
    }
}
