//! In-memory backends for aggregator tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::errors::BackendError;
use crate::backend::handle::{
    BackendHandle, Lifecycle, PromptCapability, ResourceCapability, ToolCapability,
};
use crate::backend::types::{
    CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool,
};
use crate::backend::Connector;
use crate::config::BackendDescriptor;

/// A scripted backend that records what it was asked.
#[derive(Default)]
pub struct FakeBackend {
    pub name: String,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    /// Local tool names whose calls fail with a server error.
    pub failing_tools: HashSet<String>,
    /// Make `list_tools` fail.
    pub fail_tool_listing: bool,
    /// Make `list_resources` and `list_prompts` fail.
    pub fail_optional_listing: bool,
    pub calls: Mutex<Vec<(String, Option<serde_json::Value>)>>,
    pub stopped: AtomicBool,
}

impl FakeBackend {
    pub fn with_tools(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| Tool::new(t, &format!("{t} tool"))).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.calls.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Handle exposing every capability kind this fake has data for.
    pub fn handle(self: &Arc<Self>) -> BackendHandle {
        let mut handle = BackendHandle::new(&self.name, self.clone());
        if !self.resources.is_empty() || self.fail_optional_listing {
            handle = handle.with_resources(self.clone());
        }
        if !self.prompts.is_empty() || self.fail_optional_listing {
            handle = handle.with_prompts(self.clone());
        }
        handle
    }

    fn server_error(&self, message: &str) -> BackendError {
        BackendError::Server {
            code: -32000,
            message: format!("{}: {message}", self.name),
            data: None,
        }
    }
}

#[async_trait]
impl Lifecycle for FakeBackend {
    async fn stop(&self) -> Result<(), BackendError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ToolCapability for FakeBackend {
    async fn list_tools(&self, _cancel: &CancellationToken) -> Result<Vec<Tool>, BackendError> {
        if self.fail_tool_listing {
            return Err(self.server_error("tools/list exploded"));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        self.calls.lock().push((name.to_string(), arguments));
        if self.failing_tools.contains(name) {
            return Err(self.server_error("tool failed"));
        }
        Ok(CallToolResult::text(&format!("{}:{name}", self.name)))
    }
}

#[async_trait]
impl ResourceCapability for FakeBackend {
    async fn list_resources(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, BackendError> {
        if self.fail_optional_listing {
            return Err(self.server_error("resources/list exploded"));
        }
        Ok(self.resources.clone())
    }

    async fn read_resource(
        &self,
        _cancel: &CancellationToken,
        uri: &str,
    ) -> Result<ReadResourceResult, BackendError> {
        if !self.resources.iter().any(|r| r.uri == uri) {
            return Err(self.server_error("no such resource"));
        }
        Ok(ReadResourceResult {
            contents: vec![serde_json::json!({"uri": uri, "text": "contents"})],
        })
    }
}

#[async_trait]
impl PromptCapability for FakeBackend {
    async fn list_prompts(&self, _cancel: &CancellationToken) -> Result<Vec<Prompt>, BackendError> {
        if self.fail_optional_listing {
            return Err(self.server_error("prompts/list exploded"));
        }
        Ok(self.prompts.clone())
    }

    async fn get_prompt(
        &self,
        _cancel: &CancellationToken,
        name: &str,
        _arguments: Option<serde_json::Value>,
    ) -> Result<GetPromptResult, BackendError> {
        Ok(GetPromptResult {
            description: Some(format!("{}:{name}", self.name)),
            messages: Vec::new(),
        })
    }
}

/// Connector handing out pre-built fakes; unknown names fail to spawn.
#[derive(Default)]
pub struct FakeConnector {
    backends: HashMap<String, Arc<FakeBackend>>,
    /// Names whose connect never completes.
    stalled: HashSet<String>,
    /// Connects currently suspended on a stalled name.
    in_flight: AtomicUsize,
}

impl FakeConnector {
    pub fn with(mut self, backend: FakeBackend) -> Self {
        self.backends
            .insert(backend.name.clone(), Arc::new(backend));
        self
    }

    pub fn stalling(mut self, name: &str) -> Self {
        self.stalled.insert(name.to_string());
        self
    }

    pub fn backend(&self, name: &str) -> Arc<FakeBackend> {
        self.backends[name].clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a suspended connect until its future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        descriptor: &BackendDescriptor,
    ) -> Result<BackendHandle, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.stalled.contains(&descriptor.name) {
            let _in_flight = InFlight::enter(&self.in_flight);
            std::future::pending::<()>().await;
        }
        match self.backends.get(&descriptor.name) {
            Some(backend) => Ok(backend.handle()),
            None => Err(BackendError::SpawnFailed {
                name: descriptor.name.clone(),
                reason: "command not found".into(),
            }),
        }
    }
}
