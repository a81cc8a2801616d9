//! Aggregator: one capability surface over many backends.
//!
//! Orchestrates backend lifecycle, the three namespace registries, health
//! tracking and call dispatch. This is the primary API a protocol-server
//! front end consumes.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::errors::{CapabilityKind, GatewayError, ServerFailure, StartupReport};
use super::health::{HealthStats, HealthTracker};
use super::registry::{
    NamespaceRegistry, PromptEntry, PromptRegistry, RegisterOutcome, RegistryEntry,
    ResourceEntry, ResourceRegistry, ToolEntry, ToolRegistry,
};
use super::retry::with_retry;
use crate::backend::connection::ConnectionSettings;
use crate::backend::errors::BackendError;
use crate::backend::handle::BackendHandle;
use crate::backend::types::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use crate::backend::{Connector, ProcessConnector};
use crate::config::{BackendDescriptor, GatewayConfig, GatewaySettings, RetryConfig};

// ─── Policies ────────────────────────────────────────────────────────────────

/// Per-backend exposure and retry rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendPolicy {
    /// Tool allow-list by backend-local name; empty exposes everything.
    pub allow_list: Vec<String>,
    pub retry: Option<RetryConfig>,
}

impl From<&BackendDescriptor> for BackendPolicy {
    fn from(descriptor: &BackendDescriptor) -> Self {
        Self {
            allow_list: descriptor.tools.clone(),
            retry: descriptor.retry.clone(),
        }
    }
}

struct ActiveBackend {
    handle: BackendHandle,
    policy: BackendPolicy,
}

/// Everything a backend advertised at discovery time.
struct Discovered {
    handle: BackendHandle,
    policy: BackendPolicy,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
}

/// Clears the running flag on drop unless startup completed.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl<'a> RunningGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

pub struct Aggregator {
    connector: Arc<dyn Connector>,
    /// Active backends. Never held across an `.await`.
    backends: RwLock<HashMap<String, ActiveBackend>>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    health: HealthTracker,
    /// Aliases re-applied on every start; `stop` clears the registries.
    configured_aliases: BTreeMap<String, String>,
    running: AtomicBool,
}

impl Aggregator {
    pub fn new(connector: Arc<dyn Connector>, settings: &GatewaySettings) -> Self {
        Self {
            connector,
            backends: RwLock::new(HashMap::new()),
            tools: ToolRegistry::new(),
            resources: ResourceRegistry::new(),
            prompts: PromptRegistry::new(),
            health: HealthTracker::new(settings.health_failure_threshold),
            configured_aliases: BTreeMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// An aggregator spawning real backends as the config describes.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let connector = ProcessConnector::new(ConnectionSettings::from(&config.settings))
            .with_project(config.project.clone());
        Self::new(Arc::new(connector), &config.settings).with_aliases(config.aliases.clone())
    }

    pub fn with_aliases(mut self, aliases: BTreeMap<String, String>) -> Self {
        self.configured_aliases = aliases;
        self.apply_aliases();
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every backend concurrently and build the registries.
    ///
    /// Partial startup is OK: failures are listed in the report. Only when
    /// no backend comes up does this return an error.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        backends: BTreeMap<String, BackendDescriptor>,
    ) -> Result<StartupReport, GatewayError> {
        if backends.is_empty() {
            return Err(GatewayError::NoServers);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyStarted);
        }
        // Dropping this future before startup completes resets the flag and
        // aborts the connect tasks along with the `JoinSet`.
        let mut running = RunningGuard::new(&self.running);
        self.apply_aliases();

        let mut failures = Vec::new();
        let mut launched = Vec::new();
        let mut tasks = JoinSet::new();

        for (name, mut descriptor) in backends {
            descriptor.name = name.clone();
            if self.backends.read().contains_key(&name) {
                failures.push(ServerFailure {
                    error: BackendError::AlreadyStarted { name: name.clone() },
                    server: name,
                });
                continue;
            }

            let connector = self.connector.clone();
            let cancel = cancel.clone();
            launched.push(name.clone());
            tasks.spawn(async move {
                let outcome = connect_and_discover(connector.as_ref(), &cancel, descriptor).await;
                (name, outcome)
            });
        }

        let mut outcomes = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    outcomes.insert(name, outcome);
                }
                Err(e) => tracing::error!(error = %e, "startup task failed"),
            }
        }

        // Install in name order so collisions resolve the same way every run.
        let mut started = Vec::new();
        for name in launched {
            match outcomes.remove(&name) {
                Some(Ok(discovered)) => {
                    let handle = discovered.handle.clone();
                    if self.install(discovered) {
                        started.push(name);
                    } else {
                        stop_quietly(&handle).await;
                        failures.push(ServerFailure {
                            error: BackendError::AlreadyStarted { name: name.clone() },
                            server: name,
                        });
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(server = %name, error = %error, "server failed to start");
                    failures.push(ServerFailure {
                        server: name,
                        error,
                    });
                }
                None => {
                    failures.push(ServerFailure {
                        error: BackendError::SpawnFailed {
                            name: name.clone(),
                            reason: "startup task failed".into(),
                        },
                        server: name,
                    });
                }
            }
        }

        if started.is_empty() {
            tracing::error!(failed = failures.len(), "no server could be started");
            return Err(GatewayError::AllServersFailed { failures });
        }
        running.disarm();

        if !failures.is_empty() {
            tracing::warn!(
                started = started.len(),
                failed = failures.len(),
                servers = ?failures.iter().map(|f| f.server.as_str()).collect::<Vec<_>>(),
                "partial startup"
            );
        }

        tracing::info!(
            servers = started.len(),
            tools = self.tools.count(),
            resources = self.resources.count(),
            prompts = self.prompts.count(),
            "gateway started"
        );

        started.sort();
        Ok(StartupReport { started, failures })
    }

    /// Stop every backend and reset the registries. Full teardown.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let active: Vec<ActiveBackend> = self
            .backends
            .write()
            .drain()
            .map(|(_, backend)| backend)
            .collect();
        self.running.store(false, Ordering::SeqCst);

        let results = futures::future::join_all(active.iter().map(|backend| async move {
            (backend.handle.name().to_string(), backend.handle.stop().await)
        }))
        .await;

        self.tools.clear();
        self.resources.clear();
        self.prompts.clear();
        self.health.clear();

        let failures: Vec<ServerFailure> = results
            .into_iter()
            .filter_map(|(server, result)| result.err().map(|error| ServerFailure { server, error }))
            .collect();

        if !active.is_empty() {
            tracing::info!(servers = active.len(), failed = failures.len(), "gateway stopped");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::StopFailed { failures })
        }
    }

    /// Register an already-started backend with no allow-list or retry policy.
    pub async fn add_server(
        &self,
        cancel: &CancellationToken,
        handle: BackendHandle,
    ) -> Result<(), GatewayError> {
        self.add_server_with_policy(cancel, handle, BackendPolicy::default())
            .await
    }

    /// Register an already-started backend.
    ///
    /// Tool discovery failure is an error; resource and prompt discovery
    /// failures are logged and leave those kinds empty.
    pub async fn add_server_with_policy(
        &self,
        cancel: &CancellationToken,
        handle: BackendHandle,
        policy: BackendPolicy,
    ) -> Result<(), GatewayError> {
        let name = handle.name().to_string();
        if self.backends.read().contains_key(&name) {
            return Err(GatewayError::DuplicateServer { name });
        }

        let discovered = discover(cancel, handle, policy)
            .await
            .map_err(|source| GatewayError::Backend {
                server: name.clone(),
                source,
            })?;

        if !self.install(discovered) {
            return Err(GatewayError::DuplicateServer { name });
        }

        tracing::info!(
            server = %name,
            tools = self.tools.for_server(&name).len(),
            "server added"
        );
        Ok(())
    }

    /// Unregister and stop one backend.
    pub async fn remove_server(&self, name: &str) -> Result<(), GatewayError> {
        let active = self
            .backends
            .write()
            .remove(name)
            .ok_or_else(|| GatewayError::not_found(CapabilityKind::Server, name))?;

        self.tools.remove_server(name);
        self.resources.remove_server(name);
        self.prompts.remove_server(name);
        self.health.reset(name);

        tracing::info!(server = name, "server removed");
        active
            .handle
            .stop()
            .await
            .map_err(|source| GatewayError::Backend {
                server: name.to_string(),
                source,
            })
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Call a tool by public name or alias.
    ///
    /// Backend failures come back as an error-flagged result, not as `Err`;
    /// only an unknown name is an error.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult, GatewayError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| GatewayError::not_found(CapabilityKind::Tool, name))?;
        let (handle, policy) = self
            .lookup(&entry.server)
            .ok_or_else(|| GatewayError::not_found(CapabilityKind::Tool, name))?;

        let tools = handle.tools().clone();
        let local = entry.tool.name.as_str();

        let outcome = self
            .forward(cancel, &entry.server, policy.retry.as_ref(), |_| {
                let tools = tools.clone();
                let arguments = arguments.clone();
                async move { tools.call_tool(cancel, local, arguments).await }
            })
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(server = %entry.server, tool = name, error = %e, "tool call failed");
                Ok(CallToolResult::error(&format!("tool '{name}' failed: {e}")))
            }
        }
    }

    /// Read a resource by its public URI.
    pub async fn read_resource(
        &self,
        cancel: &CancellationToken,
        uri: &str,
    ) -> Result<ReadResourceResult, GatewayError> {
        let not_found = || GatewayError::not_found(CapabilityKind::Resource, uri);
        let entry = self.resources.get(uri).ok_or_else(not_found)?;
        let (handle, policy) = self.lookup(&entry.server).ok_or_else(not_found)?;
        let resources = handle.resources().cloned().ok_or_else(not_found)?;
        let local = entry.resource.uri.as_str();

        self.forward(cancel, &entry.server, policy.retry.as_ref(), |_| {
            let resources = resources.clone();
            async move { resources.read_resource(cancel, local).await }
        })
        .await
        .map_err(|source| GatewayError::Backend {
            server: entry.server.clone(),
            source,
        })
    }

    /// Render a prompt by its public name.
    pub async fn get_prompt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<GetPromptResult, GatewayError> {
        let not_found = || GatewayError::not_found(CapabilityKind::Prompt, name);
        let entry = self.prompts.get(name).ok_or_else(not_found)?;
        let (handle, policy) = self.lookup(&entry.server).ok_or_else(not_found)?;
        let prompts = handle.prompts().cloned().ok_or_else(not_found)?;
        let local = entry.prompt.name.as_str();

        self.forward(cancel, &entry.server, policy.retry.as_ref(), |_| {
            let prompts = prompts.clone();
            let arguments = arguments.clone();
            async move { prompts.get_prompt(cancel, local, arguments).await }
        })
        .await
        .map_err(|source| GatewayError::Backend {
            server: entry.server.clone(),
            source,
        })
    }

    // ─── Listing ─────────────────────────────────────────────────────────

    /// Registered tools, sorted by public key.
    pub fn list_tools(&self) -> Vec<ToolEntry> {
        sorted(self.tools.all())
    }

    pub fn list_resources(&self) -> Vec<ResourceEntry> {
        sorted(self.resources.all())
    }

    pub fn list_prompts(&self) -> Vec<PromptEntry> {
        sorted(self.prompts.all())
    }

    /// Tool definitions renamed to their public keys.
    pub fn tool_definitions(&self) -> Vec<Tool> {
        self.list_tools()
            .iter()
            .map(ToolEntry::public_definition)
            .collect()
    }

    pub fn resource_definitions(&self) -> Vec<Resource> {
        self.list_resources()
            .iter()
            .map(ResourceEntry::public_definition)
            .collect()
    }

    pub fn prompt_definitions(&self) -> Vec<Prompt> {
        self.list_prompts()
            .iter()
            .map(PromptEntry::public_definition)
            .collect()
    }

    /// Active backend names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Map an extra public name onto a tool key. Lasts until the next stop.
    pub fn add_alias(&self, alias: &str, key: &str) -> Option<String> {
        self.tools.add_alias(alias, key)
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Health statistics of every active backend, sorted by name.
    pub fn health_report(&self) -> Vec<HealthStats> {
        self.server_names()
            .iter()
            .map(|name| self.health.stats(name))
            .collect()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn apply_aliases(&self) {
        for (alias, key) in &self.configured_aliases {
            self.tools.add_alias(alias, key);
        }
    }

    /// Clone what a call needs out from under the backend lock.
    fn lookup(&self, server: &str) -> Option<(BackendHandle, BackendPolicy)> {
        self.backends
            .read()
            .get(server)
            .map(|active| (active.handle.clone(), active.policy.clone()))
    }

    /// Insert a discovered backend and register its capabilities.
    ///
    /// Returns `false` if a backend with that name is already active.
    fn install(&self, discovered: Discovered) -> bool {
        let Discovered {
            handle,
            policy,
            tools,
            resources,
            prompts,
        } = discovered;
        let name = handle.name().to_string();

        let mut backends = self.backends.write();
        if backends.contains_key(&name) {
            return false;
        }

        let exposed = register_logged(&self.tools, CapabilityKind::Tool, &name, tools, &policy.allow_list);
        register_logged(&self.resources, CapabilityKind::Resource, &name, resources, &[]);
        register_logged(&self.prompts, CapabilityKind::Prompt, &name, prompts, &[]);

        tracing::debug!(server = %name, tools = exposed, "server registered");
        backends.insert(name, ActiveBackend { handle, policy });
        true
    }

    /// Run a backend operation under its retry policy and record the outcome.
    async fn forward<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        server: &str,
        retry: Option<&RetryConfig>,
        operation: F,
    ) -> Result<T, BackendError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let outcome = with_retry(cancel, retry, operation).await;
        match &outcome {
            Ok(_) => self.health.record_success(server),
            // The caller gave up; says nothing about the backend.
            Err(e) if matches!(e.root_cause(), BackendError::Cancelled) => {}
            Err(_) => self.health.record_failure(server),
        }
        outcome
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Connect, then discover; a backend that fails discovery is stopped again.
async fn connect_and_discover(
    connector: &dyn Connector,
    cancel: &CancellationToken,
    descriptor: BackendDescriptor,
) -> Result<Discovered, BackendError> {
    let handle = connector.connect(cancel, &descriptor).await?;
    let policy = BackendPolicy::from(&descriptor);

    match discover(cancel, handle.clone(), policy).await {
        Ok(discovered) => Ok(discovered),
        Err(e) => {
            stop_quietly(&handle).await;
            Err(e)
        }
    }
}

async fn discover(
    cancel: &CancellationToken,
    handle: BackendHandle,
    policy: BackendPolicy,
) -> Result<Discovered, BackendError> {
    let tools = handle.tools().list_tools(cancel).await?;

    let resources = match handle.resources() {
        Some(capability) => capability.list_resources(cancel).await.unwrap_or_else(|e| {
            tracing::warn!(server = %handle.name(), error = %e, "resource discovery failed");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let prompts = match handle.prompts() {
        Some(capability) => capability.list_prompts(cancel).await.unwrap_or_else(|e| {
            tracing::warn!(server = %handle.name(), error = %e, "prompt discovery failed");
            Vec::new()
        }),
        None => Vec::new(),
    };

    tracing::debug!(
        server = %handle.name(),
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "capabilities discovered"
    );

    Ok(Discovered {
        handle,
        policy,
        tools,
        resources,
        prompts,
    })
}

/// Register items, warning when a public name from another server is replaced.
fn register_logged<E: RegistryEntry>(
    registry: &NamespaceRegistry<E>,
    kind: CapabilityKind,
    server: &str,
    items: Vec<E::Item>,
    allow_list: &[String],
) -> usize {
    let mut registered = 0;
    for item in items {
        let local = E::local_name(&item).to_string();
        match registry.register(server, item, allow_list) {
            RegisterOutcome::Filtered => {}
            RegisterOutcome::Replaced { previous_server } if previous_server != server => {
                tracing::warn!(
                    server,
                    previous_server = %previous_server,
                    kind = %kind,
                    name = %local,
                    "public name collision, previous entry replaced"
                );
                registered += 1;
            }
            _ => registered += 1,
        }
    }
    registered
}

async fn stop_quietly(handle: &BackendHandle) {
    if let Err(e) = handle.stop().await {
        tracing::debug!(server = %handle.name(), error = %e, "stop after failed startup");
    }
}

fn sorted<E: RegistryEntry>(mut entries: Vec<E>) -> Vec<E> {
    entries.sort_by(|a, b| a.key().cmp(b.key()));
    entries
}

// ─── Tests ───────────────────────────────────────────────────────────────────
