//! Gateway configuration loading.
//!
//! Reads `assern.yaml` (JSON is accepted too, being valid YAML) and resolves
//! environment variables. The config names the backend servers to aggregate,
//! their transports, per-server tool allow-lists and retry policies.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::gateway::errors::GatewayError;

/// Environment variable that overrides the default config location.
pub const CONFIG_ENV_VAR: &str = "ASSERN_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file (mirrors `assern.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Active project name, exported to stdio backends as `ASSERN_PROJECT`.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub settings: GatewaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Alternative tool names: alias → public tool name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub servers: BTreeMap<String, BackendDescriptor>,
}

/// Timeouts and thresholds shared by every backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewaySettings {
    /// Consecutive failures before a backend is reported unhealthy.
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    /// Deadline for the `initialize` handshake.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Deadline for every other request.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Grace period before a stdio backend is killed on stop.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            health_failure_threshold: default_health_failure_threshold(),
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl GatewaySettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_health_failure_threshold() -> u32 {
    3
}
fn default_init_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

/// Where and how the gateway writes its own logs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log file; stderr when unset. Rotated on every start.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Rotated files kept next to `file` (`assern.log.1` and up).
    #[serde(default = "default_log_keep")]
    pub keep: u32,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            keep: default_log_keep(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_keep() -> u32 {
    3
}

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Remote wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// MCP streamable HTTP.
    #[default]
    Http,
    /// Legacy HTTP+SSE.
    Sse,
}

/// Pre-obtained OAuth credentials for a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthConfig {
    pub access_token: String,
}

/// Per-backend retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

/// One backend server as declared in the `servers` map.
///
/// Either `command` (stdio subprocess) or `url` (remote) must be set; when
/// both are present the command wins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackendDescriptor {
    /// Unique server name; filled from the map key.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub transport: Option<RemoteKind>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    /// Tool allow-list by backend-local name. Empty exposes every tool.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Resolved transport parameters of a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSpec<'a> {
    Stdio {
        command: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
        cwd: Option<&'a str>,
    },
    Remote {
        kind: RemoteKind,
        url: &'a str,
        headers: &'a HashMap<String, String>,
        bearer_token: Option<&'a str>,
    },
}

impl BackendDescriptor {
    /// A stdio backend.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A remote backend.
    pub fn remote(name: &str, url: &str, kind: RemoteKind) -> Self {
        Self {
            name: name.to_string(),
            url: Some(url.to_string()),
            transport: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_allow_list(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Which transport this backend uses, or `None` if neither is configured.
    pub fn transport_spec(&self) -> Option<TransportSpec<'_>> {
        if let Some(command) = self.command.as_deref().filter(|c| !c.is_empty()) {
            return Some(TransportSpec::Stdio {
                command,
                args: &self.args,
                env: &self.env,
                cwd: self.cwd.as_deref(),
            });
        }

        let url = self.url.as_deref().filter(|u| !u.is_empty())?;
        Some(TransportSpec::Remote {
            kind: self.transport.unwrap_or_default(),
            url,
            headers: &self.headers,
            bearer_token: self.oauth.as_ref().map(|o| o.access_token.as_str()),
        })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Default config location: `$ASSERN_CONFIG`, else `<config dir>/assern/assern.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }
    dirs::config_dir().map(|dir| dir.join("assern").join("assern.yaml"))
}

impl GatewayConfig {
    /// Load and parse a configuration file.
    ///
    /// Performs environment-variable interpolation on the raw text, matching
    /// `${VAR_NAME}` or `${VAR_NAME:-default}`.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration text.
    pub fn from_yaml(raw: &str) -> Result<Self, GatewayError> {
        let interpolated = interpolate_env_vars(raw);

        let mut config: GatewayConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| GatewayError::Config {
                reason: format!("failed to parse config: {e}"),
            })?;

        for (name, server) in config.servers.iter_mut() {
            server.name = name.clone();
        }
        if let Some(file) = config.logging.file.take() {
            config.logging.file = Some(PathBuf::from(expand_tilde(&file.to_string_lossy())));
        }

        Ok(config)
    }

    /// The backends the gateway should start.
    ///
    /// Disabled servers and servers without a usable transport are dropped.
    pub fn effective_backends(&self) -> BTreeMap<String, BackendDescriptor> {
        let mut effective = BTreeMap::new();

        for (name, server) in &self.servers {
            if server.disabled {
                tracing::debug!(server = %name, "server disabled, skipping");
                continue;
            }
            if server.transport_spec().is_none() {
                tracing::warn!(server = %name, "server has neither command nor url, skipping");
                continue;
            }
            effective.insert(name.clone(), server.clone());
        }

        effective
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
