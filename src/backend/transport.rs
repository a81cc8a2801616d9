//! Backend transports.
//!
//! Three wire variants share one request/notify surface:
//! - `Stdio`: line-delimited JSON-RPC over a child process's stdin/stdout
//! - `Http`: MCP streamable HTTP (one POST per message)
//! - `Sse`: legacy HTTP+SSE (long-lived event stream + POST endpoint)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::BackendError;
use super::http::{HttpTransport, SseTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Transport ───────────────────────────────────────────────────────────────

/// An established connection to one backend.
pub enum Transport {
    Stdio(StdioProcess),
    Http(HttpTransport),
    Sse(SseTransport),
}

impl Transport {
    /// Send a request and return its `result` payload.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BackendError> {
        let response = match self {
            Transport::Stdio(process) => process.io.request(method, params).await?,
            Transport::Http(http) => http.request(method, params).await?,
            Transport::Sse(sse) => sse.request(method, params).await?,
        };
        extract_result(response)
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        match self {
            Transport::Stdio(process) => process.io.notify(method, params).await,
            Transport::Http(http) => http.notify(method, params).await,
            Transport::Sse(sse) => sse.notify(method, params).await,
        }
    }

    /// Extra context for error messages (recent stderr for child processes).
    pub fn diagnostics(&self) -> String {
        match self {
            Transport::Stdio(process) => process.stderr_tail(),
            Transport::Http(_) | Transport::Sse(_) => String::new(),
        }
    }

    /// Release every resource held by the transport.
    pub async fn close(self, timeout: Duration) -> Result<(), BackendError> {
        match self {
            Transport::Stdio(process) => process.shutdown(timeout).await,
            Transport::Http(http) => http.close().await,
            Transport::Sse(sse) => {
                sse.close();
                Ok(())
            }
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<BufReader<ChildStdout>>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(BufReader::new(stdout)),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Writes one line of JSON, then reads lines until a response with the
    /// same `id` shows up. Anything else on stdout (logs, notifications,
    /// stale responses of cancelled calls) is skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let json = serde_json::to_string(&req)
            .map_err(|e| self.error(format!("failed to serialize request: {e}")))?;
        self.write_line(json).await?;

        let mut line_buf = String::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.error("server stdout closed (process may have exited)".into()));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "non-response line");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            self.error(format!("failed to serialize notification: {e}"))
        })?;
        self.write_line(json).await
    }

    /// Close stdin so a well-behaved server exits on EOF.
    pub async fn close_stdin(&self) {
        if let Some(mut stdin) = self.writer.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    async fn write_line(&self, mut json: String) -> Result<(), BackendError> {
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.error("stdin already closed".into()))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.error(format!("failed to flush stdin: {e}")))
    }

    fn error(&self, reason: String) -> BackendError {
        BackendError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }
}

/// Parameters for spawning a stdio backend.
#[derive(Debug, Clone)]
pub struct StdioSpawn<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: Option<&'a str>,
    /// Complete child environment; the parent environment is not inherited.
    pub env: HashMap<String, String>,
}

/// A running backend process with its transport.
pub struct StdioProcess {
    name: String,
    child: Child,
    io: StdioTransport,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioProcess {
    /// Spawn the server process and wire its stdio.
    pub fn spawn(name: &str, spec: &StdioSpawn<'_>) -> Result<Self, BackendError> {
        let mut cmd = Command::new(spec.command);
        cmd.args(spec.args);
        cmd.env_clear();
        cmd.envs(&spec.env);

        if let Some(dir) = spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or(BackendError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(BackendError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_stderr(
                name.to_string(),
                stderr,
                stderr_tail.clone(),
            ))
        });

        tracing::debug!(
            server = name,
            command = spec.command,
            pid = ?child.id(),
            "spawned server process"
        );

        Ok(Self {
            name: name.to_string(),
            child,
            io: StdioTransport::new(name, stdin, stdout),
            stderr_tail,
            stderr_task,
        })
    }

    /// The most recent stderr lines, joined, or empty.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Close stdin, wait for exit, kill if the process lingers.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), BackendError> {
        self.io.close_stdin().await;

        let result = tokio::time::timeout(timeout, self.child.wait()).await;
        match result {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server process exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "server did not exit in time, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Transport {
                        server: self.name.clone(),
                        reason: format!("failed to kill process: {e}"),
                    })?;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Forward child stderr to the log and keep the last lines for diagnostics.
async fn forward_stderr(
    name: String,
    stderr: tokio::process::ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, stderr = %line, "server stderr");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `BackendError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, BackendError> {
    if let Some(err) = response.error {
        return Err(BackendError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(BackendError::Server {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
