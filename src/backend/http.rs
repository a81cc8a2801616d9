//! Remote transports: MCP streamable HTTP and legacy HTTP+SSE.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, StatusCode, Url};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::BackendError;
use super::sse::{decode_sse_events, SseBuffer};
use super::transport::next_request_id;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};

/// Header carrying the streamable-HTTP session id.
const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the negotiated protocol revision.
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// TCP connection timeout for remote backends.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters shared by both remote transports.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint<'a> {
    pub url: &'a str,
    pub headers: &'a HashMap<String, String>,
    /// Pre-obtained OAuth access token, sent as a bearer credential.
    pub bearer_token: Option<&'a str>,
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// MCP client transport over streamable HTTP.
pub struct HttpTransport {
    server_name: String,
    http: HttpClient,
    endpoint: Url,
    headers: HeaderMap,
    request_timeout: Duration,
    session_id: parking_lot::Mutex<Option<String>>,
}

impl HttpTransport {
    /// Build the transport. No traffic happens until the first request.
    pub fn connect(
        name: &str,
        remote: &RemoteEndpoint<'_>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let endpoint = parse_url(name, remote.url)?;
        let headers = build_headers(name, remote)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::ConnectFailed {
                name: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: name.to_string(),
            http,
            endpoint,
            headers,
            request_timeout,
            session_id: parking_lot::Mutex::new(None),
        })
    }

    /// POST a request and decode the JSON or SSE response body.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .post(&req)
            .send()
            .await
            .map_err(|e| send_error(&self.server_name, method, self.request_timeout, e))?;

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.lock() = Some(sid.to_string());
        }

        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            return Err(self.invalid("server returned 202 accepted for a request".into()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Transport {
                server: self.server_name.clone(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = resp.text().await.map_err(|e| BackendError::Transport {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        tracing::trace!(server = %self.server_name, content_type = %content_type, "http response");

        if content_type.starts_with("text/event-stream") {
            decode_sse_events(&body)
                .into_iter()
                .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(&event.data).ok())
                .find(|r| r.id == id)
                .ok_or_else(|| self.invalid(format!("no response for request {id} in event stream")))
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| self.invalid(format!("failed to parse JSON-RPC response: {e}")))
        }
    }

    /// POST a notification; servers answer 202 Accepted.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        let resp = self
            .post(&JsonRpcNotification::new(method, params))
            .send()
            .await
            .map_err(|e| send_error(&self.server_name, method, self.request_timeout, e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Transport {
                server: self.server_name.clone(),
                reason: format!("notification '{method}' failed: HTTP {}", resp.status()),
            })
        }
    }

    /// Terminate the server-side session, if one was established.
    pub async fn close(&self) -> Result<(), BackendError> {
        let Some(sid) = self.session_id.lock().take() else {
            return Ok(());
        };

        let result = self
            .http
            .delete(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, sid)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server_name, error = %e, "session delete failed");
        }
        Ok(())
    }

    fn post<T: Serialize>(&self, body: &T) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(body);

        if let Some(sid) = self.session_id.lock().as_deref() {
            req = req.header(SESSION_HEADER, sid);
        }
        req
    }

    fn invalid(&self, reason: String) -> BackendError {
        BackendError::InvalidResponse {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Legacy SSE ──────────────────────────────────────────────────────────────

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// MCP client transport over the legacy HTTP+SSE protocol.
///
/// A GET opens the event stream; its first `endpoint` event names the URL
/// requests are POSTed to. Responses come back as `message` events and are
/// matched to waiting callers by id.
pub struct SseTransport {
    server_name: String,
    http: HttpClient,
    post_url: Url,
    headers: HeaderMap,
    pending: PendingMap,
    /// Cleared once the event stream ends or the transport is closed.
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        name: &str,
        remote: &RemoteEndpoint<'_>,
        endpoint_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let stream_url = parse_url(name, remote.url)?;
        let headers = build_headers(name, remote)?;
        let connect_failed = |reason: String| BackendError::ConnectFailed {
            name: name.to_string(),
            reason,
        };

        // No overall timeout: the event stream stays open for the session.
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| connect_failed(format!("failed to build HTTP client: {e}")))?;

        let resp = http
            .get(stream_url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(connect_failed(format!("HTTP {}", resp.status())));
        }

        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_event_stream(
            name.to_string(),
            resp,
            pending.clone(),
            open.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(endpoint_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(connect_failed("event stream closed before endpoint event".into()));
            }
            Err(_) => {
                reader.abort();
                return Err(connect_failed(format!(
                    "no endpoint event within {}ms",
                    endpoint_timeout.as_millis()
                )));
            }
        };

        let post_url = match stream_url.join(&endpoint) {
            Ok(url) => url,
            Err(e) => {
                reader.abort();
                return Err(connect_failed(format!("invalid endpoint '{endpoint}': {e}")));
            }
        };

        tracing::debug!(server = name, post_url = %post_url, "sse session established");

        Ok(Self {
            server_name: name.to_string(),
            http,
            post_url,
            headers,
            pending,
            open,
            reader,
        })
    }

    /// POST a request and wait for its response on the event stream.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // Checked after registering: the reader clears `open` before it
        // drops the waiters, so one of the two always fails the request.
        if !self.open.load(Ordering::SeqCst) {
            return Err(self.stream_closed());
        }

        self.post(method, &JsonRpcRequest::new(id, method, params))
            .await?;

        rx.await.map_err(|_| self.stream_closed())
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        self.post(method, &JsonRpcNotification::new(method, params))
            .await
    }

    /// Stop reading the event stream; waiting callers see a transport error.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.pending.lock().clear();
    }

    fn stream_closed(&self) -> BackendError {
        BackendError::Transport {
            server: self.server_name.clone(),
            reason: "event stream closed before response arrived".into(),
        }
    }

    async fn post<T: Serialize>(&self, method: &str, body: &T) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(&self.server_name, method, CONNECT_TIMEOUT, e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Transport {
                server: self.server_name.clone(),
                reason: format!("POST '{method}' failed: HTTP {}", resp.status()),
            })
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a pending waiter when its request finishes or is cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Background task: route `message` events to waiters, report the endpoint.
async fn read_event_stream(
    name: String,
    response: reqwest::Response,
    pending: PendingMap,
    open: Arc<AtomicBool>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = SseBuffer::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "sse stream read error");
                break;
            }
        };

        for event in buffer.push(&bytes) {
            match event.kind() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(resp) => {
                        if let Some(waiter) = pending.lock().remove(&resp.id) {
                            let _ = waiter.send(resp);
                        }
                    }
                    Err(_) => {
                        tracing::trace!(server = %name, data = %event.data, "non-response sse message");
                    }
                },
                other => {
                    tracing::trace!(server = %name, event = other, "ignoring sse event");
                }
            }
        }
    }

    tracing::debug!(server = %name, "sse stream closed");
    open.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with an error.
    pending.lock().clear();
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn parse_url(name: &str, url: &str) -> Result<Url, BackendError> {
    Url::parse(url).map_err(|e| BackendError::ConnectFailed {
        name: name.to_string(),
        reason: format!("invalid url '{url}': {e}"),
    })
}

/// Turn configured headers plus the optional bearer token into a `HeaderMap`.
pub fn build_headers(name: &str, remote: &RemoteEndpoint<'_>) -> Result<HeaderMap, BackendError> {
    let invalid = |reason: String| BackendError::ConnectFailed {
        name: name.to_string(),
        reason,
    };

    let mut headers = HeaderMap::new();
    for (key, value) in remote.headers {
        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| invalid(format!("invalid header name '{key}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("invalid value for header '{key}': {e}")))?;
        headers.insert(header_name, header_value);
    }

    if let Some(token) = remote.bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| invalid(format!("invalid bearer token: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}

/// Classify a failed send. `timeout` is the client deadline that applies.
fn send_error(server: &str, method: &str, timeout: Duration, e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout {
            operation: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_connect() {
        BackendError::ConnectFailed {
            name: server.to_string(),
            reason: e.to_string(),
        }
    } else {
        BackendError::Transport {
            server: server.to_string(),
            reason: e.to_string(),
        }
    }
}
