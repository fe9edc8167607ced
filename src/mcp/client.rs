//! MCP client sessions over HTTP and stdio.
//!
//! The pool only talks to [`Connector`] and [`ToolSession`]; tests swap in
//! fakes at that seam.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::*;

/// MCP protocol version we support
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server could not be reached or the stream broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with something we could not use.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The tool ran and reported `isError: true`.
    #[error("{0}")]
    Tool(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("session closed")]
    Closed,
}

impl McpError {
    /// Failures that say the connection itself is unhealthy.
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport(_) | McpError::Closed)
    }
}

/// A live, initialized session with one tool server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDescriptor>, McpError>;

    /// Call a tool; returns the joined text content.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpError>;

    async fn close(&self);
}

/// Opens sessions from resolved configs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolSession>, McpError>;
}

/// Request/response plumbing shared by both transports.
#[async_trait]
trait JsonRpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str) -> Result<(), McpError>;

    async fn shutdown(&self);
}

struct McpSession<T> {
    server: String,
    transport: T,
}

impl<T: JsonRpcTransport> McpSession<T> {
    async fn initialize(server: String, transport: T) -> Result<Self, McpError> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: "agentd".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(params).map_err(|e| McpError::Protocol(e.to_string()))?;
        let result = transport.request("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        debug!(
            server = %server,
            protocol = %init.protocol_version,
            remote = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            "MCP session initialized"
        );

        // Some servers require it, none answer it.
        if let Err(e) = transport.notify("notifications/initialized").await {
            debug!(server = %server, "initialized notification failed: {}", e);
        }

        Ok(Self { server, transport })
    }
}

#[async_trait]
impl<T: JsonRpcTransport> ToolSession for McpSession<T> {
    async fn list_tools(&self) -> Result<Vec<McpToolDescriptor>, McpError> {
        let result = self.transport.request("tools/list", None).await?;
        let response: McpToolsResponse =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        Ok(response.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        let result = self.transport.request("tools/call", Some(params)).await?;
        let response: McpCallToolResponse =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        if response.is_error {
            return Err(McpError::Tool(response.text()));
        }
        Ok(response.text())
    }

    async fn close(&self) {
        debug!(server = %self.server, "Closing MCP session");
        self.transport.shutdown().await;
    }
}

fn decode_response(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::Protocol(format!(
            "JSON-RPC error {}: {}",
            error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| McpError::Protocol("No result in response".to_string()))
}

// ==================== HTTP ====================

struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    request_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    fn post(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

#[async_trait]
impl JsonRpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let request = JsonRpcRequest::new(
            self.request_id.fetch_add(1, Ordering::SeqCst),
            method,
            params,
        );

        let response = self
            .post()
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", response.status())));
        }

        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        decode_response(response)
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.post()
            .json(&JsonRpcNotification::new(method))
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ==================== stdio ====================

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Drops a request's waiter when its future completes or is dropped.
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
    request_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            });
        }

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => dispatch_line(&server, &line, &pending),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(server = %server, "stdout read failed: {}", e);
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with `Closed`.
                if let Ok(mut pending) = pending.lock() {
                    pending.clear();
                }
                debug!(server = %server, "MCP stdout closed");
            })
        };

        Ok(Self {
            stdin: Mutex::new(stdin),
            pending,
            child: Mutex::new(Some(child)),
            reader,
            request_id: AtomicU64::new(1),
            closed,
        })
    }

    async fn write_line(&self, payload: &impl serde::Serialize) -> Result<(), McpError> {
        let mut line =
            serde_json::to_string(payload).map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }
}

fn dispatch_line(server: &str, line: &str, pending: &PendingMap) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            debug!(server = %server, "ignoring non-JSON output: {}", line);
            return;
        }
    };
    // Server-initiated requests and notifications carry a method.
    if value.get("method").is_some() {
        return;
    }
    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            warn!(server = %server, "malformed JSON-RPC response: {}", e);
            return;
        }
    };
    let Some(id) = response.id else {
        return;
    };
    let sender = pending.lock().ok().and_then(|mut map| map.remove(&id));
    if let Some(sender) = sender {
        let _ = sender.send(response);
    }
}

#[async_trait]
impl JsonRpcTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| McpError::Closed)?
            .insert(id, tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        self.write_line(&JsonRpcRequest::new(id, method, params))
            .await?;
        let response = rx.await.map_err(|_| McpError::Closed)?;
        decode_response(response)
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.write_line(&JsonRpcNotification::new(method)).await
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.reader.abort();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

/// Connector for real MCP servers.
pub struct McpConnector {
    client: reqwest::Client,
}

impl McpConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for McpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolSession>, McpError> {
        match &config.transport {
            McpTransport::Http { url, headers } => {
                let transport = HttpTransport {
                    client: self.client.clone(),
                    url: url.trim_end_matches('/').to_string(),
                    headers: headers.clone(),
                    request_id: AtomicU64::new(1),
                    closed: AtomicBool::new(false),
                };
                let session = McpSession::initialize(config.name.clone(), transport).await?;
                Ok(Arc::new(session))
            }
            McpTransport::Stdio { command, args, env } => {
                // On handshake failure the child is killed when the transport drops.
                let transport = StdioTransport::spawn(&config.name, command, args, env)?;
                let session = McpSession::initialize(config.name.clone(), transport).await?;
                Ok(Arc::new(session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(McpError::Transport("reset".into()).is_transport());
        assert!(McpError::Closed.is_transport());
        assert!(!McpError::Tool("bad input".into()).is_transport());
        assert!(!McpError::Protocol("garbled".into()).is_transport());
    }

    #[test]
    fn test_dispatch_line_routes_by_id() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().expect("lock").insert(7, tx);

        dispatch_line("srv", r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, &pending);
        dispatch_line("srv", "not json", &pending);
        assert!(rx.try_recv().is_err());

        dispatch_line("srv", r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#, &pending);
        let response = rx.try_recv().expect("response delivered");
        assert!(response.result.is_some());
        assert!(pending.lock().expect("lock").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_stdio_request_leaves_no_waiter() {
        // `cat` echoes the request back; a message with a method is never a reply.
        let transport =
            StdioTransport::spawn("echo", "cat", &[], &HashMap::new()).expect("spawn cat");

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            transport.request("tools/list", None),
        )
        .await;
        assert!(result.is_err(), "request should still be waiting");
        assert!(transport.pending.lock().expect("lock").is_empty());

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure_is_transport_error() {
        let connector = McpConnector::new();
        let config = ToolServerConfig::stdio("ghost", "/nonexistent/mcp-server-binary", vec![]);
        match connector.connect(&config).await {
            Err(e) => assert!(e.is_transport(), "unexpected error {:?}", e),
            Ok(_) => panic!("spawning a missing binary should fail"),
        }
    }
}
