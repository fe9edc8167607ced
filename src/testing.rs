//! Shared fakes for unit tests: a scripted model, an in-process tool server
//! connector and delegation launchers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::hierarchy::{ChildRunRequest, DelegationLauncher};
use crate::error::{OrchestrationError, Result};
use crate::llm::{ChatMessage, ChatResponse, LlmClient, TokenUsage, ToolCall, ToolDefinition};
use crate::mcp::{Connector, McpError, McpToolDescriptor, ToolServerConfig, ToolSession};
use crate::run::{Run, RunId, RunRequest, RunStatus};

#[derive(Default)]
struct FakeServer {
    tools: Vec<String>,
    reachable: bool,
    errors: HashMap<String, McpError>,
    connects: usize,
    closes: usize,
}

#[derive(Default)]
struct ConnectorState {
    servers: HashMap<String, FakeServer>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-process stand-in for tool servers, keyed by server name.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    delay: Option<Duration>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state(self, f: impl FnOnce(&mut ConnectorState)) -> Self {
        f(&mut self.state.lock().expect("fake connector lock"));
        self
    }

    pub fn with_server(self, name: &str, tools: &[&str]) -> Self {
        self.with_state(|s| {
            let server = s.servers.entry(name.to_string()).or_default();
            server.tools = tools.iter().map(|t| t.to_string()).collect();
            server.reachable = true;
        })
    }

    pub fn with_unreachable(self, name: &str) -> Self {
        self.with_state(|s| {
            s.servers.entry(name.to_string()).or_default().reachable = false;
        })
    }

    pub fn with_tool_error(self, server: &str, tool: &str, error: McpError) -> Self {
        self.with_state(|s| {
            s.servers
                .entry(server.to_string())
                .or_default()
                .errors
                .insert(tool.to_string(), error);
        })
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock().expect("fake connector lock");
        state.servers.entry(name.to_string()).or_default().reachable = reachable;
    }

    pub fn connect_count(&self, name: &str) -> usize {
        let state = self.state.lock().expect("fake connector lock");
        state.servers.get(name).map(|s| s.connects).unwrap_or(0)
    }

    pub fn closed_count(&self, name: &str) -> usize {
        let state = self.state.lock().expect("fake connector lock");
        state.servers.get(name).map(|s| s.closes).unwrap_or(0)
    }

    pub fn max_concurrent_connects(&self) -> usize {
        self.state.lock().expect("fake connector lock").max_in_flight
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> std::result::Result<Arc<dyn ToolSession>, McpError> {
        {
            let mut state = self.state.lock().expect("fake connector lock");
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().expect("fake connector lock");
        state.in_flight -= 1;
        let server = state.servers.entry(config.name.clone()).or_default();
        server.connects += 1;
        if !server.reachable {
            return Err(McpError::Transport(format!(
                "connection refused: {}",
                config.name
            )));
        }
        Ok(Arc::new(FakeSession {
            server: config.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    server: String,
    state: Arc<Mutex<ConnectorState>>,
}

#[async_trait]
impl ToolSession for FakeSession {
    async fn list_tools(&self) -> std::result::Result<Vec<McpToolDescriptor>, McpError> {
        let state = self.state.lock().expect("fake connector lock");
        let tools = state
            .servers
            .get(&self.server)
            .map(|s| s.tools.clone())
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .map(|name| McpToolDescriptor {
                description: format!("{} from {}", name, self.server),
                name,
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> std::result::Result<String, McpError> {
        let state = self.state.lock().expect("fake connector lock");
        if let Some(error) = state
            .servers
            .get(&self.server)
            .and_then(|s| s.errors.get(name))
        {
            return Err(error.clone());
        }
        Ok(format!("{} ok: {}", name, arguments))
    }

    async fn close(&self) {
        let mut state = self.state.lock().expect("fake connector lock");
        state.servers.entry(self.server.clone()).or_default().closes += 1;
    }
}

type Script =
    Box<dyn Fn(&[ChatMessage], &[ToolDefinition]) -> anyhow::Result<ChatResponse> + Send + Sync>;

/// Model whose replies are computed from the conversation so far.
pub struct ScriptedLlm {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[ChatMessage], &[ToolDefinition]) -> anyhow::Result<ChatResponse>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Replies in order, then "done" once exhausted.
    pub fn sequence(responses: Vec<ChatResponse>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_, _| {
            let next = queue.lock().expect("script lock").pop_front();
            Ok(next.unwrap_or_else(|| Self::text("done")))
        })
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: Some(content.to_string()),
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage::new(10, 5)),
            ..ChatResponse::default()
        }
    }

    /// `(call id, tool name, arguments)` triples.
    pub fn tool_calls(text: Option<&str>, calls: &[(&str, &str, Value)]) -> ChatResponse {
        ChatResponse {
            content: text.map(str::to_string),
            tool_calls: Some(
                calls
                    .iter()
                    .map(|(id, name, args)| ToolCall::function(*id, *name, args.to_string()))
                    .collect(),
            ),
            finish_reason: Some("tool_calls".to_string()),
            usage: Some(TokenUsage::new(10, 5)),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(messages, tools.unwrap_or(&[]))
    }
}

/// Launcher for agents that must never delegate.
pub struct RejectingLauncher;

#[async_trait]
impl DelegationLauncher for RejectingLauncher {
    async fn run_child(&self, request: ChildRunRequest) -> Result<Run> {
        Err(OrchestrationError::ConfigurationError(format!(
            "unexpected delegation to {}",
            request.agent
        )))
    }
}

/// Completes every child and remembers the requests. Ignores cancellation.
#[derive(Default)]
pub struct RecordingLauncher {
    requests: Mutex<Vec<ChildRunRequest>>,
    delay: Option<Duration>,
}

impl RecordingLauncher {
    /// Sleep before completing each child.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }


    pub fn launched(&self) -> usize {
        self.requests.lock().expect("launcher lock").len()
    }

    pub fn last_request(&self) -> Option<ChildRunRequest> {
        self.requests.lock().expect("launcher lock").last().cloned()
    }
}

#[async_trait]
impl DelegationLauncher for RecordingLauncher {
    async fn run_child(&self, request: ChildRunRequest) -> Result<Run> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut run = Run::queued(
            RunId::new(),
            &RunRequest::new(request.agent.clone(), request.task.clone()),
        )
        .with_parent(request.parent_run_id, request.chain.depth());
        run.status = RunStatus::Completed;
        run.final_output = Some(format!("{} did: {}", request.agent.agent, request.task));
        self.requests.lock().expect("launcher lock").push(request);
        Ok(run)
    }
}
