//! Per-environment pool of tool server connections.
//!
//! Each environment owns its own connection map and lock, so connecting or
//! calling in one environment never waits on another. Connections are never
//! handed out; callers go through [`ConnectionPool::tools`] and
//! [`ConnectionPool::call`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{Connector, McpError, ToolSession};
use super::types::*;
use crate::backoff::Backoff;
use crate::catalog::EnvironmentId;
use crate::config::PoolConfig;
use crate::error::{OrchestrationError, Result};

/// A tool exposed by a ready connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolTool {
    pub server: String,
    pub descriptor: McpToolDescriptor,
}

/// Outcome of [`ConnectionPool::connect`].
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Servers that are ready, sorted by name.
    pub ready: Vec<String>,
    /// Servers that could not be made ready, sorted by name.
    pub failed: Vec<(String, OrchestrationError)>,
}

struct PooledConnection {
    key: String,
    config: ToolServerConfig,
    state: ConnectionState,
    tools: Arc<Vec<McpToolDescriptor>>,
    session: Option<Arc<dyn ToolSession>>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    reconnecting: bool,
    /// Bumped whenever the slot is replaced; stale tasks compare and bail.
    generation: u64,
    tool_calls: u64,
    tool_errors: u64,
}

impl PooledConnection {
    fn connecting(config: ToolServerConfig, key: String, generation: u64) -> Self {
        Self {
            key,
            config,
            state: ConnectionState::Connecting,
            tools: Arc::new(Vec::new()),
            session: None,
            last_error: None,
            connected_at: None,
            reconnect_attempts: 0,
            reconnecting: false,
            generation,
            tool_calls: 0,
            tool_errors: 0,
        }
    }

    fn mark_ready(&mut self, session: Arc<dyn ToolSession>, tools: Vec<McpToolDescriptor>) {
        self.state = ConnectionState::Ready;
        self.session = Some(session);
        self.tools = Arc::new(tools);
        self.last_error = None;
        self.connected_at = Some(Utc::now());
        self.reconnect_attempts = 0;
        self.reconnecting = false;
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            server: self.config.name.clone(),
            key: self.key.clone(),
            state: self.state,
            tools: self.tools.iter().map(|t| t.name.clone()).collect(),
            last_error: self.last_error.clone(),
            connected_at: self.connected_at,
            reconnect_attempts: self.reconnect_attempts,
            tool_calls: self.tool_calls,
            tool_errors: self.tool_errors,
        }
    }
}

struct EnvironmentConnections {
    id: EnvironmentId,
    /// Keyed by server name; BTreeMap gives the deterministic tool order.
    connections: RwLock<BTreeMap<String, PooledConnection>>,
    /// Stops reconnect loops when the environment is closed.
    cancel: CancellationToken,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    environments: RwLock<HashMap<EnvironmentId, Arc<EnvironmentConnections>>>,
    generation: AtomicU64,
}

/// Live connections to tool servers, grouped by environment.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Stable identity of a resolved config: name plus a hash of its contents.
pub fn connection_key(config: &ToolServerConfig) -> String {
    // Going through Value sorts map keys, so HashMap order does not leak in.
    let canonical = serde_json::to_value(config)
        .and_then(|v| serde_json::to_vec(&v))
        .unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("{}:{}", config.name, &hex::encode(digest)[..12])
}

/// Substitute `{{ .Name }}` / `{{Name}}` placeholders from environment variables.
pub fn resolve_config(
    config: &ToolServerConfig,
    variables: &HashMap<String, String>,
) -> Result<ToolServerConfig> {
    let pattern = Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .map_err(|e| OrchestrationError::ConfigurationError(e.to_string()))?;

    let render = |input: &str| -> Result<String> {
        let mut missing = None;
        let rendered = pattern.replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(OrchestrationError::ConfigurationError(format!(
                "tool server '{}' references undefined variable '{}'",
                config.name, name
            ))),
            None => Ok(rendered.into_owned()),
        }
    };

    let transport = match &config.transport {
        McpTransport::Http { url, headers } => McpTransport::Http {
            url: render(url)?,
            headers: headers
                .iter()
                .map(|(k, v)| Ok((k.clone(), render(v)?)))
                .collect::<Result<_>>()?,
        },
        McpTransport::Stdio { command, args, env } => McpTransport::Stdio {
            command: render(command)?,
            args: args.iter().map(|a| render(a)).collect::<Result<_>>()?,
            env: env
                .iter()
                .map(|(k, v)| Ok((k.clone(), render(v)?)))
                .collect::<Result<_>>()?,
        },
    };

    Ok(ToolServerConfig {
        name: config.name.clone(),
        transport,
        enabled: config.enabled,
    })
}

type Discovered = std::result::Result<(Arc<dyn ToolSession>, Vec<McpToolDescriptor>), McpError>;

impl PoolInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Handshake plus tools/list, bounded by the discovery timeout.
    async fn discover(&self, config: &ToolServerConfig) -> Discovered {
        let attempt = async {
            let session = self.connector.connect(config).await?;
            match session.list_tools().await {
                Ok(tools) => Ok((session, tools)),
                Err(e) => {
                    session.close().await;
                    Err(e)
                }
            }
        };
        match tokio::time::timeout(self.config.discovery_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(self.config.discovery_timeout)),
        }
    }
}

fn spawn_reconnect(
    inner: Arc<PoolInner>,
    env: Arc<EnvironmentConnections>,
    server: String,
    generation: u64,
) {
    tokio::spawn(async move {
        let backoff = Backoff::new(inner.config.reconnect_base, inner.config.reconnect_max);
        let mut attempt = 0u32;
        loop {
            let delay = backoff.delay(attempt);
            tokio::select! {
                _ = env.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let config = {
                let conns = env.connections.read().await;
                match conns.get(&server) {
                    Some(c) if c.generation == generation && c.state == ConnectionState::Degraded => {
                        c.config.clone()
                    }
                    _ => return,
                }
            };

            let result = tokio::select! {
                _ = env.cancel.cancelled() => return,
                r = inner.discover(&config) => r,
            };

            let stale = {
                let mut conns = env.connections.write().await;
                match (
                    conns.get_mut(&server).filter(|c| c.generation == generation),
                    result,
                ) {
                    (Some(conn), Ok((session, tools))) => {
                        info!(
                            environment = %env.id,
                            server = %server,
                            tools = tools.len(),
                            attempts = attempt + 1,
                            "Tool server reconnected"
                        );
                        conn.mark_ready(session, tools);
                        return;
                    }
                    (Some(conn), Err(e)) => {
                        conn.reconnect_attempts = conn.reconnect_attempts.saturating_add(1);
                        conn.last_error = Some(e.to_string());
                        debug!(
                            environment = %env.id,
                            server = %server,
                            attempt = attempt + 1,
                            "Reconnect failed: {}",
                            e
                        );
                        None
                    }
                    // Replaced or removed while we were connecting.
                    (None, Ok((session, _))) => Some(session),
                    (None, Err(_)) => return,
                }
            };
            if let Some(session) = stale {
                session.close().await;
                return;
            }
            attempt = attempt.saturating_add(1);
        }
    });
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                environments: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    async fn environment(&self, id: &EnvironmentId) -> Option<Arc<EnvironmentConnections>> {
        self.inner.environments.read().await.get(id).cloned()
    }

    async fn environment_or_create(&self, id: &EnvironmentId) -> Arc<EnvironmentConnections> {
        let mut envs = self.inner.environments.write().await;
        Arc::clone(envs.entry(id.clone()).or_insert_with(|| {
            Arc::new(EnvironmentConnections {
                id: id.clone(),
                connections: RwLock::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
            })
        }))
    }

    /// Connect without template variables.
    pub async fn connect(
        &self,
        environment: &EnvironmentId,
        configs: Vec<ToolServerConfig>,
    ) -> ConnectReport {
        self.connect_with_variables(environment, configs, &HashMap::new())
            .await
    }

    /// Bring the environment's connections in line with `configs`.
    ///
    /// Ready connections whose resolved config is unchanged are reused,
    /// servers missing from `configs` are closed, everything else is
    /// (re)connected concurrently. Returns once every attempt finished.
    pub async fn connect_with_variables(
        &self,
        environment: &EnvironmentId,
        configs: Vec<ToolServerConfig>,
        variables: &HashMap<String, String>,
    ) -> ConnectReport {
        let mut report = ConnectReport::default();
        let env = self.environment_or_create(environment).await;

        // Templating runs on the blocking pool, at most `config_workers` at a time.
        let variables = Arc::new(variables.clone());
        let resolved: Vec<(String, Result<ToolServerConfig>)> = stream::iter(
            configs.into_iter().filter(|c| c.enabled),
        )
        .map(|config| {
            let variables = Arc::clone(&variables);
            async move {
                let name = config.name.clone();
                let resolved =
                    tokio::task::spawn_blocking(move || resolve_config(&config, &variables))
                        .await
                        .unwrap_or_else(|e| {
                            Err(OrchestrationError::ConfigurationError(format!(
                                "config resolution aborted: {}",
                                e
                            )))
                        });
                (name, resolved)
            }
        })
        .buffer_unordered(self.inner.config.config_workers)
        .collect()
        .await;

        let mut wanted: BTreeMap<String, (ToolServerConfig, String)> = BTreeMap::new();
        for (name, result) in resolved {
            match result {
                Ok(config) => {
                    let key = connection_key(&config);
                    if let Some((_, existing)) = wanted.get(&name) {
                        if *existing != key {
                            warn!(environment = %environment, server = %name, "Duplicate tool server name, keeping first");
                        }
                        continue;
                    }
                    wanted.insert(name, (config, key));
                }
                Err(e) => {
                    warn!(environment = %environment, server = %name, "Config resolution failed: {}", e);
                    report.failed.push((name, e));
                }
            }
        }

        let mut to_close = Vec::new();
        let mut to_connect = Vec::new();
        {
            let mut conns = env.connections.write().await;
            conns.retain(|name, conn| {
                if wanted.contains_key(name) {
                    return true;
                }
                if let Some(session) = conn.session.take() {
                    to_close.push(session);
                }
                false
            });

            for (name, (config, key)) in wanted {
                if let Some(existing) = conns.get(&name) {
                    if existing.key == key && existing.state == ConnectionState::Ready {
                        debug!(environment = %environment, server = %name, "Reusing ready connection");
                        report.ready.push(name);
                        continue;
                    }
                }
                if let Some(mut old) = conns.remove(&name) {
                    if let Some(session) = old.session.take() {
                        to_close.push(session);
                    }
                }
                let generation = self.inner.next_generation();
                conns.insert(
                    name,
                    PooledConnection::connecting(config.clone(), key, generation),
                );
                to_connect.push((config, generation));
            }
        }

        for session in to_close {
            session.close().await;
        }

        let inner = &self.inner;
        let results: Vec<(ToolServerConfig, u64, Discovered)> = stream::iter(to_connect)
            .map(|(config, generation)| async move {
                let result = inner.discover(&config).await;
                (config, generation, result)
            })
            .buffer_unordered(self.inner.config.connect_workers)
            .collect()
            .await;

        let mut stale = Vec::new();
        {
            let mut conns = env.connections.write().await;
            for (config, generation, result) in results {
                let name = config.name.clone();
                let Some(conn) = conns
                    .get_mut(&name)
                    .filter(|c| c.generation == generation)
                else {
                    if let Ok((session, _)) = result {
                        stale.push(session);
                    }
                    continue;
                };
                match result {
                    Ok((session, tools)) => {
                        info!(
                            environment = %environment,
                            server = %name,
                            tools = tools.len(),
                            "Tool server ready"
                        );
                        conn.mark_ready(session, tools);
                        report.ready.push(name);
                    }
                    Err(e) => {
                        warn!(
                            environment = %environment,
                            server = %name,
                            "Tool server unavailable, will retry in background: {}",
                            e
                        );
                        conn.state = ConnectionState::Degraded;
                        conn.last_error = Some(e.to_string());
                        conn.reconnecting = true;
                        spawn_reconnect(
                            Arc::clone(&self.inner),
                            Arc::clone(&env),
                            name.clone(),
                            generation,
                        );
                        report.failed.push((
                            name.clone(),
                            OrchestrationError::ConnectionUnavailable {
                                server: name,
                                message: e.to_string(),
                            },
                        ));
                    }
                }
            }
        }
        for session in stale {
            session.close().await;
        }

        report.ready.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Tools of every ready connection, ordered by server name then
    /// discovery order. The first server wins on duplicate tool names.
    pub async fn tools(&self, environment: &EnvironmentId) -> Vec<PoolTool> {
        let Some(env) = self.environment(environment).await else {
            return Vec::new();
        };
        let conns = env.connections.read().await;
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for (server, conn) in conns.iter() {
            if conn.state != ConnectionState::Ready {
                continue;
            }
            for descriptor in conn.tools.iter() {
                if !seen.insert(descriptor.name.clone()) {
                    warn!(
                        environment = %environment,
                        server = %server,
                        tool = %descriptor.name,
                        "Duplicate tool name, shadowed by an earlier server"
                    );
                    continue;
                }
                tools.push(PoolTool {
                    server: server.clone(),
                    descriptor: descriptor.clone(),
                });
            }
        }
        tools
    }

    /// Route a call to the ready connection exposing `tool`.
    pub async fn call(
        &self,
        environment: &EnvironmentId,
        tool: &str,
        input: Value,
    ) -> Result<String> {
        let env = self
            .environment(environment)
            .await
            .ok_or_else(|| OrchestrationError::ToolNotFound(tool.to_string()))?;

        let (server, generation, session) = {
            let conns = env.connections.read().await;
            conns
                .iter()
                .filter(|(_, c)| c.state == ConnectionState::Ready)
                .find(|(_, c)| c.tools.iter().any(|t| t.name == tool))
                .and_then(|(name, c)| {
                    c.session
                        .clone()
                        .map(|session| (name.clone(), c.generation, session))
                })
                .ok_or_else(|| OrchestrationError::ToolNotFound(tool.to_string()))?
        };

        let timeout = self.inner.config.call_timeout;
        let result = match tokio::time::timeout(timeout, session.call_tool(tool, input)).await {
            Ok(r) => r,
            Err(_) => Err(McpError::Timeout(timeout)),
        };

        let mut closing = None;
        {
            let mut conns = env.connections.write().await;
            if let Some(conn) = conns
                .get_mut(&server)
                .filter(|c| c.generation == generation)
            {
                match &result {
                    Ok(_) => conn.tool_calls += 1,
                    Err(e) => {
                        conn.tool_errors += 1;
                        if e.is_transport() && conn.state == ConnectionState::Ready {
                            warn!(
                                environment = %environment,
                                server = %server,
                                "Connection degraded after failed call: {}",
                                e
                            );
                            conn.state = ConnectionState::Degraded;
                            conn.last_error = Some(e.to_string());
                            closing = conn.session.take();
                            if !conn.reconnecting {
                                conn.reconnecting = true;
                                spawn_reconnect(
                                    Arc::clone(&self.inner),
                                    Arc::clone(&env),
                                    server.clone(),
                                    generation,
                                );
                            }
                        }
                    }
                }
            }
        }
        if let Some(session) = closing {
            session.close().await;
        }

        result.map_err(|e| OrchestrationError::ToolCallFailed {
            tool: tool.to_string(),
            message: e.to_string(),
        })
    }

    /// Snapshot of every connection in the environment.
    pub async fn status(&self, environment: &EnvironmentId) -> Vec<ConnectionStatus> {
        match self.environment(environment).await {
            Some(env) => env
                .connections
                .read()
                .await
                .values()
                .map(PooledConnection::status)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Release every connection of an environment. Idempotent.
    pub async fn close(&self, environment: &EnvironmentId) {
        let Some(env) = self.inner.environments.write().await.remove(environment) else {
            return;
        };
        env.cancel.cancel();
        let sessions: Vec<_> = {
            let mut conns = env.connections.write().await;
            conns
                .values_mut()
                .filter_map(|c| {
                    c.state = ConnectionState::Closed;
                    c.session.take()
                })
                .collect()
        };
        for session in sessions {
            session.close().await;
        }
        info!(environment = %environment, "Closed tool server connections");
    }

    /// Close every environment.
    pub async fn shutdown(&self) {
        let ids: Vec<EnvironmentId> = self.inner.environments.read().await.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;
    use std::time::Duration;

    fn pool_config() -> PoolConfig {
        PoolConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    fn env() -> EnvironmentId {
        EnvironmentId::new("default")
    }

    #[tokio::test]
    async fn test_one_unreachable_server_yields_n_minus_one_ready() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", &["a1"])
                .with_server("beta", &["b1"])
                .with_server("gamma", &["g1"])
                .with_unreachable("broken"),
        );
        let pool = ConnectionPool::new(connector, pool_config());
        let configs = ["alpha", "beta", "broken", "gamma"]
            .iter()
            .map(|n| ToolServerConfig::http(*n, format!("http://{}.local", n)))
            .collect();

        let report = pool.connect(&env(), configs).await;

        assert_eq!(report.ready, vec!["alpha", "beta", "gamma"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(
            report.failed[0].1.kind(),
            crate::error::ErrorKind::ConnectionUnavailable
        );

        let names: Vec<_> = pool
            .tools(&env())
            .await
            .into_iter()
            .map(|t| t.descriptor.name)
            .collect();
        assert_eq!(names, vec!["a1", "b1", "g1"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_respects_worker_limit() {
        let mut connector = FakeConnector::new().with_connect_delay(Duration::from_millis(20));
        let mut configs = Vec::new();
        for i in 0..6 {
            let name = format!("s{}", i);
            connector = connector.with_server(&name, &[]);
            configs.push(ToolServerConfig::http(name, "http://x"));
        }
        let connector = Arc::new(connector);
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolConfig {
                connect_workers: 2,
                ..pool_config()
            },
        );

        let report = pool.connect(&env(), configs).await;
        assert_eq!(report.ready.len(), 6);
        assert!(connector.max_concurrent_connects() <= 2);
    }

    #[tokio::test]
    async fn test_unresolved_template_fails_only_that_server() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", &["a1"])
                .with_server("beta", &["b1"])
                .with_server("gamma", &["g1"]),
        );
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolConfig {
                config_workers: 1,
                ..pool_config()
            },
        );
        let mut variables = HashMap::new();
        variables.insert("HOST".to_string(), "tools.local".to_string());
        let configs = vec![
            ToolServerConfig::http("alpha", "http://{{ .HOST }}/alpha"),
            ToolServerConfig::http("beta", "http://{{ .MISSING }}/beta"),
            ToolServerConfig::http("gamma", "http://{{HOST}}/gamma"),
        ];

        let report = pool
            .connect_with_variables(&env(), configs, &variables)
            .await;

        assert_eq!(report.ready, vec!["alpha", "gamma"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "beta");
        assert_eq!(
            report.failed[0].1.kind(),
            crate::error::ErrorKind::ConfigurationError
        );
        assert_eq!(connector.connect_count("beta"), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_routes_and_reports_errors() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", &["echo"])
                .with_tool_error("alpha", "echo", McpError::Tool("bad input".into())),
        );
        let pool = ConnectionPool::new(connector, pool_config());
        pool.connect(&env(), vec![ToolServerConfig::http("alpha", "http://a")])
            .await;

        let missing = pool.call(&env(), "nope", serde_json::json!({})).await;
        assert!(matches!(missing, Err(OrchestrationError::ToolNotFound(_))));

        let failed = pool.call(&env(), "echo", serde_json::json!({})).await;
        match failed {
            Err(OrchestrationError::ToolCallFailed { tool, message }) => {
                assert_eq!(tool, "echo");
                assert!(message.contains("bad input"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Tool-level errors keep the connection ready.
        let status = pool.status(&env()).await;
        assert_eq!(status[0].state, ConnectionState::Ready);
        assert_eq!(status[0].tool_errors, 1);
    }

    #[tokio::test]
    async fn test_degraded_server_reconnects_in_background() {
        let connector = Arc::new(FakeConnector::new().with_server("alpha", &["echo"]));
        connector.set_reachable("alpha", false);
        let pool = ConnectionPool::new(connector.clone(), pool_config());

        let report = pool
            .connect(&env(), vec![ToolServerConfig::http("alpha", "http://a")])
            .await;
        assert_eq!(report.failed.len(), 1);
        assert!(pool.tools(&env()).await.is_empty());

        connector.set_reachable("alpha", true);
        let mut ready = false;
        for _ in 0..100 {
            if !pool.tools(&env()).await.is_empty() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready, "connection never recovered");
        let output = pool
            .call(&env(), "echo", serde_json::json!({"x": 1}))
            .await
            .expect("call after reconnect");
        assert!(output.contains("echo"));
        pool.close(&env()).await;
    }

    #[tokio::test]
    async fn test_transport_failure_degrades_connection() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", &["echo"])
                .with_tool_error("alpha", "echo", McpError::Transport("pipe closed".into())),
        );
        let pool = ConnectionPool::new(connector.clone(), pool_config());
        pool.connect(&env(), vec![ToolServerConfig::http("alpha", "http://a")])
            .await;

        let result = pool.call(&env(), "echo", serde_json::json!({})).await;
        assert!(matches!(result, Err(OrchestrationError::ToolCallFailed { .. })));
        assert_eq!(connector.closed_count("alpha"), 1);

        // The background loop opens a fresh session.
        let mut reconnected = false;
        for _ in 0..100 {
            if connector.connect_count("alpha") >= 2 {
                reconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconnected, "degraded connection was not retried");
        pool.close(&env()).await;
    }

    #[tokio::test]
    async fn test_reconnect_reuses_unchanged_and_closes_removed() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", &["a1"])
                .with_server("beta", &["b1"]),
        );
        let pool = ConnectionPool::new(connector.clone(), pool_config());
        let both = vec![
            ToolServerConfig::http("alpha", "http://a"),
            ToolServerConfig::http("beta", "http://b"),
        ];
        pool.connect(&env(), both).await;
        assert_eq!(connector.connect_count("alpha"), 1);

        let report = pool
            .connect(&env(), vec![ToolServerConfig::http("alpha", "http://a")])
            .await;
        assert_eq!(report.ready, vec!["alpha"]);
        assert_eq!(connector.connect_count("alpha"), 1, "unchanged config reconnected");
        assert_eq!(connector.closed_count("beta"), 1);
        assert_eq!(pool.status(&env()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = Arc::new(FakeConnector::new().with_server("alpha", &["a1"]));
        let pool = ConnectionPool::new(connector.clone(), pool_config());
        pool.connect(&env(), vec![ToolServerConfig::http("alpha", "http://a")])
            .await;

        pool.close(&env()).await;
        pool.close(&env()).await;
        assert!(pool.tools(&env()).await.is_empty());
        assert_eq!(connector.closed_count("alpha"), 1);
    }

    #[test]
    fn test_resolve_config_templates() {
        let mut variables = HashMap::new();
        variables.insert("ROOT".to_string(), "/srv".to_string());
        variables.insert("TOKEN".to_string(), "s3cret".to_string());

        let mut config = ToolServerConfig::stdio(
            "files",
            "mcp-files",
            vec!["--root".into(), "{{ .ROOT }}/data".into()],
        );
        if let McpTransport::Stdio { env, .. } = &mut config.transport {
            env.insert("API_TOKEN".into(), "{{TOKEN}}".into());
        }

        let resolved = resolve_config(&config, &variables).expect("resolve");
        match resolved.transport {
            McpTransport::Stdio { args, env, .. } => {
                assert_eq!(args[1], "/srv/data");
                assert_eq!(env["API_TOKEN"], "s3cret");
            }
            other => panic!("unexpected {:?}", other),
        }

        let bad = ToolServerConfig::http("web", "http://{{ .HOST }}/mcp");
        let err = resolve_config(&bad, &variables).expect_err("undefined variable");
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_connection_key_stable_across_header_order() {
        let mut a = ToolServerConfig::http("web", "http://x");
        let mut b = ToolServerConfig::http("web", "http://x");
        if let (McpTransport::Http { headers: ha, .. }, McpTransport::Http { headers: hb, .. }) =
            (&mut a.transport, &mut b.transport)
        {
            ha.insert("A".into(), "1".into());
            ha.insert("B".into(), "2".into());
            hb.insert("B".into(), "2".into());
            hb.insert("A".into(), "1".into());
        }
        assert_eq!(connection_key(&a), connection_key(&b));
        assert!(connection_key(&a).starts_with("web:"));
        assert_ne!(
            connection_key(&a),
            connection_key(&ToolServerConfig::http("web", "http://y"))
        );
    }
}
