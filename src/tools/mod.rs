//! Tool system for a run.
//!
//! A [`ToolRegistry`] is built once per run from two immutable inputs: the
//! pool's ready tools (filtered to what the agent declares) and the
//! delegation tools synthesized for the agent's children. It is never
//! mutated afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agents::hierarchy::{DelegationChain, DelegationLauncher, HierarchyResolver};
use crate::catalog::{AgentDefinition, EnvironmentId};
use crate::error::{OrchestrationError, Result};
use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::mcp::{ConnectionPool, McpToolDescriptor};
use crate::run::RunId;

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub environment: EnvironmentId,
    /// Cancelled when the calling run is cancelled or times out.
    pub cancel: CancellationToken,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// A tool served by a pooled tool server connection.
pub struct PooledTool {
    pool: ConnectionPool,
    environment: EnvironmentId,
    descriptor: McpToolDescriptor,
}

impl PooledTool {
    pub fn new(
        pool: ConnectionPool,
        environment: EnvironmentId,
        descriptor: McpToolDescriptor,
    ) -> Self {
        Self {
            pool,
            environment,
            descriptor,
        }
    }
}

#[async_trait]
impl Tool for PooledTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters_schema(&self) -> Value {
        if self.descriptor.input_schema.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            self.descriptor.input_schema.clone()
        }
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        self.pool
            .call(&self.environment, &self.descriptor.name, args)
            .await
    }
}

/// Flat, immutable tool namespace for one run.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    warnings: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("warnings", &self.warnings)
            .finish()
    }
}

impl ToolRegistry {
    /// Assemble the registry for `agent`.
    ///
    /// Delegation structure errors (cycle, depth, collisions, unknown
    /// children) are fatal. Declared tools that no ready server exposes only
    /// produce warnings.
    pub async fn build(
        agent: &AgentDefinition,
        chain: &DelegationChain,
        pool: &ConnectionPool,
        resolver: &HierarchyResolver,
        launcher: Arc<dyn DelegationLauncher>,
    ) -> Result<Self> {
        let delegation = resolver.resolve(agent, chain, launcher)?;

        let available: BTreeMap<String, McpToolDescriptor> = pool
            .tools(&agent.environment)
            .await
            .into_iter()
            .map(|t| (t.descriptor.name.clone(), t.descriptor))
            .collect();

        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        let mut warnings = Vec::new();
        let mut declared = std::collections::HashSet::new();
        for name in &agent.tools {
            if !declared.insert(name.as_str()) {
                continue;
            }
            match available.get(name) {
                Some(descriptor) => tools.push(Arc::new(PooledTool::new(
                    pool.clone(),
                    agent.environment.clone(),
                    descriptor.clone(),
                ))),
                None => warnings.push(format!(
                    "tool '{}' is not available in environment '{}'",
                    name, agent.environment
                )),
            }
        }
        tools.extend(delegation);

        let mut registry = Self::from_tools(tools)?;
        registry.warnings = warnings;
        tracing::debug!(
            agent = %agent.id,
            tools = registry.tools.len(),
            warnings = registry.warnings.len(),
            "Built tool registry"
        );
        Ok(registry)
    }

    /// Registry over an explicit tool list; duplicate names are an error.
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_some() {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "duplicate tool name '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            tools: map,
            warnings: Vec::new(),
        })
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Get tool schemas in LLM-compatible format, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(name.to_string()))?;
        tool.execute(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, StaticCatalog};
    use crate::config::PoolConfig;
    use crate::mcp::ToolServerConfig;
    use crate::testing::{FakeConnector, RejectingLauncher};

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: RunId::new(),
            environment: "default".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_build_filters_to_declared_and_warns_on_missing() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("files", &["read_file", "write_file"])
                .with_unreachable("web"),
        );
        let pool = ConnectionPool::new(connector, PoolConfig::default());
        pool.connect(
            &"default".into(),
            vec![
                ToolServerConfig::http("files", "http://files"),
                ToolServerConfig::http("web", "http://web"),
            ],
        )
        .await;

        let agent = crate::catalog::AgentDefinition::new("default", "writer", "Write.")
            .with_tools(["read_file", "fetch_url"]);
        let catalog: Arc<dyn Catalog> = Arc::new(StaticCatalog::new().with_agent(agent.clone()));
        let resolver = HierarchyResolver::new(catalog, 10);

        let registry = ToolRegistry::build(
            &agent,
            &DelegationChain::root(&agent.id),
            &pool,
            &resolver,
            Arc::new(RejectingLauncher),
        )
        .await
        .expect("Failed to build registry");

        assert_eq!(registry.names(), vec!["read_file"]);
        assert_eq!(registry.warnings().len(), 1);
        assert!(registry.warnings()[0].contains("fetch_url"));

        let output = registry
            .execute("read_file", serde_json::json!({"path": "a"}), &ctx())
            .await
            .expect("Failed to execute");
        assert!(output.contains("read_file"));

        let missing = registry
            .execute("write_file", serde_json::json!({}), &ctx())
            .await;
        assert!(matches!(missing, Err(OrchestrationError::ToolNotFound(_))));
    }
}
