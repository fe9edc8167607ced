//! Delegation: child agents exposed to their parent as tools.
//!
//! The resolver validates an agent's whole delegation subtree against the
//! catalog before synthesizing any tool, so a cycle or an over-deep chain is
//! reported before a single nested run is enqueued.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::{AgentDefinition, AgentId, AgentRef, Catalog};
use crate::error::{OrchestrationError, Result};
use crate::run::{Run, RunId, RunStatus};
use crate::tools::{Tool, ToolContext};

/// Prefix of every synthesized delegation tool.
pub const AGENT_TOOL_PREFIX: &str = "__agent_";

/// Longest task text accepted by a delegation tool.
pub const MAX_TASK_CHARS: usize = 10_000;

/// Position of a run in its delegation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationChain {
    depth: u32,
    /// Agents on the path from the root, root first.
    visited: Vec<AgentId>,
}

impl DelegationChain {
    pub fn root(agent: &AgentId) -> Self {
        Self {
            depth: 0,
            visited: vec![agent.clone()],
        }
    }

    /// Delegation edges between the root run and this one.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.visited.contains(agent)
    }

    pub fn descend(&self, child: &AgentId) -> Self {
        let mut visited = self.visited.clone();
        visited.push(child.clone());
        Self {
            depth: self.depth + 1,
            visited,
        }
    }

    fn path_to(&self, agent: &AgentId) -> Vec<String> {
        self.visited
            .iter()
            .chain(std::iter::once(agent))
            .map(|a| a.to_string())
            .collect()
    }
}

/// Nested run requested by a delegation tool.
#[derive(Debug, Clone)]
pub struct ChildRunRequest {
    pub parent_run_id: RunId,
    pub agent: AgentRef,
    pub task: String,
    /// Chain of the child run (already descended).
    pub chain: DelegationChain,
    /// Child of the parent's token.
    pub cancel: CancellationToken,
}

/// Starts nested runs and waits for them. Implemented by the queue.
#[async_trait]
pub trait DelegationLauncher: Send + Sync {
    /// Enqueue the child and block until it is terminal.
    async fn run_child(&self, request: ChildRunRequest) -> Result<Run>;
}

/// `__agent_` + lowercase name with non-alphanumeric runs collapsed to `_`.
pub fn normalize_tool_name(display_name: &str) -> String {
    let lower = display_name.to_lowercase();
    let collapsed = match Regex::new(r"[^a-z0-9]+") {
        Ok(re) => re.replace_all(&lower, "_").into_owned(),
        Err(_) => lower,
    };
    format!("{}{}", AGENT_TOOL_PREFIX, collapsed.trim_matches('_'))
}

fn tool_name_for(agent: &AgentDefinition) -> String {
    let name = normalize_tool_name(&agent.name);
    if name.len() > AGENT_TOOL_PREFIX.len() {
        name
    } else {
        normalize_tool_name(agent.id.as_str())
    }
}

/// Turns declared children into delegation tools.
pub struct HierarchyResolver {
    catalog: Arc<dyn Catalog>,
    max_depth: u32,
}

impl HierarchyResolver {
    pub fn new(catalog: Arc<dyn Catalog>, max_depth: u32) -> Self {
        Self { catalog, max_depth }
    }

    /// Statically check `agent`'s delegation subtree reached via `chain`.
    pub fn validate(&self, agent: &AgentDefinition, chain: &DelegationChain) -> Result<()> {
        let mut names: HashMap<String, &AgentId> = HashMap::new();
        for child_id in &agent.children {
            if chain.contains(child_id) {
                return Err(OrchestrationError::DelegationCycleDetected {
                    path: chain.path_to(child_id),
                });
            }
            let depth = chain.depth() + 1;
            if depth > self.max_depth {
                return Err(OrchestrationError::MaxDelegationDepthExceeded {
                    agent: child_id.to_string(),
                    depth,
                    max: self.max_depth,
                });
            }
            let child = self
                .catalog
                .agent(&agent.environment, child_id)
                .ok_or_else(|| {
                    OrchestrationError::ConfigurationError(format!(
                        "agent '{}' delegates to unknown agent '{}'",
                        agent.id, child_id
                    ))
                })?;

            let tool_name = tool_name_for(&child);
            if agent.tools.iter().any(|t| *t == tool_name) {
                return Err(OrchestrationError::ConfigurationError(format!(
                    "agent '{}': delegation tool '{}' collides with a declared tool",
                    agent.id, tool_name
                )));
            }
            if let Some(other) = names.insert(tool_name.clone(), child_id) {
                if other != child_id {
                    return Err(OrchestrationError::ConfigurationError(format!(
                        "agent '{}': children '{}' and '{}' both map to tool '{}'",
                        agent.id, other, child_id, tool_name
                    )));
                }
            }

            self.validate(&child, &chain.descend(child_id))?;
        }
        Ok(())
    }

    /// Validate, then build one delegation tool per direct child.
    pub fn resolve(
        &self,
        agent: &AgentDefinition,
        chain: &DelegationChain,
        launcher: Arc<dyn DelegationLauncher>,
    ) -> Result<Vec<Arc<dyn Tool>>> {
        self.validate(agent, chain)?;

        let mut seen = std::collections::HashSet::new();
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for child_id in &agent.children {
            if !seen.insert(child_id) {
                continue;
            }
            // validate() already proved every child exists.
            let Some(child) = self.catalog.agent(&agent.environment, child_id) else {
                continue;
            };
            tools.push(Arc::new(AgentTool::new(
                &child,
                chain.descend(child_id),
                Arc::clone(&launcher),
            )));
        }
        Ok(tools)
    }
}

/// Tool that runs a child agent to completion.
pub struct AgentTool {
    name: String,
    description: String,
    child: AgentRef,
    chain: DelegationChain,
    launcher: Arc<dyn DelegationLauncher>,
}

impl AgentTool {
    fn new(
        child: &AgentDefinition,
        chain: DelegationChain,
        launcher: Arc<dyn DelegationLauncher>,
    ) -> Self {
        let mut description = format!("Delegate a task to the '{}' agent.", child.name);
        if !child.description.trim().is_empty() {
            description.push(' ');
            description.push_str(child.description.trim());
        }
        Self {
            name: tool_name_for(child),
            description,
            child: child.agent_ref(),
            chain,
            launcher,
        }
    }

    fn failed(&self, message: impl Into<String>) -> OrchestrationError {
        OrchestrationError::ToolCallFailed {
            tool: self.name.clone(),
            message: message.into(),
        }
    }

    fn task_from(&self, args: &Value) -> Result<String> {
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| self.failed("missing required string argument 'task'"))?;
        if task.trim().is_empty() {
            return Err(self.failed("task must not be empty"));
        }
        let len = task.chars().count();
        if len > MAX_TASK_CHARS {
            return Err(self.failed(format!(
                "task is {} characters, limit is {}",
                len, MAX_TASK_CHARS
            )));
        }
        Ok(task.to_string())
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the agent to perform"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let task = self.task_from(&args)?;
        info!(
            parent_run_id = %ctx.run_id,
            child = %self.child,
            depth = self.chain.depth(),
            "Delegating to child agent"
        );

        let run = self
            .launcher
            .run_child(ChildRunRequest {
                parent_run_id: ctx.run_id,
                agent: self.child.clone(),
                task,
                chain: self.chain.clone(),
                cancel: ctx.cancel.child_token(),
            })
            .await?;

        match run.status {
            RunStatus::Completed => Ok(run.final_output.unwrap_or_default()),
            RunStatus::Cancelled if ctx.cancel.is_cancelled() => Err(OrchestrationError::Cancelled),
            status => {
                let reason = run
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| status.to_string());
                Err(self.failed(format!("delegated run {} {}: {}", run.id, status, reason)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::error::ErrorKind;
    use crate::testing::RecordingLauncher;

    fn agent(id: &str, children: &[&str]) -> AgentDefinition {
        AgentDefinition::new("default", id, format!("You are {}.", id))
            .with_children(children.iter().copied())
    }

    fn resolver(agents: Vec<AgentDefinition>, max_depth: u32) -> HierarchyResolver {
        let catalog = agents
            .into_iter()
            .fold(StaticCatalog::new(), |c, a| c.with_agent(a));
        HierarchyResolver::new(Arc::new(catalog), max_depth)
    }

    #[test]
    fn test_normalize_tool_name() {
        assert_eq!(normalize_tool_name("Research Helper"), "__agent_research_helper");
        assert_eq!(normalize_tool_name("  Data--Cruncher v2! "), "__agent_data_cruncher_v2");
        assert_eq!(normalize_tool_name("ÜBER agent"), "__agent_ber_agent");
    }

    #[test]
    fn test_cycle_detected_before_any_enqueue() {
        let a = agent("a", &["b"]);
        let b = agent("b", &["a"]);
        let resolver = resolver(vec![a.clone(), b], 10);
        let launcher = Arc::new(RecordingLauncher::default());

        let err = resolver
            .resolve(&a, &DelegationChain::root(&a.id), launcher.clone())
            .err()
            .expect("cycle should fail");
        assert_eq!(err.kind(), ErrorKind::DelegationCycleDetected);
        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(launcher.launched(), 0);
    }

    #[test]
    fn test_max_depth_two_fails_at_third_level() {
        let a = agent("a", &["b"]);
        let b = agent("b", &["c"]);
        let c = agent("c", &["d"]);
        let d = agent("d", &[]);
        let resolver = resolver(vec![a.clone(), b.clone(), c, d], 2);
        let launcher = Arc::new(RecordingLauncher::default());

        let err = resolver
            .resolve(&a, &DelegationChain::root(&a.id), launcher.clone())
            .err()
            .expect("depth should fail");
        match err {
            OrchestrationError::MaxDelegationDepthExceeded { agent, depth, max } => {
                assert_eq!(agent, "d");
                assert_eq!(depth, 3);
                assert_eq!(max, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Two levels are fine.
        let shallow = resolver_for_two_levels();
        let root = agent("a", &["b"]);
        assert!(shallow
            .resolve(&root, &DelegationChain::root(&root.id), launcher)
            .is_ok());
    }

    fn resolver_for_two_levels() -> HierarchyResolver {
        resolver(
            vec![agent("a", &["b"]), agent("b", &["c"]), agent("c", &[])],
            2,
        )
    }

    #[test]
    fn test_collision_with_declared_tool_is_configuration_error() {
        let parent = agent("lead", &["helper"]).with_tools(["__agent_helper"]);
        let helper = agent("helper", &[]);
        let resolver = resolver(vec![parent.clone(), helper], 10);

        let err = resolver
            .validate(&parent, &DelegationChain::root(&parent.id))
            .expect_err("collision");
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_children_normalizing_to_same_name_rejected() {
        let parent = agent("lead", &["x1", "x2"]);
        let x1 = agent("x1", &[]).with_name("Web Search");
        let x2 = agent("x2", &[]).with_name("web-search");
        let resolver = resolver(vec![parent.clone(), x1, x2], 10);

        let err = resolver
            .validate(&parent, &DelegationChain::root(&parent.id))
            .expect_err("duplicate name");
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_unknown_child_is_configuration_error() {
        let parent = agent("lead", &["ghost"]);
        let resolver = resolver(vec![parent.clone()], 10);
        let err = resolver
            .validate(&parent, &DelegationChain::root(&parent.id))
            .expect_err("unknown child");
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn test_agent_tool_validates_task_and_launches_child() {
        let parent = agent("lead", &["helper"]);
        let helper = agent("helper", &[])
            .with_name("Research Helper")
            .with_description("Finds things.");
        let resolver = resolver(vec![parent.clone(), helper], 10);
        let launcher = Arc::new(RecordingLauncher::default());

        let tools = resolver
            .resolve(&parent, &DelegationChain::root(&parent.id), launcher.clone())
            .expect("resolve");
        assert_eq!(tools.len(), 1);
        let tool = &tools[0];
        assert_eq!(tool.name(), "__agent_research_helper");
        assert!(tool.description().contains("Finds things."));

        let ctx = ToolContext {
            run_id: RunId::new(),
            environment: "default".into(),
            cancel: CancellationToken::new(),
        };

        for bad in [
            serde_json::json!({}),
            serde_json::json!({"task": "   "}),
            serde_json::json!({"task": "x".repeat(MAX_TASK_CHARS + 1)}),
        ] {
            let err = tool.execute(bad, &ctx).await.expect_err("invalid task");
            assert_eq!(err.kind(), ErrorKind::ToolCallFailed);
        }
        assert_eq!(launcher.launched(), 0);

        let output = tool
            .execute(serde_json::json!({"task": "find rust crates"}), &ctx)
            .await
            .expect("delegation");
        assert_eq!(output, "helper did: find rust crates");

        let request = launcher.last_request().expect("request recorded");
        assert_eq!(request.parent_run_id, ctx.run_id);
        assert_eq!(request.chain.depth(), 1);
        assert!(request.chain.contains(&"lead".into()));
        assert!(request.chain.contains(&"helper".into()));
    }
}
