//! Read-only view of environments, agents, tool servers and schedules.
//!
//! The catalog is owned by the configuration layer. The runtime only reads
//! from it: tool server configs when the pool (re)connects, agent definitions
//! when a run is enqueued or a delegation subtree is validated, and schedules
//! when the scheduler starts.

mod file;

pub use file::{CatalogFile, EnvironmentFile};

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mcp::ToolServerConfig;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Stable identifier of an environment (isolation boundary).
    EnvironmentId
);
string_id!(
    /// Identifier of an agent, unique within its environment.
    AgentId
);
string_id!(
    /// Identifier of a schedule entry.
    ScheduleId
);

/// Fully qualified reference to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRef {
    pub environment: EnvironmentId,
    pub agent: AgentId,
}

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.environment, self.agent)
    }
}

/// Declarative definition of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    /// Filled in from the enclosing environment when loaded from a file.
    #[serde(default = "unassigned_environment")]
    pub environment: EnvironmentId,
    /// Display name; also the basis of the synthesized delegation tool name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt template, `{{var}}` placeholders are filled from run variables.
    pub prompt: String,
    /// Declared direct tool names
    #[serde(default)]
    pub tools: Vec<String>,
    /// Declared child agents, callable as delegation tools
    #[serde(default)]
    pub children: Vec<AgentId>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// JSON schema the final answer must follow
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
}

fn unassigned_environment() -> EnvironmentId {
    EnvironmentId::new("")
}

impl AgentDefinition {
    pub fn new(
        environment: impl Into<EnvironmentId>,
        id: impl Into<AgentId>,
        prompt: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            environment: environment.into(),
            description: String::new(),
            prompt: prompt.into(),
            tools: Vec::new(),
            children: Vec::new(),
            max_steps: None,
            output_schema: None,
            model: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn agent_ref(&self) -> AgentRef {
        AgentRef {
            environment: self.environment.clone(),
            agent: self.id.clone(),
        }
    }
}

impl From<&str> for AgentRef {
    /// Parses `environment/agent`; a bare name lands in the `default` environment.
    fn from(s: &str) -> Self {
        match s.split_once('/') {
            Some((env, agent)) => AgentRef {
                environment: env.into(),
                agent: agent.into(),
            },
            None => AgentRef {
                environment: "default".into(),
                agent: s.into(),
            },
        }
    }
}

/// Recurring trigger for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: ScheduleId,
    /// 6-field cron expression with seconds
    pub cron: String,
    pub environment: EnvironmentId,
    pub agent: AgentId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the default scheduled input text
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ScheduleEntry {
    pub fn new(
        id: impl Into<ScheduleId>,
        cron: impl Into<String>,
        environment: impl Into<EnvironmentId>,
        agent: impl Into<AgentId>,
    ) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            environment: environment.into(),
            agent: agent.into(),
            enabled: true,
            description: None,
            input: None,
            variables: HashMap::new(),
            last_fired_at: None,
        }
    }
}

/// Read-only source of declarative configuration.
pub trait Catalog: Send + Sync {
    fn environments(&self) -> Vec<EnvironmentId>;

    fn agent(&self, environment: &EnvironmentId, id: &AgentId) -> Option<AgentDefinition>;

    fn agents(&self, environment: &EnvironmentId) -> Vec<AgentDefinition>;

    /// Tool server configs, before template resolution.
    fn tool_servers(&self, environment: &EnvironmentId) -> Vec<ToolServerConfig>;

    /// Variables used to resolve tool server config templates.
    fn variables(&self, environment: &EnvironmentId) -> HashMap<String, String>;

    fn schedules(&self) -> Vec<ScheduleEntry>;
}

#[derive(Debug, Clone, Default)]
struct EnvironmentEntry {
    agents: BTreeMap<AgentId, AgentDefinition>,
    tool_servers: Vec<ToolServerConfig>,
    variables: HashMap<String, String>,
}

/// Immutable in-memory catalog, built in code or loaded from a file.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    environments: BTreeMap<EnvironmentId, EnvironmentEntry>,
    schedules: Vec<ScheduleEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn env_mut(&mut self, environment: &EnvironmentId) -> &mut EnvironmentEntry {
        self.environments.entry(environment.clone()).or_default()
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        let env = agent.environment.clone();
        self.env_mut(&env).agents.insert(agent.id.clone(), agent);
        self
    }

    pub fn with_tool_server(
        mut self,
        environment: impl Into<EnvironmentId>,
        server: ToolServerConfig,
    ) -> Self {
        self.env_mut(&environment.into()).tool_servers.push(server);
        self
    }

    pub fn with_variable(
        mut self,
        environment: impl Into<EnvironmentId>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.env_mut(&environment.into())
            .variables
            .insert(name.into(), value.into());
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleEntry) -> Self {
        self.schedules.push(schedule);
        self
    }
}

impl Catalog for StaticCatalog {
    fn environments(&self) -> Vec<EnvironmentId> {
        self.environments.keys().cloned().collect()
    }

    fn agent(&self, environment: &EnvironmentId, id: &AgentId) -> Option<AgentDefinition> {
        self.environments
            .get(environment)
            .and_then(|env| env.agents.get(id))
            .cloned()
    }

    fn agents(&self, environment: &EnvironmentId) -> Vec<AgentDefinition> {
        self.environments
            .get(environment)
            .map(|env| env.agents.values().cloned().collect())
            .unwrap_or_default()
    }

    fn tool_servers(&self, environment: &EnvironmentId) -> Vec<ToolServerConfig> {
        self.environments
            .get(environment)
            .map(|env| env.tool_servers.clone())
            .unwrap_or_default()
    }

    fn variables(&self, environment: &EnvironmentId) -> HashMap<String, String> {
        self.environments
            .get(environment)
            .map(|env| env.variables.clone())
            .unwrap_or_default()
    }

    fn schedules(&self) -> Vec<ScheduleEntry> {
        self.schedules.clone()
    }
}
