//! Run records: identity, status, steps and the persistence boundary.

mod store;

pub use store::{InMemoryRunStore, RunStore, StatusUpdate};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::AgentRef;
use crate::error::{OrchestrationError, RunError};
use crate::llm::TokenUsage;

/// Identity of a run.
///
/// Allocated once by the queue and used as the key for every write. Has no
/// `Default`; the nil UUID is rejected on every path in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct RunId(Uuid);

impl RunId {
    /// Allocate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Result<Self, OrchestrationError> {
        if id.is_nil() {
            return Err(OrchestrationError::InvalidRunIdentity(
                "nil run id".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl TryFrom<Uuid> for RunId {
    type Error = OrchestrationError;

    fn try_from(id: Uuid) -> Result<Self, Self::Error> {
        Self::from_uuid(id)
    }
}

impl From<RunId> for Uuid {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RunId {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s)
            .map_err(|e| OrchestrationError::InvalidRunIdentity(format!("{}: {}", s, e)))?;
        Self::from_uuid(id)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What triggered a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Manual,
    Schedule,
    Delegation,
}

/// One entry in a run's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the run, starting at 0 with no gaps.
    pub seq: u32,
    #[serde(flatten)]
    pub kind: StepKind,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Assistant text that accompanied tool calls.
    ModelText { text: String },
    ToolCall {
        tool: String,
        call_id: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Step {
    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            StepKind::ToolCall { tool, .. } => Some(tool),
            StepKind::ModelText { .. } => None,
        }
    }
}

/// Request accepted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub agent: AgentRef,
    pub input: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default = "default_source")]
    pub source: RunSource,
}

fn default_source() -> RunSource {
    RunSource::Manual
}

impl RunRequest {
    pub fn new(agent: impl Into<AgentRef>, input: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            input: input.into(),
            variables: HashMap::new(),
            source: RunSource::Manual,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_source(mut self, source: RunSource) -> Self {
        self.source = source;
        self
    }
}

/// Durable record of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub agent: AgentRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    /// Delegation edges from the root run.
    pub depth: u32,
    pub source: RunSource,
    pub input: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub final_output: Option<String>,
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub error: Option<RunError>,
}

impl Run {
    /// A freshly enqueued run.
    pub fn queued(id: RunId, request: &RunRequest) -> Self {
        Self {
            id,
            agent: request.agent.clone(),
            parent_run_id: None,
            depth: 0,
            source: request.source,
            input: request.input.clone(),
            variables: request.variables.clone(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
            usage: TokenUsage::default(),
            final_output: None,
            structured_output: None,
            truncated: false,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn with_parent(mut self, parent: RunId, depth: u32) -> Self {
        self.parent_run_id = Some(parent);
        self.depth = depth;
        self
    }
}
