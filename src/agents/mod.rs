//! Agent execution.
//!
//! - `hierarchy`: delegation validation and agent-as-tool synthesis
//! - `executor`: the model/tool loop for a single run

pub mod executor;
pub mod hierarchy;

pub use executor::{ExecutionEngine, RunInvocation, RunOutcome};
pub use hierarchy::{
    normalize_tool_name, AgentTool, ChildRunRequest, DelegationChain, DelegationLauncher,
    HierarchyResolver,
};
