//! # agentd
//!
//! Self-hosted runtime that executes LLM agents against MCP tool servers.
//!
//! This library provides:
//! - A per-environment pool of MCP tool server connections
//! - An execution engine that drives the model/tool loop of one run
//! - Agent delegation, where child agents are exposed as tools
//! - A bounded execution queue with cancellation, timeouts and shutdown
//! - A cron scheduler that enqueues recurring runs
//!
//! ## Architecture
//!
//! ```text
//!   Scheduler ──submit──▶ ExecutionQueue ──dispatch──▶ ExecutionEngine
//!                              ▲                         │      │
//!                              │ nested runs             │      ▼
//!                              └──── AgentTool ◀── ToolRegistry ──▶ ConnectionPool
//!                                                                    │
//!                                                                    ▼
//!                                                              MCP servers
//! ```
//!
//! ## Modules
//! - `catalog`: environments, agents, tool servers and schedules
//! - `mcp`: MCP clients and the connection pool
//! - `tools`: per-run tool registry
//! - `agents`: delegation and the execution engine
//! - `run`: run records and the run store
//! - `queue`: admission, slots and shutdown
//! - `scheduler`: cron schedules
//! - `llm`: model client

pub mod agents;
pub mod backoff;
pub mod catalog;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod queue;
pub mod run;
pub mod runtime;
pub mod scheduler;
pub mod tools;

#[cfg(test)]
mod testing;

pub use catalog::{AgentDefinition, AgentRef, Catalog, ScheduleEntry, StaticCatalog};
pub use config::Config;
pub use error::{ErrorKind, OrchestrationError};
pub use queue::ExecutionQueue;
pub use run::{Run, RunId, RunRequest, RunStatus};
pub use runtime::AgentRuntime;
pub use scheduler::Scheduler;
