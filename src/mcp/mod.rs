//! MCP (Model Context Protocol) tool servers.
//!
//! - `types`: config, JSON-RPC and discovery types
//! - `client`: HTTP and stdio sessions behind the `Connector` seam
//! - `pool`: per-environment connection pool with background reconnection

mod client;
mod pool;
mod types;

pub use client::{Connector, McpConnector, McpError, ToolSession};
pub use pool::{connection_key, resolve_config, ConnectReport, ConnectionPool, PoolTool};
pub use types::{
    ConnectionState, ConnectionStatus, McpToolDescriptor, McpTransport, ToolServerConfig,
};
