//! Wires the pool, engine, queue and scheduler together.

use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::{ExecutionEngine, HierarchyResolver};
use crate::catalog::{Catalog, EnvironmentId, ScheduleEntry, ScheduleId};
use crate::config::Config;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::mcp::{ConnectReport, ConnectionPool, Connector, McpConnector};
use crate::queue::{ExecutionQueue, QueueStatus, ShutdownReport};
use crate::run::{InMemoryRunStore, Run, RunId, RunRequest, RunStore};
use crate::scheduler::{ActiveSchedule, Scheduler};

/// One running orchestration service.
pub struct AgentRuntime {
    config: Config,
    catalog: Arc<dyn Catalog>,
    pool: ConnectionPool,
    queue: ExecutionQueue,
    scheduler: Scheduler,
}

impl AgentRuntime {
    /// Runtime with real tool server connections and an in-memory run store.
    pub fn new(config: Config, catalog: Arc<dyn Catalog>, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_parts(
            config,
            catalog,
            llm,
            Arc::new(McpConnector::new()),
            Arc::new(InMemoryRunStore::new()),
        )
    }

    pub fn with_parts(
        config: Config,
        catalog: Arc<dyn Catalog>,
        llm: Arc<dyn LlmClient>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let pool = ConnectionPool::new(connector, config.pool.clone());
        let resolver = Arc::new(HierarchyResolver::new(
            Arc::clone(&catalog),
            config.max_delegation_depth,
        ));
        let engine = Arc::new(ExecutionEngine::new(
            llm,
            pool.clone(),
            resolver,
            store,
            config.default_model.clone(),
            config.default_max_steps,
        ));
        let queue = ExecutionQueue::new(engine, Arc::clone(&catalog), config.queue.clone());
        let scheduler = Scheduler::with_catalog(Arc::new(queue.clone()), Arc::clone(&catalog));

        Self {
            config,
            catalog,
            pool,
            queue,
            scheduler,
        }
    }

    /// Connect every environment's tool servers, then start the scheduler.
    pub async fn start(&self) -> Vec<(EnvironmentId, ConnectReport)> {
        let mut reports = Vec::new();
        for environment in self.catalog.environments() {
            let report = self.connect_environment(&environment).await;
            reports.push((environment, report));
        }
        self.scheduler.start().await;
        info!(environments = reports.len(), "Agent runtime started");
        reports
    }

    /// (Re)connect one environment from the catalog's current config.
    pub async fn connect_environment(&self, environment: &EnvironmentId) -> ConnectReport {
        let report = self
            .pool
            .connect_with_variables(
                environment,
                self.catalog.tool_servers(environment),
                &self.catalog.variables(environment),
            )
            .await;
        for (server, error) in &report.failed {
            warn!(environment = %environment, server = %server, error = %error, "Tool server unavailable");
        }
        info!(
            environment = %environment,
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Environment connected"
        );
        report
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn enqueue(&self, request: RunRequest) -> Result<RunId> {
        self.queue.enqueue(request).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.queue.get_run(run_id).await
    }

    pub async fn wait(&self, run_id: RunId) -> Result<Run> {
        self.queue.wait(run_id).await
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<bool> {
        self.queue.cancel(run_id).await
    }

    pub async fn status(&self) -> QueueStatus {
        self.queue.status().await
    }

    pub async fn add_or_activate(&self, entry: ScheduleEntry) -> Result<()> {
        self.scheduler.add_or_activate(entry).await
    }

    pub async fn deactivate(&self, id: &ScheduleId) -> bool {
        self.scheduler.deactivate(id).await
    }

    pub async fn list_active(&self) -> Vec<ActiveSchedule> {
        self.scheduler.list_active().await
    }

    /// Stop scheduling, drain the queue within the configured grace, close connections.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.scheduler.stop().await;
        let report = self.queue.shutdown(self.config.queue.shutdown_grace).await;
        self.pool.shutdown().await;
        info!(
            drained = report.drained,
            cancelled = report.cancelled.len(),
            elapsed = ?report.elapsed,
            "Agent runtime stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AgentDefinition, StaticCatalog};
    use crate::mcp::ToolServerConfig;
    use crate::run::RunStatus;
    use crate::testing::{FakeConnector, ScriptedLlm};

    #[tokio::test]
    async fn test_runtime_end_to_end() {
        let catalog = StaticCatalog::new()
            .with_variable("default", "FILES_URL", "http://files.local")
            .with_tool_server("default", ToolServerConfig::http("files", "{{ .FILES_URL }}"))
            .with_tool_server("default", ToolServerConfig::http("web", "http://web.local"))
            .with_agent(
                AgentDefinition::new("default", "writer", "Write.").with_tools(["read_file"]),
            );
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("files", &["read_file"])
                .with_unreachable("web"),
        );
        let runtime = AgentRuntime::with_parts(
            Config::new("key".to_string(), "test-model".to_string()),
            Arc::new(catalog),
            Arc::new(ScriptedLlm::sequence(vec![ScriptedLlm::text("ok")])),
            connector,
            Arc::new(InMemoryRunStore::new()),
        );

        let reports = runtime.start().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.ready, vec!["files"]);
        assert_eq!(reports[0].1.failed.len(), 1);

        let run_id = runtime
            .enqueue(RunRequest::new("default/writer", "hello"))
            .await
            .expect("Failed to enqueue");
        let run = runtime.wait(run_id).await.expect("Failed to wait");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_output.as_deref(), Some("ok"));

        let report = runtime.shutdown().await;
        assert!(report.drained);
        assert!(report.cancelled.is_empty());
    }
}
