//! Run persistence boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{Run, RunId, RunStatus, Step};
use crate::error::{OrchestrationError, RunError};
use crate::llm::TokenUsage;

/// Terminal or running transition written by the engine and the queue.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<RunStatus>,
    pub final_output: Option<String>,
    pub structured_output: Option<serde_json::Value>,
    pub truncated: bool,
    pub error: Option<RunError>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            ..Self::default()
        }
    }

    pub fn completed(
        final_output: Option<String>,
        structured_output: Option<serde_json::Value>,
        truncated: bool,
    ) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            final_output,
            structured_output,
            truncated,
            error: None,
        }
    }

    /// Cancellation maps to `cancelled`, everything else to `failed`.
    pub fn from_error(error: &OrchestrationError) -> Self {
        let status = match error {
            OrchestrationError::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        Self {
            status: Some(status),
            error: Some(error.to_run_error()),
            ..Self::default()
        }
    }

    fn target(&self) -> RunStatus {
        self.status.unwrap_or(RunStatus::Running)
    }
}

/// Run store trait - implemented by all storage backends.
///
/// Every write is keyed by the run identity. Writes against a terminal run
/// are refused so a finished record never changes.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run (normally `queued`).
    async fn save_run(&self, run: &Run) -> Result<(), String>;

    /// Append a step; its `seq` must equal the current step count.
    async fn append_step(&self, run_id: RunId, step: Step) -> Result<(), String>;

    async fn record_usage(&self, run_id: RunId, usage: &TokenUsage) -> Result<(), String>;

    async fn add_warning(&self, run_id: RunId, warning: &str) -> Result<(), String>;

    /// Returns `Ok(false)` when the run was already terminal and nothing changed.
    async fn update_run_status(&self, run_id: RunId, update: StatusUpdate)
        -> Result<bool, String>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, String>;

    /// List runs, newest first.
    async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, String>;

    /// Nested runs started by `parent`, oldest first.
    async fn list_children(&self, parent: RunId) -> Result<Vec<Run>, String>;
}

#[derive(Clone)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live_run(runs: &mut HashMap<RunId, Run>, id: RunId) -> Result<&mut Run, String> {
    let run = runs
        .get_mut(&id)
        .ok_or_else(|| format!("Run {} not found", id))?;
    if run.status.is_terminal() {
        return Err(format!("Run {} is already {}", id, run.status));
    }
    Ok(run)
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(format!("Run {} already exists", run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn append_step(&self, run_id: RunId, step: Step) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        let run = live_run(&mut runs, run_id)?;
        let expected = run.steps.len() as u32;
        if step.seq != expected {
            return Err(format!(
                "Run {} expected step {}, got {}",
                run_id, expected, step.seq
            ));
        }
        run.steps.push(step);
        Ok(())
    }

    async fn record_usage(&self, run_id: RunId, usage: &TokenUsage) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        live_run(&mut runs, run_id)?.usage.add(usage);
        Ok(())
    }

    async fn add_warning(&self, run_id: RunId, warning: &str) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        live_run(&mut runs, run_id)?
            .warnings
            .push(warning.to_string());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        update: StatusUpdate,
    ) -> Result<bool, String> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| format!("Run {} not found", run_id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }

        let status = update.target();
        let now = Utc::now();
        run.status = status;
        if status == RunStatus::Running {
            run.started_at.get_or_insert(now);
            return Ok(true);
        }
        run.completed_at = Some(now);
        if update.final_output.is_some() {
            run.final_output = update.final_output;
        }
        run.structured_output = update.structured_output;
        run.truncated = update.truncated;
        run.error = update.error;
        Ok(true)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, String> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, String> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_children(&self, parent: RunId) -> Result<Vec<Run>, String> {
        let mut children: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.parent_run_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunRequest, StepKind};

    fn text_step(seq: u32) -> Step {
        Step {
            seq,
            kind: StepKind::ModelText {
                text: format!("step {}", seq),
            },
            duration_ms: 0,
            at: Utc::now(),
        }
    }

    async fn queued_run(store: &InMemoryRunStore) -> RunId {
        let id = RunId::new();
        store
            .save_run(&Run::queued(id, &RunRequest::new("default/agent", "hi")))
            .await
            .expect("Failed to save run");
        id
    }

    #[tokio::test]
    async fn test_steps_must_be_gap_free() {
        let store = InMemoryRunStore::new();
        let id = queued_run(&store).await;

        store
            .append_step(id, text_step(0))
            .await
            .expect("Failed to append step 0");
        assert!(store.append_step(id, text_step(2)).await.is_err());
        assert!(store.append_step(id, text_step(0)).await.is_err());
        store
            .append_step(id, text_step(1))
            .await
            .expect("Failed to append step 1");

        let run = store.get_run(id).await.expect("get").expect("run exists");
        let seqs: Vec<u32> = run.steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let store = InMemoryRunStore::new();
        let id = queued_run(&store).await;

        assert!(store
            .update_run_status(id, StatusUpdate::running())
            .await
            .expect("running"));
        assert!(store
            .update_run_status(id, StatusUpdate::completed(Some("done".into()), None, false))
            .await
            .expect("completed"));

        let changed = store
            .update_run_status(id, StatusUpdate::from_error(&OrchestrationError::Cancelled))
            .await
            .expect("update");
        assert!(!changed);
        assert!(store.append_step(id, text_step(0)).await.is_err());
        assert!(store
            .record_usage(id, &TokenUsage::new(1, 1))
            .await
            .is_err());

        let run = store.get_run(id).await.expect("get").expect("run exists");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_output.as_deref(), Some("done"));
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let store = InMemoryRunStore::new();
        let id = queued_run(&store).await;
        store
            .record_usage(id, &TokenUsage::new(10, 5))
            .await
            .expect("usage");
        store
            .record_usage(id, &TokenUsage::new(3, 2))
            .await
            .expect("usage");
        let run = store.get_run(id).await.expect("get").expect("run exists");
        assert_eq!(run.usage, TokenUsage::new(13, 7));
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = InMemoryRunStore::new();
        let parent = queued_run(&store).await;
        let child = RunId::new();
        store
            .save_run(
                &Run::queued(child, &RunRequest::new("default/helper", "task"))
                    .with_parent(parent, 1),
            )
            .await
            .expect("save child");

        let children = store.list_children(parent).await.expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child);
        assert_eq!(children[0].depth, 1);
        assert!(store.save_run(&children[0]).await.is_err());
    }
}
