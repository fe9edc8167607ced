//! Execution queue: admission, worker slots, timeouts and shutdown.
//!
//! `enqueue` allocates the run identity and persists the `queued` record
//! before returning; everything after that happens on a tracked task. Nested
//! runs started by delegation tools run inside their parent's slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agents::{ChildRunRequest, DelegationLauncher, ExecutionEngine, RunInvocation};
use crate::catalog::{AgentDefinition, AgentRef, Catalog};
use crate::config::QueueConfig;
use crate::error::{OrchestrationError, Result};
use crate::run::{Run, RunId, RunRequest, RunSource, RunStore, StatusUpdate};

/// Time allowed for aborted tasks to unwind after the grace period.
const ABORT_SETTLE: Duration = Duration::from_millis(250);

/// Anything that accepts run requests (the queue, or a test double).
#[async_trait]
pub trait RunSubmitter: Send + Sync {
    async fn submit(&self, request: RunRequest) -> Result<RunId>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub workers: usize,
    pub available_slots: usize,
    /// Runs currently executing, nested runs included
    pub in_flight: usize,
    /// Runs waiting for a slot
    pub pending: usize,
    pub accepting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every run finished within the grace period
    pub drained: bool,
    /// Runs force-cancelled after the grace period
    pub cancelled: Vec<RunId>,
    pub elapsed: Duration,
}

struct ActiveRun {
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    abort: Option<AbortHandle>,
    started: bool,
}

struct QueueInner {
    engine: Arc<ExecutionEngine>,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn RunStore>,
    config: QueueConfig,
    slots: Arc<Semaphore>,
    agent_slots: Mutex<HashMap<AgentRef, Arc<Semaphore>>>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
    pending: AtomicUsize,
    accepting: AtomicBool,
    tracker: TaskTracker,
}

/// Bounded, cancellable run queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

type Permits = (Option<OwnedSemaphorePermit>, OwnedSemaphorePermit);

impl ExecutionQueue {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        catalog: Arc<dyn Catalog>,
        config: QueueConfig,
    ) -> Self {
        let store = Arc::clone(engine.store());
        Self {
            inner: Arc::new(QueueInner {
                engine,
                catalog,
                store,
                slots: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                agent_slots: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                tracker: TaskTracker::new(),
            }),
        }
    }

    fn agent_definition(&self, agent: &AgentRef) -> Result<AgentDefinition> {
        self.inner
            .catalog
            .agent(&agent.environment, &agent.agent)
            .ok_or_else(|| {
                OrchestrationError::ConfigurationError(format!("unknown agent '{}'", agent))
            })
    }

    /// Accept a run and return its identity; execution continues in the background.
    pub async fn enqueue(&self, request: RunRequest) -> Result<RunId> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(OrchestrationError::ShuttingDown);
        }
        let agent = self.agent_definition(&request.agent)?;

        let capacity = inner.config.capacity;
        if inner.pending.fetch_add(1, Ordering::SeqCst) >= capacity {
            inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestrationError::QueueFull(capacity));
        }

        let run_id = RunId::new();
        if let Err(e) = inner.store.save_run(&Run::queued(run_id, &request)).await {
            inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestrationError::Persistence(e));
        }
        info!(run_id = %run_id, agent = %request.agent, source = ?request.source, "Run enqueued");

        let invocation =
            RunInvocation::new(run_id, agent, request.input).with_variables(request.variables);
        self.spawn(invocation, false).await;
        Ok(run_id)
    }

    async fn spawn(&self, invocation: RunInvocation, nested: bool) {
        let run_id = invocation.run_id();
        let (done, _) = watch::channel(false);
        let mut active = self.inner.active.lock().await;
        active.insert(
            run_id,
            ActiveRun {
                cancel: invocation.cancel().clone(),
                done,
                abort: None,
                started: nested,
            },
        );

        let queue = self.clone();
        let handle = self
            .inner
            .tracker
            .spawn(async move { queue.dispatch(invocation, nested).await });
        // Still locked, so the task cannot have removed its entry yet.
        if let Some(entry) = active.get_mut(&run_id) {
            entry.abort = Some(handle.abort_handle());
        }
    }

    async fn acquire(&self, agent: &AgentRef) -> Option<Permits> {
        let agent_permit = match self.inner.config.max_per_agent {
            Some(limit) => {
                let semaphore = {
                    let mut slots = self.inner.agent_slots.lock().await;
                    Arc::clone(
                        slots
                            .entry(agent.clone())
                            .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1)))),
                    )
                };
                Some(semaphore.acquire_owned().await.ok()?)
            }
            None => None,
        };
        let slot = Arc::clone(&self.inner.slots).acquire_owned().await.ok()?;
        Some((agent_permit, slot))
    }

    async fn dispatch(self, invocation: RunInvocation, nested: bool) {
        let run_id = invocation.run_id();
        let cancel = invocation.cancel().clone();
        let store = Arc::clone(&self.inner.store);

        let _permits = if nested {
            None
        } else {
            let agent = invocation.agent().agent_ref();
            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permits = self.acquire(&agent) => permits,
            };
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            match acquired {
                Some(permits) => Some(permits),
                None => {
                    info!(run_id = %run_id, "Run cancelled before start");
                    let update = StatusUpdate::from_error(&OrchestrationError::Cancelled);
                    if let Err(e) = store.update_run_status(run_id, update).await {
                        warn!(run_id = %run_id, error = %e, "Failed to record cancellation");
                    }
                    self.finish(run_id).await;
                    return;
                }
            }
        };

        if let Some(entry) = self.inner.active.lock().await.get_mut(&run_id) {
            entry.started = true;
        }

        let launcher: Arc<dyn DelegationLauncher> = Arc::new(self.clone());
        let limit = self.inner.config.run_timeout;
        match tokio::time::timeout(limit, self.inner.engine.run(invocation, launcher)).await {
            Ok(Ok(outcome)) => {
                debug!(run_id = %run_id, steps = outcome.steps.len(), "Dispatch finished");
            }
            Ok(Err(e)) => {
                debug!(run_id = %run_id, error = %e, "Dispatch finished with error");
            }
            Err(_) => {
                warn!(run_id = %run_id, timeout = ?limit, "Run timed out");
                cancel.cancel();
                let update = StatusUpdate::from_error(&OrchestrationError::Timeout(limit));
                if let Err(e) = store.update_run_status(run_id, update).await {
                    warn!(run_id = %run_id, error = %e, "Failed to record timeout");
                }
            }
        }
        self.finish(run_id).await;
    }

    async fn finish(&self, run_id: RunId) {
        if let Some(entry) = self.inner.active.lock().await.remove(&run_id) {
            entry.done.send_replace(true);
        }
    }

    /// Request cancellation. Returns `false` if the run already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        let token = self
            .inner
            .active
            .lock()
            .await
            .get(&run_id)
            .map(|entry| entry.cancel.clone());
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling run");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.inner
            .store
            .get_run(run_id)
            .await
            .map_err(OrchestrationError::Persistence)?
            .ok_or_else(|| OrchestrationError::UnknownRun(run_id.to_string()))
    }

    /// Wait until the run is terminal and return it.
    pub async fn wait(&self, run_id: RunId) -> Result<Run> {
        let receiver = self
            .inner
            .active
            .lock()
            .await
            .get(&run_id)
            .map(|entry| entry.done.subscribe());
        if let Some(mut receiver) = receiver {
            while !*receiver.borrow_and_update() {
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_run(run_id).await
    }

    pub async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>> {
        self.inner
            .store
            .list_runs(limit, offset)
            .await
            .map_err(OrchestrationError::Persistence)
    }

    pub async fn list_children(&self, parent: RunId) -> Result<Vec<Run>> {
        self.inner
            .store
            .list_children(parent)
            .await
            .map_err(OrchestrationError::Persistence)
    }

    pub async fn status(&self) -> QueueStatus {
        let in_flight = self
            .inner
            .active
            .lock()
            .await
            .values()
            .filter(|entry| entry.started)
            .count();
        QueueStatus {
            workers: self.inner.config.workers,
            available_slots: self.inner.slots.available_permits(),
            in_flight,
            pending: self.inner.pending.load(Ordering::SeqCst),
            accepting: self.inner.accepting.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, give in-flight runs `grace` to finish, then
    /// cancel and abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let started = Instant::now();
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.tracker.close();

        {
            let active = self.inner.active.lock().await;
            for entry in active.values().filter(|entry| !entry.started) {
                entry.cancel.cancel();
            }
            info!(active = active.len(), grace = ?grace, "Shutting down execution queue");
        }

        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();

        let mut cancelled = Vec::new();
        if !drained {
            let remaining: Vec<(RunId, ActiveRun)> =
                self.inner.active.lock().await.drain().collect();
            for (run_id, entry) in remaining {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                entry.cancel.cancel();
                let update = StatusUpdate::from_error(&OrchestrationError::Cancelled);
                match self.inner.store.update_run_status(run_id, update).await {
                    Ok(true) => cancelled.push(run_id),
                    Ok(false) => {}
                    Err(e) => warn!(run_id = %run_id, error = %e, "Failed to record cancellation"),
                }
                entry.done.send_replace(true);
            }
            let _ = tokio::time::timeout(ABORT_SETTLE, self.inner.tracker.wait()).await;
            warn!(cancelled = cancelled.len(), "Grace period expired, runs cancelled");
        }

        ShutdownReport {
            drained,
            cancelled,
            elapsed: started.elapsed(),
        }
    }
}

#[async_trait]
impl RunSubmitter for ExecutionQueue {
    async fn submit(&self, request: RunRequest) -> Result<RunId> {
        self.enqueue(request).await
    }
}

#[async_trait]
impl DelegationLauncher for ExecutionQueue {
    async fn run_child(&self, request: ChildRunRequest) -> Result<Run> {
        let agent = self.agent_definition(&request.agent)?;
        let run_id = RunId::new();
        let run = Run::queued(
            run_id,
            &RunRequest::new(request.agent.clone(), request.task.clone())
                .with_source(RunSource::Delegation),
        )
        .with_parent(request.parent_run_id, request.chain.depth());
        self.inner
            .store
            .save_run(&run)
            .await
            .map_err(OrchestrationError::Persistence)?;
        info!(
            run_id = %run_id,
            parent_run_id = %request.parent_run_id,
            agent = %request.agent,
            depth = request.chain.depth(),
            "Nested run enqueued"
        );

        let invocation = RunInvocation::new(run_id, agent, request.task)
            .with_chain(request.chain)
            .with_cancel(request.cancel);
        self.spawn(invocation, true).await;
        self.wait(run_id).await
    }
}
