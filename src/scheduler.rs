//! Cron scheduler.
//!
//! Each `Scheduler` owns its entries behind its own lock and runs two tasks
//! between `start` and `stop`: a timer that collects due entries and a
//! dispatcher that submits each fire on its own task. Fires carry the
//! generation of the entry they came from, and the dispatcher drops any fire
//! whose entry was deactivated or replaced in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::catalog::{AgentRef, Catalog, ScheduleEntry, ScheduleId};
use crate::error::{OrchestrationError, Result};
use crate::queue::RunSubmitter;
use crate::run::{RunId, RunRequest, RunSource};

/// How long `stop` waits for the timer and in-flight dispatches.
const STOP_WAIT: Duration = Duration::from_millis(500);

/// Timer sleep when nothing is scheduled; changes wake it earlier.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// A schedule as currently active, with its next fire time.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSchedule {
    pub entry: ScheduleEntry,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// One due occurrence of a schedule.
#[derive(Debug, Clone)]
pub struct Fire {
    pub schedule_id: ScheduleId,
    pub generation: u64,
    pub scheduled_at: DateTime<Utc>,
    pub entry: ScheduleEntry,
}

struct ScheduledJob {
    entry: ScheduleEntry,
    cron: Cron,
    next_fire: Option<DateTime<Utc>>,
    generation: u64,
}

struct Lifecycle {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct SchedulerInner {
    catalog: Option<Arc<dyn Catalog>>,
    submitter: Arc<dyn RunSubmitter>,
    jobs: Mutex<HashMap<ScheduleId, ScheduledJob>>,
    changed: Notify,
    generation: AtomicU64,
    lifecycle: Mutex<Option<Lifecycle>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Parse a 6-field (seconds first) cron expression.
pub fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_required()
        .parse()
        .map_err(|e| {
            OrchestrationError::ConfigurationError(format!(
                "invalid cron expression '{}': {}",
                expression, e
            ))
        })
}

fn next_after(cron: &Cron, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(&now, false).ok()
}

/// Run request for one fire of a schedule.
pub fn scheduled_request(fire: &Fire) -> RunRequest {
    let entry = &fire.entry;
    let input = entry.input.clone().unwrap_or_else(|| {
        match entry.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => {
                format!("Scheduled execution: {}", description)
            }
            _ => "Scheduled execution".to_string(),
        }
    });

    let mut variables = entry.variables.clone();
    variables.insert("source".to_string(), "cron_scheduler".to_string());
    variables.insert("cron_schedule".to_string(), entry.cron.clone());
    variables.insert("scheduled_at".to_string(), fire.scheduled_at.to_rfc3339());

    let agent = AgentRef {
        environment: entry.environment.clone(),
        agent: entry.agent.clone(),
    };
    RunRequest::new(agent, input)
        .with_variables(variables)
        .with_source(RunSource::Schedule)
}

impl Scheduler {
    pub fn new(submitter: Arc<dyn RunSubmitter>) -> Self {
        Self::build(submitter, None)
    }

    /// Scheduler that loads enabled catalog schedules on `start`.
    pub fn with_catalog(submitter: Arc<dyn RunSubmitter>, catalog: Arc<dyn Catalog>) -> Self {
        Self::build(submitter, Some(catalog))
    }

    fn build(submitter: Arc<dyn RunSubmitter>, catalog: Option<Arc<dyn Catalog>>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                catalog,
                submitter,
                jobs: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.is_some()
    }

    /// Load catalog schedules and start the timer. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return;
        }

        if let Some(catalog) = &self.inner.catalog {
            for entry in catalog.schedules().into_iter().filter(|e| e.enabled) {
                let id = entry.id.clone();
                if let Err(e) = self.add_or_activate(entry).await {
                    warn!(schedule = %id, error = %e, "Skipping invalid schedule");
                }
            }
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (fires_tx, fires_rx) = mpsc::unbounded_channel();
        tracker.spawn(self.clone().run_timer(fires_tx, cancel.clone()));
        tracker.spawn(
            self.clone()
                .run_dispatcher(fires_rx, cancel.clone(), tracker.clone()),
        );

        info!(
            schedules = self.inner.jobs.lock().await.len(),
            "Scheduler started"
        );
        *lifecycle = Some(Lifecycle { cancel, tracker });
    }

    /// Stop the timer and wait briefly for in-flight dispatches.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.inner.lifecycle.lock().await.take() else {
            return;
        };
        lifecycle.cancel.cancel();
        lifecycle.tracker.close();
        if tokio::time::timeout(STOP_WAIT, lifecycle.tracker.wait())
            .await
            .is_err()
        {
            warn!("Scheduler tasks did not stop in time");
        }
        info!("Scheduler stopped");
    }

    /// Add a schedule, or replace and re-activate an existing one.
    pub async fn add_or_activate(&self, mut entry: ScheduleEntry) -> Result<()> {
        let cron = parse_cron(&entry.cron)?;
        entry.enabled = true;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next_fire = next_after(&cron, Utc::now());

        debug!(schedule = %entry.id, cron = %entry.cron, next_fire = ?next_fire, "Schedule activated");
        self.inner.jobs.lock().await.insert(
            entry.id.clone(),
            ScheduledJob {
                entry,
                cron,
                next_fire,
                generation,
            },
        );
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Returns `false` if the schedule was not active.
    pub async fn deactivate(&self, id: &ScheduleId) -> bool {
        let removed = self.inner.jobs.lock().await.remove(id).is_some();
        if removed {
            debug!(schedule = %id, "Schedule deactivated");
            self.inner.changed.notify_one();
        }
        removed
    }

    pub async fn list_active(&self) -> Vec<ActiveSchedule> {
        let jobs = self.inner.jobs.lock().await;
        let mut active: Vec<ActiveSchedule> = jobs
            .values()
            .map(|job| ActiveSchedule {
                entry: job.entry.clone(),
                next_fire_at: job.next_fire,
            })
            .collect();
        active.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        active
    }

    /// Take every entry due at `now` once and advance it past `now`.
    ///
    /// Ticks missed while the timer was not running are not replayed.
    pub async fn collect_due(&self, now: DateTime<Utc>) -> Vec<Fire> {
        let mut jobs = self.inner.jobs.lock().await;
        let mut due = Vec::new();
        for (id, job) in jobs.iter_mut() {
            let Some(next) = job.next_fire else {
                continue;
            };
            if next > now {
                continue;
            }
            job.entry.last_fired_at = Some(next);
            job.next_fire = next_after(&job.cron, now);
            due.push(Fire {
                schedule_id: id.clone(),
                generation: job.generation,
                scheduled_at: next,
                entry: job.entry.clone(),
            });
        }
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due
    }

    pub async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.inner
            .jobs
            .lock()
            .await
            .values()
            .filter_map(|job| job.next_fire)
            .min()
    }

    async fn is_current(&self, fire: &Fire) -> bool {
        self.inner
            .jobs
            .lock()
            .await
            .get(&fire.schedule_id)
            .is_some_and(|job| job.generation == fire.generation)
    }

    /// Submit one fire unless its entry changed since it was collected.
    async fn dispatch(&self, fire: Fire) -> Option<RunId> {
        if !self.is_current(&fire).await {
            debug!(schedule = %fire.schedule_id, "Dropping fire for inactive schedule");
            return None;
        }
        match self.inner.submitter.submit(scheduled_request(&fire)).await {
            Ok(run_id) => {
                info!(
                    schedule = %fire.schedule_id,
                    run_id = %run_id,
                    scheduled_at = %fire.scheduled_at,
                    "Scheduled run enqueued"
                );
                Some(run_id)
            }
            Err(e) => {
                error!(schedule = %fire.schedule_id, error = %e, "Failed to enqueue scheduled run");
                None
            }
        }
    }

    async fn run_timer(self, fires: mpsc::UnboundedSender<Fire>, cancel: CancellationToken) {
        loop {
            for fire in self.collect_due(Utc::now()).await {
                if fires.send(fire).is_err() {
                    return;
                }
            }

            let wait = match self.next_wakeup().await {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => IDLE_WAIT,
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.inner.changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn run_dispatcher(
        self,
        mut fires: mpsc::UnboundedReceiver<Fire>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let fire = tokio::select! {
                _ = cancel.cancelled() => return,
                fire = fires.recv() => match fire {
                    Some(fire) => fire,
                    None => return,
                },
            };
            let scheduler = self.clone();
            tracker.spawn(async move {
                scheduler.dispatch(fire).await;
            });
        }
    }
}
