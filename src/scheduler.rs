use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_cron_scheduler::{Job, JobScheduler};
use validator::Validate;

use crate::config::SchedulerConfig;
use crate::models::{CheckOutcome, CheckResult, NewTask, Task, TaskStatus};
use crate::plugins::{ChangeEvent, NotificationHub};
use crate::storage::TaskStore;
use crate::task_queue::{CheckHandle, TaskQueue};
use crate::utils::error::AppError;
use crate::Result;

/// Fold one check outcome into `task`. Returns the change to announce, if any.
///
/// The first successful check only records a baseline. Content equal to the
/// stored fragment leaves `status` and `last_changed_at` untouched.
pub fn apply_check_result(task: &mut Task, result: &CheckResult, error_threshold: u32) -> Option<ChangeEvent> {
    task.last_checked_at = Some(result.checked_at);

    match &result.outcome {
        CheckOutcome::Content(content) => {
            task.consecutive_errors = 0;
            task.last_error = None;
            if task.status == TaskStatus::Error {
                task.status = TaskStatus::Active;
            }

            match task.current_content.as_deref() {
                Some(previous) if previous == content => None,
                Some(previous) if !previous.is_empty() => {
                    let previous_content = task.current_content.replace(content.clone());
                    task.last_changed_at = Some(result.checked_at);
                    // Paused while the check was running: keep the content, stay quiet
                    if task.status == TaskStatus::Paused {
                        return None;
                    }
                    task.status = TaskStatus::Changed;
                    Some(ChangeEvent {
                        task_id: task.id.clone(),
                        url: task.url.clone(),
                        selector: task.selector.clone(),
                        previous_content,
                        current_content: content.clone(),
                        changed_at: result.checked_at,
                    })
                }
                _ => {
                    task.current_content = Some(content.clone());
                    None
                }
            }
        }
        CheckOutcome::Error(error) => {
            task.consecutive_errors = task.consecutive_errors.saturating_add(1);
            task.last_error = Some(error.clone());
            if task.consecutive_errors >= error_threshold && task.status != TaskStatus::Paused {
                task.status = TaskStatus::Error;
            }
            None
        }
    }
}

fn count_changed(tasks: &[Task]) -> usize {
    tasks.iter().filter(|t| t.status == TaskStatus::Changed).count()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Another tick was still running; nothing was done.
    pub skipped: bool,
    pub due: usize,
    pub admitted: usize,
    pub already_queued: usize,
    pub rejected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub tick_in_progress: bool,
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub tick_failures: u64,
    pub checks_completed: u64,
    pub checks_failed: u64,
    pub changes_detected: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_duration_ms: Option<u64>,
    pub uptime_seconds: u64,
}

/// Resets the overlap flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Settled {
    Applied { success: bool, changed: bool },
    Dropped,
}

/// Periodic trigger: selects due tasks, feeds them to the queue and applies
/// the outcomes to the stored task list.
pub struct WatchScheduler {
    store: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    hub: NotificationHub,
    config: SchedulerConfig,
    jobs: tokio::sync::Mutex<Option<JobScheduler>>,
    // Serializes read-modify-write of the task list
    persist_lock: tokio::sync::Mutex<()>,
    ticking: AtomicBool,
    stats: Mutex<SchedulerStats>,
    started_at: DateTime<Utc>,
    this: Weak<WatchScheduler>,
}

impl WatchScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<TaskQueue>,
        hub: NotificationHub,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            queue,
            hub,
            config,
            jobs: tokio::sync::Mutex::new(None),
            persist_lock: tokio::sync::Mutex::new(()),
            ticking: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStats::default()),
            started_at: Utc::now(),
            this: this.clone(),
        })
    }

    fn stats_mut(&self) -> MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Register the repeating tick and, if configured, run one right away.
    pub async fn start(&self) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            return Ok(());
        }

        let scheduler = JobScheduler::new().await.map_err(job_error)?;
        let weak = self.this.clone();
        let job = Job::new_repeated_async(self.config.tick_interval(), move |_uuid, _l| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.tick().await;
                }
            })
        })
        .map_err(job_error)?;

        scheduler.add(job).await.map_err(job_error)?;
        scheduler.start().await.map_err(job_error)?;
        *jobs = Some(scheduler);
        self.stats_mut().running = true;

        tracing::info!(
            "Watch scheduler started, ticking every {}s",
            self.config.tick_interval_secs
        );

        if self.config.check_on_startup {
            if let Some(scheduler) = self.this.upgrade() {
                tokio::spawn(async move {
                    scheduler.tick().await;
                });
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let scheduler = self.jobs.lock().await.take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await.map_err(job_error)?;
        }
        self.stats_mut().running = false;
        tracing::info!("Watch scheduler shutdown");
        Ok(())
    }

    /// Timer entry point. Never fails; errors are logged so the job re-arms.
    pub async fn tick(&self) -> Option<TickReport> {
        match self.run_tick().await {
            Ok(report) => Some(report),
            Err(e) => {
                self.stats_mut().tick_failures += 1;
                metrics::counter!("watcher_tick_failures_total").increment(1);
                tracing::error!("Scheduler tick failed: {}", e);
                None
            }
        }
    }

    pub async fn run_tick(&self) -> Result<TickReport> {
        self.run_tick_at(Utc::now()).await
    }

    /// One tick evaluated against `now`. A tick started while another is
    /// still in flight returns immediately with `skipped` set.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stats_mut().ticks_skipped += 1;
            metrics::counter!("watcher_ticks_skipped_total").increment(1);
            tracing::debug!("Previous tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        }
        let _guard = TickGuard(&self.ticking);
        let started = tokio::time::Instant::now();
        metrics::counter!("watcher_ticks_total").increment(1);

        let tasks = self.store.load_tasks().await?;
        let due: Vec<Task> = tasks.into_iter().filter(|t| t.is_due(now)).collect();

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        let mut pending = FuturesUnordered::new();
        for task in due {
            if self.queue.contains(&task.id) {
                report.already_queued += 1;
                continue;
            }

            let task_id = task.id.clone();
            match self.queue.add_task(task, self.queue.config().default_max_retries) {
                Ok(handle) => {
                    report.admitted += 1;
                    pending.push(wait_for(handle));
                }
                Err(AppError::Validation(message)) => {
                    report.rejected += 1;
                    tracing::warn!(task_id = %task_id, "Stored task is malformed: {}", message);
                    let failure = CheckResult::failure(&task_id, format!("Validation error: {}", message), 0);
                    self.record(self.settle(&task_id, Ok(failure)).await, &mut report);
                }
                Err(e) => {
                    report.rejected += 1;
                    tracing::warn!(task_id = %task_id, "Task not admitted: {}", e);
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                admitted = report.admitted,
                already_queued = report.already_queued,
                "Scheduler tick admitted tasks"
            );
        }

        while let Some((task_id, outcome)) = pending.next().await {
            let settled = self.settle(&task_id, outcome).await;
            self.record(settled, &mut report);
        }

        {
            let mut stats = self.stats_mut();
            stats.ticks_run += 1;
            stats.last_tick_at = Some(now);
            stats.last_tick_duration_ms = Some(started.elapsed().as_millis() as u64);
        }

        tracing::debug!(?report, "Scheduler tick finished");
        Ok(report)
    }

    fn record(&self, settled: Settled, report: &mut TickReport) {
        match settled {
            Settled::Applied { success, changed } => {
                if success {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
                if changed {
                    report.changed += 1;
                }
            }
            Settled::Dropped => {}
        }
    }

    /// Apply a queue outcome. Removal and shutdown are not the task's fault.
    async fn settle(&self, task_id: &str, outcome: Result<CheckResult>) -> Settled {
        let result = match outcome {
            Ok(result) => result,
            Err(AppError::TaskRemoved { .. }) | Err(AppError::QueueClosed) => return Settled::Dropped,
            Err(e) => CheckResult::failure(task_id, e.to_string(), 0),
        };

        match self.persist_result(&result).await {
            Ok(Some(changed)) => Settled::Applied {
                success: result.is_success(),
                changed,
            },
            Ok(None) => Settled::Dropped,
            Err(e) => {
                tracing::error!(task_id, "Failed to persist check result: {}", e);
                Settled::Dropped
            }
        }
    }

    /// Re-read the task list, fold `result` in and rewrite the full list.
    /// Returns `None` if the task was deleted while it was being checked.
    async fn persist_result(&self, result: &CheckResult) -> Result<Option<bool>> {
        let (event, changed_count) = {
            let _lock = self.persist_lock.lock().await;
            let mut tasks = self.store.load_tasks().await?;
            let Some(task) = tasks.iter_mut().find(|t| t.id == result.task_id) else {
                tracing::debug!(task_id = %result.task_id, "Task removed before its result arrived");
                return Ok(None);
            };

            let event = apply_check_result(task, result, self.config.task_error_threshold);
            if task.status == TaskStatus::Error && !result.is_success() {
                tracing::warn!(
                    task_id = %task.id,
                    consecutive_errors = task.consecutive_errors,
                    "Task marked as failing"
                );
            }
            let changed_count = count_changed(&tasks);
            self.store.save_tasks(&tasks).await?;
            (event, changed_count)
        };

        {
            let mut stats = self.stats_mut();
            if result.is_success() {
                stats.checks_completed += 1;
            } else {
                stats.checks_failed += 1;
            }
            if event.is_some() {
                stats.changes_detected += 1;
            }
        }

        let changed = event.is_some();
        if let Some(event) = event {
            metrics::counter!("watcher_changes_detected_total").increment(1);
            self.hub.notify_change(&event).await;
        }
        metrics::gauge!("watcher_changed_tasks").set(changed_count as f64);
        self.hub.update_badge(changed_count).await;

        Ok(Some(changed))
    }

    /// Check one task immediately, regardless of its interval.
    pub async fn check_now(&self, task_id: &str) -> Result<CheckResult> {
        let task = self.find_task(task_id).await?;
        let handle = self
            .queue
            .add_task(task, self.queue.config().default_max_retries)?;

        let result = match handle.wait().await {
            Ok(result) => result,
            Err(e @ (AppError::TaskRemoved { .. } | AppError::QueueClosed)) => return Err(e),
            Err(e) => CheckResult::failure(task_id, e.to_string(), 0),
        };

        if self.persist_result(&result).await?.is_none() {
            return Err(AppError::NotFound {
                resource: format!("task {}", task_id),
            });
        }
        Ok(result)
    }

    /// Persist a new task; it is due on the next tick.
    pub async fn add_task(&self, new_task: NewTask) -> Result<Task> {
        let task = Task::new(new_task);
        task.validate()?;

        let _lock = self.persist_lock.lock().await;
        let mut tasks = self.store.load_tasks().await?;
        tasks.push(task.clone());
        self.store.save_tasks(&tasks).await?;

        tracing::info!(task_id = %task.id, url = %task.url, "Task added");
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.load_tasks().await
    }

    /// Delete the task from storage and from the queue. Returns whether it existed.
    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        let existed = {
            let _lock = self.persist_lock.lock().await;
            let mut tasks = self.store.load_tasks().await?;
            let before = tasks.len();
            tasks.retain(|t| t.id != task_id);
            let existed = tasks.len() != before;
            if existed {
                self.store.save_tasks(&tasks).await?;
            }
            existed
        };

        let dequeued = self.queue.remove_task(task_id);
        if existed {
            tracing::info!(task_id, dequeued, "Task removed");
        }
        Ok(existed || dequeued)
    }

    /// Mark a changed task as seen.
    pub async fn acknowledge(&self, task_id: &str) -> Result<Task> {
        let (task, changed_count) = {
            let _lock = self.persist_lock.lock().await;
            let mut tasks = self.store.load_tasks().await?;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| AppError::NotFound {
                    resource: format!("task {}", task_id),
                })?;
            if task.status == TaskStatus::Changed {
                task.status = TaskStatus::Active;
            }
            let task = task.clone();
            let changed_count = count_changed(&tasks);
            self.store.save_tasks(&tasks).await?;
            (task, changed_count)
        };

        metrics::gauge!("watcher_changed_tasks").set(changed_count as f64);
        self.hub.update_badge(changed_count).await;
        Ok(task)
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats_mut().clone();
        stats.tick_in_progress = self.ticking.load(Ordering::SeqCst);
        stats.uptime_seconds = Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64;
        stats
    }

    async fn find_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .load_tasks()
            .await?
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AppError::NotFound {
                resource: format!("task {}", task_id),
            })
    }
}

async fn wait_for(handle: CheckHandle) -> (String, Result<CheckResult>) {
    let task_id = handle.task_id().to_string();
    (task_id, handle.wait().await)
}

fn job_error(e: tokio_cron_scheduler::JobSchedulerError) -> AppError {
    AppError::Internal(format!("Job scheduler error: {}", e))
}
