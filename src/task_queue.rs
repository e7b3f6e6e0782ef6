use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use validator::Validate;

use crate::config::QueueConfig;
use crate::models::{CheckResult, Task};
use crate::utils::error::AppError;
use crate::Result;

/// Runs one check for a queued task and returns the extracted content.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<String>;
}

/// A task admitted to the queue, together with the channel its caller waits on.
pub struct QueueItem {
    pub queue_id: String,
    pub task: Task,
    pub added_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    queued_at: Instant,
    responder: oneshot::Sender<Result<CheckResult>>,
}

impl QueueItem {
    fn respond(self, result: Result<CheckResult>) {
        // The caller may have stopped waiting
        let _ = self.responder.send(result);
    }
}

/// Caller side of an admitted task.
#[derive(Debug)]
pub struct CheckHandle {
    task_id: String,
    queue_id: String,
    receiver: oneshot::Receiver<Result<CheckResult>>,
}

impl CheckHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Resolves once the task succeeds, exhausts its retries, expires,
    /// is removed, or the queue shuts down.
    pub async fn wait(self) -> Result<CheckResult> {
        self.receiver.await.unwrap_or_else(|_| Err(AppError::QueueClosed))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    pub admitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
    pub timed_out: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub length: usize,
    pub waiting_retries: usize,
    pub capacity: usize,
    pub processing: bool,
    pub current_task: Option<String>,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

struct InFlight {
    task_id: String,
    removed: bool,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Failed items sleeping off their backoff; keyed by task id.
    waiting: HashMap<String, QueueItem>,
    in_flight: Option<InFlight>,
    counters: QueueCounters,
}

impl QueueState {
    fn contains(&self, task_id: &str) -> bool {
        self.items.iter().any(|item| item.task.id == task_id)
            || self.waiting.contains_key(task_id)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.task_id == task_id)
    }

    fn len(&self) -> usize {
        self.items.len() + self.waiting.len()
    }
}

/// Bounded, deduplicated FIFO that feeds tasks one at a time to a processor.
pub struct TaskQueue {
    processor: Arc<dyn TaskProcessor>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    wake: Notify,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<TaskQueue>,
}

impl TaskQueue {
    pub fn new(processor: Arc<dyn TaskProcessor>, config: QueueConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            processor,
            config,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn the single worker. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return;
        }
        let Some(queue) = self.this.upgrade() else {
            return;
        };
        *worker = Some(tokio::spawn(queue.run_worker()));
        tracing::info!("Task queue started (capacity {})", self.config.max_size);
    }

    /// Stop the worker and reject everything still pending.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }

        let pending: Vec<QueueItem> = {
            let mut state = self.state();
            state.in_flight = None;
            let mut pending: Vec<QueueItem> = state.items.drain(..).collect();
            pending.extend(state.waiting.drain().map(|(_, item)| item));
            pending
        };

        let count = pending.len();
        for item in pending {
            item.respond(Err(AppError::QueueClosed));
        }
        metrics::gauge!("watcher_queue_length").set(0.0);
        tracing::info!("Task queue shut down, {} pending tasks rejected", count);
    }

    /// Admit `task` for checking. Fails immediately for malformed tasks, a full
    /// queue, or a task that is already queued.
    pub fn add_task(&self, task: Task, max_retries: u32) -> Result<CheckHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::QueueClosed);
        }

        if let Err(e) = task.validate() {
            self.record_rejection(&task.id, "invalid");
            return Err(e.into());
        }

        let mut state = self.state();
        self.sweep_expired(&mut state);

        if state.contains(&task.id) {
            drop(state);
            self.record_rejection(&task.id, "duplicate");
            return Err(AppError::DuplicateTask { task_id: task.id });
        }

        if state.len() >= self.config.max_size {
            drop(state);
            self.record_rejection(&task.id, "full");
            return Err(AppError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        let (responder, receiver) = oneshot::channel();
        let added_at = Utc::now();
        let queue_id = format!("{}-{}", task.id, added_at.timestamp_millis());
        let task_id = task.id.clone();

        state.items.push_back(QueueItem {
            queue_id: queue_id.clone(),
            task,
            added_at,
            retry_count: 0,
            max_retries,
            queued_at: Instant::now(),
            responder,
        });
        state.counters.admitted += 1;
        let length = state.len();
        drop(state);

        metrics::counter!("watcher_queue_admitted_total").increment(1);
        metrics::gauge!("watcher_queue_length").set(length as f64);
        tracing::debug!(task_id = %task_id, queue_id = %queue_id, length, "Task admitted to queue");
        self.wake.notify_one();

        Ok(CheckHandle {
            task_id,
            queue_id,
            receiver,
        })
    }

    fn record_rejection(&self, task_id: &str, reason: &'static str) {
        self.state().counters.rejected += 1;
        metrics::counter!("watcher_queue_rejected_total", "reason" => reason).increment(1);
        tracing::debug!(task_id, reason, "Task rejected by queue");
    }

    /// Cancel a task. Queued and retry-waiting items are rejected right away;
    /// an item being processed has its result discarded and is not retried.
    pub fn remove_task(&self, task_id: &str) -> bool {
        let mut state = self.state();

        let removed = if let Some(index) = state.items.iter().position(|item| item.task.id == task_id) {
            state.items.remove(index)
        } else {
            state.waiting.remove(task_id)
        };

        if let Some(item) = removed {
            state.counters.removed += 1;
            drop(state);
            item.respond(Err(AppError::TaskRemoved {
                task_id: task_id.to_string(),
            }));
            tracing::info!(task_id, "Removed task from queue");
            return true;
        }

        if let Some(in_flight) = state.in_flight.as_mut() {
            if in_flight.task_id == task_id && !in_flight.removed {
                in_flight.removed = true;
                state.counters.removed += 1;
                tracing::info!(task_id, "Task removed while being processed, result will be discarded");
                return true;
            }
        }

        false
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.state().contains(task_id)
    }

    /// Queued plus retry-waiting items.
    pub fn len(&self) -> usize {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            length: state.items.len(),
            waiting_retries: state.waiting.len(),
            capacity: self.config.max_size,
            processing: state.in_flight.is_some(),
            current_task: state.in_flight.as_ref().map(|in_flight| in_flight.task_id.clone()),
            counters: state.counters.clone(),
        }
    }

    /// Reject items that have waited in the queue longer than the max lifetime.
    fn sweep_expired(&self, state: &mut QueueState) {
        let max_age = self.config.max_queue_age();
        let mut index = 0;
        while index < state.items.len() {
            if state.items[index].queued_at.elapsed() < max_age {
                index += 1;
                continue;
            }
            if let Some(item) = state.items.remove(index) {
                let waited_ms = item.queued_at.elapsed().as_millis() as u64;
                tracing::warn!(task_id = %item.task.id, waited_ms, "Task timed out in queue");
                metrics::counter!("watcher_queue_expired_total").increment(1);
                state.counters.expired += 1;
                let task_id = item.task.id.clone();
                item.respond(Err(AppError::QueueTimeout { task_id, waited_ms }));
            }
        }
    }

    fn next_item(&self) -> Option<QueueItem> {
        let mut state = self.state();
        self.sweep_expired(&mut state);
        let item = state.items.pop_front()?;
        state.in_flight = Some(InFlight {
            task_id: item.task.id.clone(),
            removed: false,
        });
        metrics::gauge!("watcher_queue_length").set(state.len() as f64);
        Some(item)
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match self.next_item() {
                Some(item) => self.process_item(item).await,
                None => self.wake.notified().await,
            }
        }
    }

    async fn process_item(&self, item: QueueItem) {
        tracing::debug!(
            task_id = %item.task.id,
            retry = item.retry_count,
            max_retries = item.max_retries,
            "Processing task"
        );

        let processing_timeout = self.config.processing_timeout();
        let result = match timeout(processing_timeout, self.processor.process(&item.task)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    task_id = %item.task.id,
                    "Task processing timed out after {}s",
                    self.config.processing_timeout_secs
                );
                metrics::counter!("watcher_queue_timeouts_total").increment(1);
                self.state().counters.timed_out += 1;
                Err(AppError::timeout("Task processing", processing_timeout))
            }
        };

        self.settle(item, result);
    }

    fn settle(&self, mut item: QueueItem, result: Result<String>) {
        let mut state = self.state();
        let removed = state
            .in_flight
            .take()
            .is_some_and(|in_flight| in_flight.removed);
        let task_id = item.task.id.clone();

        if removed {
            drop(state);
            item.respond(Err(AppError::TaskRemoved { task_id }));
            return;
        }

        match result {
            Ok(content) => {
                state.counters.completed += 1;
                drop(state);
                let attempts = item.retry_count + 1;
                tracing::debug!(task_id = %task_id, attempts, "Task check completed");
                item.respond(Ok(CheckResult::success(task_id, content, attempts)));
            }
            Err(e) if item.retry_count < item.max_retries && !self.closed.load(Ordering::SeqCst) => {
                item.retry_count += 1;
                state.counters.retried += 1;
                let retry = item.retry_count;
                let delay = self.config.retry_backoff.delay_for(retry);
                tracing::info!(
                    task_id = %task_id,
                    retry,
                    max_retries = item.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Task check failed, retrying: {}",
                    e
                );
                metrics::counter!("watcher_queue_retries_total").increment(1);
                state.waiting.insert(task_id.clone(), item);
                drop(state);
                self.schedule_requeue(task_id, retry, delay);
            }
            Err(e) => {
                state.counters.failed += 1;
                drop(state);
                tracing::warn!(
                    task_id = %task_id,
                    attempts = item.retry_count + 1,
                    "Task check failed permanently: {}",
                    e
                );
                metrics::counter!("watcher_queue_failures_total").increment(1);
                item.respond(Err(e));
            }
        }
    }

    fn schedule_requeue(&self, task_id: String, retry: u32, delay: Duration) {
        let queue = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.requeue_front(&task_id, retry);
            }
        });
    }

    /// Retries go to the front so a failing item is settled before newer work.
    fn requeue_front(&self, task_id: &str, retry: u32) {
        let mut state = self.state();
        let current = state
            .waiting
            .get(task_id)
            .is_some_and(|item| item.retry_count == retry);
        if !current {
            return;
        }
        if let Some(mut item) = state.waiting.remove(task_id) {
            item.queued_at = Instant::now();
            state.items.push_front(item);
        }
        drop(state);
        self.wake.notify_one();
    }
}
