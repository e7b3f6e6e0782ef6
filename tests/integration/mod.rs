// Shared fixtures for the end-to-end tests: an in-memory rendering host, a
// notifier that records what it was told, and a configuration with short timeouts.

pub mod queue_tests;
pub mod reliability_tests;
pub mod scheduler_tests;
pub mod web_tests;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fragment_watcher::config::AppConfig;
use fragment_watcher::host::{CreateOutcome, ExtractionRequest, PingStatus, RenderingHost};
use fragment_watcher::models::{CheckInterval, NewTask, Task};
use fragment_watcher::plugins::{ChangeEvent, NotificationHub, NotifierPlugin};
use fragment_watcher::storage::MemoryTaskStore;
use fragment_watcher::utils::BackoffPolicy;
use fragment_watcher::{AppError, Result, Watcher};

/// Rendering host backed by a url -> fragment map.
#[derive(Default)]
pub struct FakeHost {
    pages: Mutex<HashMap<String, String>>,
    alive: AtomicBool,
    ping_failures: AtomicU32,
    create_failures: AtomicU32,
    extract_failures: AtomicU32,
    extract_delay: Mutex<Option<Duration>>,
    pub creates: AtomicU32,
    pub destroys: AtomicU32,
    pub pings: AtomicU32,
    pub extractions: AtomicU32,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_sandbox() -> Arc<Self> {
        let host = Self::default();
        host.alive.store(true, Ordering::SeqCst);
        Arc::new(host)
    }

    pub fn set_page(&self, url: &str, fragment: &str) {
        self.pages.lock().unwrap().insert(url.to_string(), fragment.to_string());
    }

    pub fn fail_next_pings(&self, count: u32) {
        self.ping_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` extractions report the element as missing.
    pub fn fail_next_extractions(&self, count: u32) {
        self.extract_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_extract_delay(&self, delay: Duration) {
        *self.extract_delay.lock().unwrap() = Some(delay);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RenderingHost for FakeHost {
    async fn exists(&self) -> Result<bool> {
        Ok(self.is_alive())
    }

    async fn create(&self) -> Result<CreateOutcome> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.create_failures) {
            return Err(AppError::Resource("browser failed to launch".into()));
        }
        if self.alive.swap(true, Ordering::SeqCst) {
            Ok(CreateOutcome::AlreadyExists)
        } else {
            Ok(CreateOutcome::Created)
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<PingStatus> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.ping_failures) {
            return Ok(PingStatus::Unresponsive);
        }
        Ok(PingStatus::Alive)
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        let delay = *self.extract_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.extract_failures) {
            return Err(AppError::ElementNotFound {
                selector: request.selector.clone(),
            });
        }
        self.pages
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| AppError::ElementNotFound {
                selector: request.selector.clone(),
            })
    }

    async fn cancel(&self, correlation_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(correlation_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub changes: Mutex<Vec<ChangeEvent>>,
    pub badges: Mutex<Vec<usize>>,
}

#[async_trait]
impl NotifierPlugin for RecordingNotifier {
    fn name(&self) -> &str {
        "Recording Notifier"
    }

    fn plugin_type(&self) -> &str {
        "recording"
    }

    async fn notify_change(&self, event: &ChangeEvent) -> Result<()> {
        self.changes.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn update_badge(&self, changed_count: usize) -> Result<()> {
        self.badges.lock().unwrap().push(changed_count);
        Ok(())
    }
}

/// Defaults with retries and delays cut down so tests run quickly.
pub fn get_test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.enabled = false;
    config.database.url = "sqlite::memory:".to_string();
    config.resource.cache_window_ms = 0;
    config.reliability.recovery_delay_ms = 10;
    config.reliability.operation_retry_delay_ms = 10;
    config.checker.max_retries = 0;
    config.checker.retry_backoff = BackoffPolicy::None;
    config.checker.extraction_timeout_ms = 5_000;
    config.queue.default_max_retries = 0;
    config.queue.retry_backoff = BackoffPolicy::None;
    config.scheduler.check_on_startup = false;
    config
}

pub struct TestWatcher {
    pub watcher: Arc<Watcher>,
    pub host: Arc<FakeHost>,
    pub store: Arc<MemoryTaskStore>,
    pub notifier: Arc<RecordingNotifier>,
}

/// A watcher with its queue worker running; the timers are left off so tests
/// drive ticks and health checks explicitly.
pub async fn create_test_watcher(config: AppConfig, host: Arc<FakeHost>, tasks: Vec<Task>) -> TestWatcher {
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let hub = NotificationHub::new(config.notifications.notify_timeout());
    let notifier = Arc::new(RecordingNotifier::default());
    hub.register_notifier(notifier.clone()).await;

    let watcher = Arc::new(Watcher::new(config, host.clone(), store.clone(), hub));
    watcher.queue().start();

    TestWatcher {
        watcher,
        host,
        store,
        notifier,
    }
}

pub fn create_test_task(url: &str, current_content: Option<&str>) -> Task {
    Task::new(NewTask {
        url: url.to_string(),
        selector: "#headline".to_string(),
        interval: Some(CheckInterval::FifteenMinutes),
        initial_content: current_content.map(str::to_string),
    })
}

/// Poll `condition` on the (possibly paused) tokio clock.
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
