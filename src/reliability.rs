use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ReliabilityConfig;
use crate::host::PingStatus;
use crate::resource_manager::{ResourceManager, ResourceSnapshot};
use crate::utils::error::AppError;
use crate::Result;

const MAX_RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReliabilityState {
    pub is_healthy: bool,
    pub consecutive_errors: u32,
    pub total_recoveries: u32,
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub recent_errors: VecDeque<ErrorRecord>,
    pub recovering: bool,
    /// Every recovery attempt failed; guarded operations fail fast until a
    /// health check passes or the state is reset.
    pub recovery_exhausted: bool,
    /// The sandbox is absent on purpose (idle, or not needed yet).
    pub idle_closed: bool,
}

impl Default for ReliabilityState {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_errors: 0,
            total_recoveries: 0,
            last_recovery_at: None,
            last_activity_at: Utc::now(),
            last_health_check_at: None,
            recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
            recovering: false,
            recovery_exhausted: false,
            // No sandbox until the first check asks for one
            idle_closed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub exists: bool,
    pub responsive: bool,
    pub is_healthy: bool,
    pub consecutive_errors: u32,
    pub total_recoveries: u32,
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub recovering: bool,
    pub recovery_exhausted: bool,
    pub recent_errors: Vec<ErrorRecord>,
    pub resource: ResourceSnapshot,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

struct Inner {
    state: ReliabilityState,
    last_activity: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct RecoverySignal {
    generation: u64,
    succeeded: bool,
}

enum RecoveryClaim {
    Owner,
    Waiter(watch::Receiver<RecoverySignal>),
}

/// Health checks, error accounting and recovery for the shared sandbox.
pub struct ReliabilityManager {
    resources: Arc<ResourceManager>,
    config: ReliabilityConfig,
    inner: Mutex<Inner>,
    recovery: watch::Sender<RecoverySignal>,
    in_flight: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
    this: Weak<ReliabilityManager>,
}

struct OperationGuard<'a>(&'a AtomicUsize);

impl<'a> OperationGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases the `recovering` flag and publishes the outcome, even when the
/// recovering future is dropped.
struct RecoveryGuard<'a> {
    manager: &'a ReliabilityManager,
    succeeded: bool,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.manager.inner().state.recovering = false;
        let succeeded = self.succeeded;
        self.manager.recovery.send_modify(|signal| {
            signal.generation += 1;
            signal.succeeded = succeeded;
        });
    }
}

impl ReliabilityManager {
    pub fn new(resources: Arc<ResourceManager>, config: ReliabilityConfig) -> Arc<Self> {
        let (recovery, _) = watch::channel(RecoverySignal::default());
        Arc::new_cyclic(|this| Self {
            resources,
            config,
            inner: Mutex::new(Inner {
                state: ReliabilityState::default(),
                last_activity: Instant::now(),
            }),
            recovery,
            in_flight: AtomicUsize::new(0),
            monitor: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Start the periodic health check.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if monitor.is_some() {
            return;
        }

        let this = self.this.clone();
        let period = self.config.health_check_interval();
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.run_health_cycle().await;
            }
        }));

        tracing::info!(
            "Reliability monitor started (health check every {}s)",
            self.config.health_check_interval_secs
        );
    }

    pub fn stop(&self) {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("Reliability monitor stopped");
        }
    }

    pub fn state(&self) -> ReliabilityState {
        self.inner().state.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner().state.is_healthy
    }

    pub fn register_activity(&self) {
        let mut inner = self.inner();
        inner.last_activity = Instant::now();
        inner.state.last_activity_at = Utc::now();
    }

    /// One timer tick: close an idle sandbox, otherwise health-check it.
    async fn run_health_cycle(&self) {
        let (idle, idle_closed, recovering) = {
            let inner = self.inner();
            (
                inner.last_activity.elapsed() >= self.config.idle_timeout(),
                inner.state.idle_closed,
                inner.state.recovering,
            )
        };

        if recovering || idle_closed {
            return;
        }

        if idle && self.in_flight.load(Ordering::SeqCst) == 0 {
            tracing::info!(
                "No activity for {}s, closing idle sandbox",
                self.config.idle_timeout_secs
            );
            if let Err(e) = self.resources.close_resource().await {
                tracing::warn!("Failed to close idle sandbox: {}", e);
            }
            self.inner().state.idle_closed = true;
            return;
        }

        self.health_check().await;
    }

    /// Verify the sandbox exists and answers a ping.
    pub async fn health_check(&self) -> bool {
        self.resources.invalidate_cache();

        let failure = if !self.resources.has_resource().await {
            Some("Sandbox does not exist".to_string())
        } else {
            match self.resources.ping(self.config.ping_timeout()).await {
                Ok(PingStatus::Alive) => None,
                Ok(PingStatus::Unresponsive) => Some("Sandbox is unresponsive".to_string()),
                Err(e) => Some(format!("Ping failed: {}", e)),
            }
        };

        let Some(message) = failure else {
            let mut inner = self.inner();
            inner.state.consecutive_errors = 0;
            inner.state.is_healthy = true;
            inner.state.recovery_exhausted = false;
            inner.state.last_health_check_at = Some(Utc::now());
            tracing::debug!("Health check passed");
            return true;
        };

        // A ping can legitimately lose to a running extraction; count it but
        // leave the health flag alone.
        let busy = self.in_flight.load(Ordering::SeqCst) > 0;
        {
            let mut inner = self.inner();
            inner.state.last_health_check_at = Some(Utc::now());
            if !busy {
                inner.state.is_healthy = false;
            }
        }

        tracing::warn!(busy, "Health check failed: {}", message);
        metrics::counter!("watcher_health_check_failures_total").increment(1);
        self.add_error(message);
        false
    }

    fn push_recent_error(state: &mut ReliabilityState, message: String) {
        if state.recent_errors.len() >= MAX_RECENT_ERRORS {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(ErrorRecord {
            at: Utc::now(),
            message,
        });
    }

    /// Record a sandbox failure. Crossing the error threshold starts a
    /// recovery in the background unless one is already running.
    pub fn add_error(&self, message: impl Into<String>) {
        let trigger = {
            let mut inner = self.inner();
            Self::push_recent_error(&mut inner.state, message.into());
            inner.state.consecutive_errors += 1;

            if inner.state.consecutive_errors >= self.config.error_threshold && !inner.state.recovering {
                inner.state.recovering = true;
                true
            } else {
                false
            }
        };

        if !trigger {
            return;
        }

        tracing::warn!(
            "Error threshold of {} reached, triggering recovery",
            self.config.error_threshold
        );
        match self.this.upgrade() {
            Some(this) => {
                tokio::spawn(async move {
                    if let Err(e) = this.run_recovery().await {
                        tracing::error!("Background recovery failed: {}", e);
                    }
                });
            }
            None => self.inner().state.recovering = false,
        }
    }

    fn claim_recovery(&self) -> RecoveryClaim {
        let mut inner = self.inner();
        if inner.state.recovering {
            RecoveryClaim::Waiter(self.recovery.subscribe())
        } else {
            inner.state.recovering = true;
            RecoveryClaim::Owner
        }
    }

    /// Close and recreate the sandbox. Callers arriving while a cycle is
    /// running share its outcome.
    pub async fn recover(&self) -> Result<()> {
        match self.claim_recovery() {
            RecoveryClaim::Owner => self.run_recovery().await,
            RecoveryClaim::Waiter(mut rx) => {
                tracing::debug!("Recovery already running, waiting for its outcome");
                rx.changed()
                    .await
                    .map_err(|_| AppError::Internal("recovery signal dropped".into()))?;
                if rx.borrow().succeeded {
                    Ok(())
                } else {
                    Err(AppError::RecoveryExhausted {
                        attempts: self.config.max_recovery_attempts,
                    })
                }
            }
        }
    }

    /// Expects the `recovering` flag to be claimed already.
    async fn run_recovery(&self) -> Result<()> {
        let mut guard = RecoveryGuard {
            manager: self,
            succeeded: false,
        };
        let max_attempts = self.config.max_recovery_attempts;

        tracing::warn!("Starting sandbox recovery (up to {} attempts)", max_attempts);
        metrics::counter!("watcher_recoveries_started_total").increment(1);

        for attempt in 1..=max_attempts {
            self.resources.force_close().await;
            tokio::time::sleep(self.config.recovery_delay()).await;

            if let Err(e) = self.resources.ensure_resource().await {
                tracing::warn!(attempt, "Recovery could not recreate sandbox: {}", e);
                Self::push_recent_error(
                    &mut self.inner().state,
                    format!("Recovery attempt {} failed: {}", attempt, e),
                );
                continue;
            }

            if self.health_check().await {
                {
                    let mut inner = self.inner();
                    let state = &mut inner.state;
                    state.total_recoveries += 1;
                    state.last_recovery_at = Some(Utc::now());
                    state.consecutive_errors = 0;
                    state.is_healthy = true;
                    state.recovery_exhausted = false;
                    state.idle_closed = false;
                }
                tracing::info!("Sandbox recovered on attempt {}", attempt);
                metrics::counter!("watcher_recoveries_succeeded_total").increment(1);
                guard.succeeded = true;
                return Ok(());
            }
        }

        {
            let mut inner = self.inner();
            inner.state.is_healthy = false;
            inner.state.recovery_exhausted = true;
        }
        tracing::error!("Sandbox recovery exhausted after {} attempts", max_attempts);
        metrics::counter!("watcher_recoveries_exhausted_total").increment(1);
        Err(AppError::RecoveryExhausted {
            attempts: max_attempts,
        })
    }

    fn record_success(&self) {
        let mut inner = self.inner();
        inner.state.consecutive_errors = 0;
        inner.state.is_healthy = true;
        inner.state.idle_closed = false;
    }

    /// Run `operation` with recovery between failed attempts.
    ///
    /// Page-level failures (e.g. a selector matching nothing) say nothing
    /// about the sandbox and are returned as-is without recovery.
    pub async fn with_reliability<T, F, Fut>(&self, mut operation: F, max_attempts: u32) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.inner().state.recovery_exhausted {
            return Err(AppError::RecoveryExhausted {
                attempts: self.config.max_recovery_attempts,
            });
        }

        let max_attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if !self.is_healthy() {
                self.recover().await?;
            }

            let result = {
                let _operation = OperationGuard::new(&self.in_flight);
                operation().await
            };

            match result {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) if !e.indicates_resource_fault() => {
                    tracing::debug!("Guarded operation failed without a sandbox fault: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, "Guarded operation failed: {}", e);
                    self.add_error(e.to_string());
                    last_error = Some(e);

                    if attempt < max_attempts {
                        self.recover().await?;
                        tokio::time::sleep(self.config.operation_retry_delay()).await;
                    }
                }
            }
        }

        Err(AppError::RetriesExhausted {
            attempts: max_attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| AppError::Internal("no attempt was made".into())),
            ),
        })
    }

    /// Read-only snapshot of sandbox health with suggested actions.
    pub async fn perform_diagnostics(&self) -> DiagnosticsReport {
        let exists = self.resources.has_resource().await;
        let responsive = exists
            && matches!(
                self.resources.ping(self.config.ping_timeout()).await,
                Ok(PingStatus::Alive)
            );
        let state = self.state();
        let recommendations = recommendations(&state, exists, responsive, self.config.error_threshold);

        DiagnosticsReport {
            exists,
            responsive,
            is_healthy: state.is_healthy,
            consecutive_errors: state.consecutive_errors,
            total_recoveries: state.total_recoveries,
            last_recovery_at: state.last_recovery_at,
            recovering: state.recovering,
            recovery_exhausted: state.recovery_exhausted,
            recent_errors: state.recent_errors.iter().cloned().collect(),
            resource: self.resources.snapshot(),
            recommendations,
            generated_at: Utc::now(),
        }
    }

    /// Manual reset after an operator has fixed the host.
    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.state.is_healthy = true;
        inner.state.consecutive_errors = 0;
        inner.state.recovery_exhausted = false;
        inner.state.recent_errors.clear();
        tracing::info!("Reliability state reset");
    }
}

fn recommendations(state: &ReliabilityState, exists: bool, responsive: bool, threshold: u32) -> Vec<String> {
    let mut recommendations = Vec::new();

    if state.recovery_exhausted {
        recommendations.push(
            "Automatic recovery is exhausted; check the browser installation, then reset the reliability state"
                .to_string(),
        );
    }
    if !exists {
        if state.idle_closed {
            recommendations.push("Sandbox is closed while idle; it will start on the next check".to_string());
        } else {
            recommendations.push("Sandbox is missing; trigger a recovery".to_string());
        }
    } else if !responsive {
        recommendations.push("Sandbox exists but does not answer pings; trigger a recovery".to_string());
    }
    if state.consecutive_errors >= threshold {
        recommendations.push(format!(
            "{} consecutive errors (threshold {}); recent errors may point at the cause",
            state.consecutive_errors, threshold
        ));
    }
    if state.total_recoveries >= 3 {
        recommendations.push(format!(
            "{} recoveries so far; consider longer check intervals or fewer tasks",
            state.total_recoveries
        ));
    }
    if recommendations.is_empty() {
        recommendations.push("No issues detected".to_string());
    }

    recommendations
}
