use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_retry::RetryIf;

use crate::config::CheckerConfig;
use crate::host::ExtractionRequest;
use crate::models::{generate_id, CheckResult, Task};
use crate::reliability::ReliabilityManager;
use crate::resource_manager::ResourceManager;
use crate::task_queue::TaskProcessor;
use crate::utils::error::AppError;
use crate::Result;

/// Cancels the extraction on the host if the attempt is dropped before it settles.
struct InFlightExtraction {
    resources: Arc<ResourceManager>,
    correlation_id: String,
    settled: bool,
}

impl InFlightExtraction {
    fn new(resources: Arc<ResourceManager>, correlation_id: &str) -> Self {
        Self {
            resources,
            correlation_id: correlation_id.to_string(),
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlightExtraction {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let resources = Arc::clone(&self.resources);
        let correlation_id = std::mem::take(&mut self.correlation_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                resources.cancel_extraction(&correlation_id).await;
            });
        }
    }
}

/// Fetches a task's fragment through the reliability wrapper.
pub struct ElementChecker {
    resources: Arc<ResourceManager>,
    reliability: Arc<ReliabilityManager>,
    config: CheckerConfig,
}

impl ElementChecker {
    pub fn new(reliability: Arc<ReliabilityManager>, config: CheckerConfig) -> Self {
        Self {
            resources: Arc::clone(reliability.resources()),
            reliability,
            config,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check `selector` on `url`, folding the outcome into a `CheckResult`.
    pub async fn check(&self, task_id: &str, url: &str, selector: &str, max_retries: u32) -> CheckResult {
        let attempts = AtomicU32::new(0);
        match self.run(url, selector, max_retries, &attempts).await {
            Ok(content) => CheckResult::success(task_id, content, attempts.load(Ordering::SeqCst)),
            Err(e) => CheckResult::failure(task_id, e.to_string(), attempts.load(Ordering::SeqCst)),
        }
    }

    pub async fn check_content(&self, url: &str, selector: &str, max_retries: u32) -> Result<String> {
        let attempts = AtomicU32::new(0);
        self.run(url, selector, max_retries, &attempts).await
    }

    async fn run(&self, url: &str, selector: &str, max_retries: u32, attempts: &AtomicU32) -> Result<String> {
        let not_found_retries = self.config.not_found_retries;
        let mut not_found = 0u32;

        #[allow(deprecated)]
        let result = RetryIf::spawn(
            self.config.retry_backoff.delays(max_retries),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(url, selector, attempt, "Checking element");
                self.attempt(url, selector)
            },
            |e: &AppError| {
                if e.is_recovery_exhausted() {
                    return false;
                }
                if e.is_element_not_found() {
                    not_found += 1;
                    return not_found <= not_found_retries;
                }
                !matches!(e.root_cause(), AppError::Validation(_))
            },
        )
        .await;

        if let Err(e) = &result {
            tracing::warn!(
                url,
                selector,
                attempts = attempts.load(Ordering::SeqCst),
                "Element check failed: {}",
                e
            );
        }
        result
    }

    async fn attempt(&self, url: &str, selector: &str) -> Result<String> {
        self.reliability.register_activity();
        self.reliability
            .with_reliability(|| self.extract_once(url, selector), self.config.reliability_attempts)
            .await
    }

    async fn extract_once(&self, url: &str, selector: &str) -> Result<String> {
        self.resources.ensure_resource().await?;

        let request = ExtractionRequest {
            url: url.to_string(),
            selector: selector.to_string(),
            correlation_id: generate_id(),
        };

        let mut in_flight = InFlightExtraction::new(Arc::clone(&self.resources), &request.correlation_id);
        let result = self
            .resources
            .extract(&request, self.config.extraction_timeout())
            .await;
        in_flight.settle();

        if let Err(AppError::Timeout { .. }) = &result {
            self.resources.cancel_extraction(&request.correlation_id).await;
        }
        result
    }
}

#[async_trait]
impl TaskProcessor for ElementChecker {
    async fn process(&self, task: &Task) -> Result<String> {
        self.check_content(&task.url, &task.selector, self.config.max_retries)
            .await
    }
}
