use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::commands::{self, Command, CommandResponse};
use crate::config::AppConfig;
use crate::element_checker::ElementChecker;
use crate::host::RenderingHost;
use crate::plugins::NotificationHub;
use crate::reliability::{DiagnosticsReport, ReliabilityManager};
use crate::resource_manager::ResourceManager;
use crate::scheduler::{SchedulerStats, WatchScheduler};
use crate::storage::TaskStore;
use crate::task_queue::{QueueStats, TaskQueue};
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SystemDiagnostics {
    pub queue: QueueStats,
    pub reliability: DiagnosticsReport,
    pub scheduler: SchedulerStats,
    pub generated_at: DateTime<Utc>,
}

/// Wires the components together and owns their lifecycles.
pub struct Watcher {
    config: AppConfig,
    resources: Arc<ResourceManager>,
    reliability: Arc<ReliabilityManager>,
    checker: Arc<ElementChecker>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<WatchScheduler>,
    hub: NotificationHub,
}

impl Watcher {
    pub fn new(
        config: AppConfig,
        host: Arc<dyn RenderingHost>,
        store: Arc<dyn TaskStore>,
        hub: NotificationHub,
    ) -> Self {
        let resources = Arc::new(ResourceManager::new(host, config.resource.clone()));
        let reliability = ReliabilityManager::new(Arc::clone(&resources), config.reliability.clone());
        let checker = Arc::new(ElementChecker::new(
            Arc::clone(&reliability),
            config.checker.clone(),
        ));
        let queue = TaskQueue::new(checker.clone(), config.queue.clone());
        let scheduler = WatchScheduler::new(
            store,
            Arc::clone(&queue),
            hub.clone(),
            config.scheduler.clone(),
        );

        Self {
            config,
            resources,
            reliability,
            checker,
            queue,
            scheduler,
            hub,
        }
    }

    /// Start the health monitor, the queue worker and the periodic tick.
    pub async fn start(&self) -> Result<()> {
        self.reliability.start();
        self.queue.start();
        self.scheduler.start().await?;
        tracing::info!("Watcher started");
        Ok(())
    }

    /// Stop in reverse order and close the sandbox.
    pub async fn shutdown(&self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!("Error shutting down scheduler: {}", e);
        }
        self.queue.shutdown().await;
        self.reliability.stop();
        if let Err(e) = self.resources.close_resource().await {
            tracing::warn!("Error closing rendering sandbox: {}", e);
        }
        self.hub.shutdown().await;
        tracing::info!("Watcher stopped");
    }

    pub async fn diagnostics(&self) -> SystemDiagnostics {
        SystemDiagnostics {
            queue: self.queue.stats(),
            reliability: self.reliability.perform_diagnostics().await,
            scheduler: self.scheduler.stats(),
            generated_at: Utc::now(),
        }
    }

    pub async fn execute(&self, command: Command) -> Result<CommandResponse> {
        commands::dispatch(self, command).await
    }

    /// One-off extraction through the checker, outside the queue.
    pub async fn check_once(&self, url: &str, selector: &str) -> Result<String> {
        self.checker
            .check_content(url, selector, self.config.checker.max_retries)
            .await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn reliability(&self) -> &Arc<ReliabilityManager> {
        &self.reliability
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<WatchScheduler> {
        &self.scheduler
    }
}
