use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::notifiers::{DiscordNotifier, LogNotifier};
use super::traits::{ChangeEvent, NotifierPlugin};
use crate::config::NotificationsConfig;
use crate::utils::error::AppError;
use crate::Result;

pub type NotifierPluginBox = Arc<dyn NotifierPlugin>;

/// Fans change events and badge updates out to every registered notifier.
/// Delivery failures are logged and never reach the caller.
#[derive(Clone)]
pub struct NotificationHub {
    notifiers: Arc<RwLock<HashMap<String, NotifierPluginBox>>>,
    notify_timeout: Duration,
}

impl NotificationHub {
    pub fn new(notify_timeout: Duration) -> Self {
        Self {
            notifiers: Arc::new(RwLock::new(HashMap::new())),
            notify_timeout,
        }
    }

    /// Register the notifiers enabled in `config`.
    pub async fn from_config(config: &NotificationsConfig) -> Result<Self> {
        let hub = Self::new(config.notify_timeout());

        if config.log_changes {
            hub.register_notifier(Arc::new(LogNotifier::new())).await;
        }
        if let Some(discord) = DiscordNotifier::from_config(&config.discord)? {
            hub.register_notifier(Arc::new(discord)).await;
        }

        Ok(hub)
    }

    /// Register a notifier, replacing any existing one of the same type.
    pub async fn register_notifier(&self, plugin: NotifierPluginBox) {
        let plugin_type = plugin.plugin_type().to_string();
        tracing::info!("Registered notifier: {} ({})", plugin.name(), plugin_type);

        let mut notifiers = self.notifiers.write().await;
        notifiers.insert(plugin_type, plugin);
    }

    pub async fn has_notifier(&self, plugin_type: &str) -> bool {
        let notifiers = self.notifiers.read().await;
        notifiers.contains_key(plugin_type)
    }

    pub async fn list_notifier_types(&self) -> Vec<String> {
        let notifiers = self.notifiers.read().await;
        let mut types: Vec<String> = notifiers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns how many notifiers accepted the event.
    pub async fn notify_change(&self, event: &ChangeEvent) -> usize {
        let notifiers = self.snapshot().await;
        let deliveries = notifiers.iter().map(|notifier| async move {
            let outcome = self.bounded(notifier.notify_change(event)).await;
            self.record_outcome(notifier.as_ref(), "notify_change", outcome)
        });

        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }

    pub async fn update_badge(&self, changed_count: usize) {
        let notifiers = self.snapshot().await;
        let updates = notifiers.iter().map(|notifier| async move {
            let outcome = self.bounded(notifier.update_badge(changed_count)).await;
            self.record_outcome(notifier.as_ref(), "update_badge", outcome)
        });

        join_all(updates).await;
    }

    pub async fn shutdown(&self) {
        let mut notifiers = self.notifiers.write().await;
        for (_, plugin) in notifiers.drain() {
            if let Err(e) = plugin.shutdown().await {
                tracing::warn!("Error shutting down notifier plugin: {}", e);
            }
        }
    }

    async fn snapshot(&self) -> Vec<NotifierPluginBox> {
        let notifiers = self.notifiers.read().await;
        notifiers.values().cloned().collect()
    }

    async fn bounded<F>(&self, delivery: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.notify_timeout, delivery).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::timeout("notification", self.notify_timeout)),
        }
    }

    fn record_outcome(&self, notifier: &dyn NotifierPlugin, action: &'static str, outcome: Result<()>) -> bool {
        match outcome {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("notification_failures_total", "notifier" => notifier.plugin_type().to_string())
                    .increment(1);
                tracing::warn!(notifier = notifier.plugin_type(), action, "Notifier failed: {}", e);
                false
            }
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(NotificationsConfig::default().notify_timeout())
    }
}
