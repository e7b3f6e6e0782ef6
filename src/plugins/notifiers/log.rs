use async_trait::async_trait;

use crate::plugins::traits::{ChangeEvent, NotifierPlugin};
use crate::Result;

/// Writes changes to the tracing output.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotifierPlugin for LogNotifier {
    fn name(&self) -> &str {
        "Log Notifier"
    }

    fn plugin_type(&self) -> &str {
        "log"
    }

    async fn notify_change(&self, event: &ChangeEvent) -> Result<()> {
        tracing::info!(
            task_id = %event.task_id,
            url = %event.url,
            selector = %event.selector,
            "Fragment changed: {}",
            event.summary(120)
        );
        Ok(())
    }

    async fn update_badge(&self, changed_count: usize) -> Result<()> {
        tracing::debug!(changed_count, "Changed tasks");
        Ok(())
    }
}
