use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A task's fragment changed from `previous_content` to `current_content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub task_id: String,
    pub url: String,
    pub selector: String,
    pub previous_content: Option<String>,
    pub current_content: String,
    pub changed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Short human summary used in log lines and chat messages.
    pub fn summary(&self, max_chars: usize) -> String {
        truncate(&self.current_content, max_chars)
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Delivery channel for change notifications and the changed-task badge.
#[async_trait]
pub trait NotifierPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn plugin_type(&self) -> &str;

    async fn notify_change(&self, event: &ChangeEvent) -> Result<()>;

    /// Number of tasks currently in the `changed` state.
    async fn update_badge(&self, _changed_count: usize) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
