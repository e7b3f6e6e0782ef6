use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::config::DiscordConfig;
use crate::plugins::traits::notifier::truncate;
use crate::plugins::traits::{ChangeEvent, NotifierPlugin};
use crate::utils::error::AppError;
use crate::Result;

const CHANGED_COLOR: u32 = 0xff9900;
const FIELD_LIMIT: usize = 1000;

/// Posts change embeds to a Discord webhook.
pub struct DiscordNotifier {
    client: Client,
    webhook_url: String,
    username: String,
    avatar_url: Option<String>,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            webhook_url: webhook_url.into(),
            username: username.into(),
            avatar_url: None,
        }
    }

    /// `None` when no webhook is configured.
    pub fn from_config(config: &DiscordConfig) -> Result<Option<Self>> {
        let Some(webhook_url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };

        let parsed = url::Url::parse(webhook_url)
            .map_err(|e| AppError::Validation(format!("Invalid Discord webhook URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(
                "Discord webhook URL must use http or https".to_string(),
            ));
        }

        let mut notifier = Self::new(webhook_url, config.username.clone());
        notifier.avatar_url = config.avatar_url.clone();
        Ok(Some(notifier))
    }

    fn create_embed(&self, event: &ChangeEvent) -> serde_json::Value {
        let previous = event
            .previous_content
            .as_deref()
            .map(|content| truncate(content, FIELD_LIMIT))
            .unwrap_or_else(|| "(none)".to_string());

        json!({
            "title": format!("🔔 Change on {}", event.url),
            "url": event.url,
            "color": CHANGED_COLOR,
            "timestamp": event.changed_at.to_rfc3339(),
            "fields": [
                {
                    "name": "Selector",
                    "value": format!("`{}`", event.selector),
                    "inline": true
                },
                {
                    "name": "Before",
                    "value": previous,
                    "inline": false
                },
                {
                    "name": "After",
                    "value": truncate(&event.current_content, FIELD_LIMIT),
                    "inline": false
                }
            ],
            "footer": { "text": format!("Task {}", event.task_id) }
        })
    }

    fn create_webhook_payload(&self, event: &ChangeEvent) -> serde_json::Value {
        let mut payload = json!({
            "username": self.username,
            "embeds": [self.create_embed(event)]
        });

        if let Some(avatar_url) = &self.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }

        payload
    }
}

#[async_trait]
impl NotifierPlugin for DiscordNotifier {
    fn name(&self) -> &str {
        "Discord Notifier"
    }

    fn plugin_type(&self) -> &str {
        "discord"
    }

    async fn notify_change(&self, event: &ChangeEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.create_webhook_payload(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Notification(format!(
                "Discord webhook returned {}",
                status
            )));
        }

        tracing::debug!(task_id = %event.task_id, "Discord notification delivered");
        Ok(())
    }
}
