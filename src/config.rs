use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::utils::BackoffPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub browser: BrowserConfig,
    pub resource: ResourceConfig,
    pub reliability: ReliabilityConfig,
    pub checker: CheckerConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Diagnostics HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub chrome_path: Option<String>,
    pub user_agent: String,
    pub headless: bool,
    pub navigation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub cache_window_ms: u64,
    pub create_timeout_ms: u64,
    pub destroy_timeout_ms: u64,
    pub exists_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub health_check_interval_secs: u64,
    pub ping_timeout_ms: u64,
    pub error_threshold: u32,
    pub max_recovery_attempts: u32,
    pub recovery_delay_ms: u64,
    pub idle_timeout_secs: u64,
    pub operation_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub max_retries: u32,
    pub extraction_timeout_ms: u64,
    pub retry_backoff: BackoffPolicy,
    /// Retries granted to a selector that resolved to nothing.
    pub not_found_retries: u32,
    /// Attempts given to `with_reliability` for each outer attempt.
    pub reliability_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_queue_age_secs: u64,
    pub processing_timeout_secs: u64,
    pub default_max_retries: u32,
    pub retry_backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub task_error_threshold: u32,
    pub check_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub log_changes: bool,
    pub notify_timeout_ms: u64,
    pub discord: DiscordConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub webhook_url: Option<String>,
    pub username: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<String>,
    pub file_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/watcher.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            user_agent: "FragmentWatcher/0.1".to_string(),
            headless: true,
            navigation_timeout_secs: 30,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cache_window_ms: 5_000,
            create_timeout_ms: 30_000,
            destroy_timeout_ms: 10_000,
            exists_timeout_ms: 5_000,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            ping_timeout_ms: 5_000,
            error_threshold: 5,
            max_recovery_attempts: 3,
            recovery_delay_ms: 2_000,
            idle_timeout_secs: 300,
            operation_retry_delay_ms: 1_000,
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            extraction_timeout_ms: 45_000,
            retry_backoff: BackoffPolicy::Fixed { delay_ms: 1_000 },
            not_found_retries: 1,
            reliability_attempts: 2,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_queue_age_secs: 300,
            processing_timeout_secs: 60,
            default_max_retries: 3,
            retry_backoff: BackoffPolicy::Fixed { delay_ms: 2_000 },
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            task_error_threshold: 5,
            check_on_startup: true,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            log_changes: true,
            notify_timeout_ms: 10_000,
            discord: DiscordConfig::default(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            username: "Fragment Watcher".to_string(),
            avatar_url: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "fragment-watcher.log".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9001,
        }
    }
}

impl ResourceConfig {
    pub fn cache_window(&self) -> Duration {
        Duration::from_millis(self.cache_window_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn exists_timeout(&self) -> Duration {
        Duration::from_millis(self.exists_timeout_ms)
    }
}

impl ReliabilityConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn operation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.operation_retry_delay_ms)
    }
}

impl CheckerConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

impl QueueConfig {
    pub fn max_queue_age(&self) -> Duration {
        Duration::from_secs(self.max_queue_age_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl NotificationsConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with compiled-in defaults
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific config
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local config (ignored by git)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix "WATCHER__"
            .add_source(Environment::with_prefix("WATCHER").prefix_separator("__").separator("__"))
            .build()?;

        Self::finish(s)
    }

    /// Load an explicit config file on top of the defaults; environment
    /// variables still win.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("WATCHER").prefix_separator("__").separator("__"))
            .build()?;

        Self::finish(s)
    }

    fn finish(s: Config) -> Result<Self, ConfigError> {
        let mut config: AppConfig = s.try_deserialize()?;

        // Add Chrome path from environment if not set
        if config.browser.chrome_path.is_none() {
            config.browser.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.enabled && self.server.port == 0 {
            return Err(ConfigError::Message("Server port must be greater than 0".into()));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Message("Database url must not be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        if self.resource.create_timeout_ms == 0 || self.resource.destroy_timeout_ms == 0 {
            return Err(ConfigError::Message("Resource timeouts must be greater than 0".into()));
        }

        if self.reliability.health_check_interval_secs == 0 {
            return Err(ConfigError::Message("Reliability health_check_interval_secs must be greater than 0".into()));
        }

        if self.reliability.error_threshold == 0 {
            return Err(ConfigError::Message("Reliability error_threshold must be greater than 0".into()));
        }

        if self.reliability.max_recovery_attempts == 0 {
            return Err(ConfigError::Message("Reliability max_recovery_attempts must be greater than 0".into()));
        }

        if self.checker.reliability_attempts == 0 {
            return Err(ConfigError::Message("Checker reliability_attempts must be greater than 0".into()));
        }

        if self.checker.extraction_timeout_ms == 0 {
            return Err(ConfigError::Message("Checker extraction_timeout_ms must be greater than 0".into()));
        }

        if self.queue.max_size == 0 {
            return Err(ConfigError::Message("Queue max_size must be greater than 0".into()));
        }

        if self.queue.processing_timeout_secs == 0 {
            return Err(ConfigError::Message("Queue processing_timeout_secs must be greater than 0".into()));
        }

        if self.queue.max_queue_age_secs == 0 {
            return Err(ConfigError::Message("Queue max_queue_age_secs must be greater than 0".into()));
        }

        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Message("Scheduler tick_interval_secs must be greater than 0".into()));
        }

        if self.scheduler.task_error_threshold == 0 {
            return Err(ConfigError::Message("Scheduler task_error_threshold must be greater than 0".into()));
        }

        if let Some(webhook) = &self.notifications.discord.webhook_url {
            if !webhook.starts_with("https://discord.com/api/webhooks/") {
                return Err(ConfigError::Message("Invalid Discord webhook URL format".into()));
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }
}
