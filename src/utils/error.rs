use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    // Queue admission
    #[error("Queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("Task {task_id} is already queued")]
    DuplicateTask { task_id: String },

    // Queue lifecycle
    #[error("Task {task_id} timed out in queue after {waited_ms}ms")]
    QueueTimeout { task_id: String, waited_ms: u64 },

    #[error("Task {task_id} was removed from the queue")]
    TaskRemoved { task_id: String },

    #[error("Task queue is closed")]
    QueueClosed,

    // Extraction and sandbox
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Rendering sandbox error: {0}")]
    Resource(String),

    #[error("Sandbox recovery failed after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(format!("{}", err))
    }
}

impl AppError {
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        AppError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Errors raised by `TaskQueue::add_task` before a task is admitted.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            AppError::QueueFull { .. } | AppError::DuplicateTask { .. } | AppError::Validation(_)
        )
    }

    /// Peels `RetriesExhausted` wrappers down to the error that caused them.
    pub fn root_cause(&self) -> &AppError {
        match self {
            AppError::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_element_not_found(&self) -> bool {
        matches!(self.root_cause(), AppError::ElementNotFound { .. })
    }

    pub fn is_recovery_exhausted(&self) -> bool {
        matches!(self.root_cause(), AppError::RecoveryExhausted { .. })
    }

    /// Whether the failure points at the sandbox itself rather than at the page.
    /// A selector that resolves to nothing means the sandbox did its job.
    pub fn indicates_resource_fault(&self) -> bool {
        match self.root_cause() {
            AppError::ElementNotFound { .. } | AppError::Validation(_) => false,
            AppError::QueueFull { .. }
            | AppError::DuplicateTask { .. }
            | AppError::TaskRemoved { .. }
            | AppError::QueueClosed => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
