use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Content(String),
    Error(String),
}

/// Outcome of checking one task's fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub task_id: String,
    pub outcome: CheckOutcome,
    pub checked_at: DateTime<Utc>,
    pub attempts: u32,
}

impl CheckResult {
    pub fn success(task_id: impl Into<String>, content: impl Into<String>, attempts: u32) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: CheckOutcome::Content(content.into()),
            checked_at: Utc::now(),
            attempts,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: CheckOutcome::Error(error.into()),
            checked_at: Utc::now(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CheckOutcome::Content(_))
    }

    pub fn content(&self) -> Option<&str> {
        match &self.outcome {
            CheckOutcome::Content(content) => Some(content),
            CheckOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            CheckOutcome::Content(_) => None,
            CheckOutcome::Error(error) => Some(error),
        }
    }
}
