use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::models::generate_id;

/// Allowed re-check periods for a watch task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum CheckInterval {
    #[serde(rename = "5m")]
    #[sqlx(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    #[sqlx(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    #[sqlx(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    #[sqlx(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    #[sqlx(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    #[sqlx(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    #[sqlx(rename = "24h")]
    OneDay,
}

impl CheckInterval {
    pub const ALL: [CheckInterval; 7] = [
        CheckInterval::FiveMinutes,
        CheckInterval::FifteenMinutes,
        CheckInterval::ThirtyMinutes,
        CheckInterval::OneHour,
        CheckInterval::SixHours,
        CheckInterval::TwelveHours,
        CheckInterval::OneDay,
    ];

    pub fn duration(&self) -> Duration {
        match self {
            CheckInterval::FiveMinutes => Duration::minutes(5),
            CheckInterval::FifteenMinutes => Duration::minutes(15),
            CheckInterval::ThirtyMinutes => Duration::minutes(30),
            CheckInterval::OneHour => Duration::hours(1),
            CheckInterval::SixHours => Duration::hours(6),
            CheckInterval::TwelveHours => Duration::hours(12),
            CheckInterval::OneDay => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInterval::FiveMinutes => "5m",
            CheckInterval::FifteenMinutes => "15m",
            CheckInterval::ThirtyMinutes => "30m",
            CheckInterval::OneHour => "1h",
            CheckInterval::SixHours => "6h",
            CheckInterval::TwelveHours => "12h",
            CheckInterval::OneDay => "24h",
        }
    }
}

impl Default for CheckInterval {
    fn default() -> Self {
        CheckInterval::OneHour
    }
}

impl std::str::FromStr for CheckInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckInterval::ALL
            .into_iter()
            .find(|interval| interval.as_str() == s.trim())
            .ok_or_else(|| {
                let allowed: Vec<_> = CheckInterval::ALL.iter().map(|i| i.as_str()).collect();
                format!("unknown interval '{}', expected one of {}", s, allowed.join(", "))
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum TaskStatus {
    #[sqlx(rename = "active")]
    Active,
    #[sqlx(rename = "changed")]
    Changed,
    #[sqlx(rename = "paused")]
    Paused,
    #[sqlx(rename = "error")]
    Error,
}

/// A durable watch job: re-check `selector` on `url` every `interval`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Validate, PartialEq)]
pub struct Task {
    #[validate(length(min = 1, message = "task id is required"))]
    pub id: String,
    #[validate(url(message = "task url must be an absolute URL"))]
    pub url: String,
    #[validate(length(min = 1, message = "task selector is required"))]
    pub selector: String,
    #[sqlx(rename = "check_interval")]
    pub interval: CheckInterval,
    pub status: TaskStatus,

    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub current_content: Option<String>,

    pub consecutive_errors: u32,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    pub selector: String,
    pub interval: Option<CheckInterval>,
    pub initial_content: Option<String>,
}

impl Task {
    pub fn new(new_task: NewTask) -> Self {
        Self {
            id: generate_id(),
            url: new_task.url,
            selector: new_task.selector,
            interval: new_task.interval.unwrap_or_default(),
            status: TaskStatus::Active,
            last_checked_at: None,
            last_changed_at: None,
            current_content: new_task.initial_content,
            consecutive_errors: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == TaskStatus::Paused
    }

    /// A task is due once its interval has fully elapsed since the last check.
    /// Tasks that were never checked are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        match self.last_checked_at {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.interval.duration(),
        }
    }

    pub fn next_check_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at.map(|last| last + self.interval.duration())
    }
}
