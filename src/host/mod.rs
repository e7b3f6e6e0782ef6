//! Host-side collaborator that owns the actual rendering sandbox.
//!
//! Every call may hang; callers impose their own timeouts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub mod chrome;

pub use chrome::ChromeHost;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PingStatus {
    Alive,
    Unresponsive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRequest {
    pub url: String,
    pub selector: String,
    pub correlation_id: String,
}

/// Lifecycle and extraction calls against the single rendering sandbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderingHost: Send + Sync {
    async fn exists(&self) -> Result<bool>;

    async fn create(&self) -> Result<CreateOutcome>;

    async fn destroy(&self) -> Result<()>;

    async fn ping(&self) -> Result<PingStatus>;

    /// Returns the fragment text, or `AppError::ElementNotFound` when the
    /// selector resolves to nothing.
    async fn extract(&self, request: &ExtractionRequest) -> Result<String>;

    /// Abandon an in-flight extraction. Unknown ids are ignored.
    async fn cancel(&self, correlation_id: &str) -> Result<()>;
}
