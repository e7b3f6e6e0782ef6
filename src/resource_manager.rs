use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use crate::config::ResourceConfig;
use crate::host::{CreateOutcome, ExtractionRequest, PingStatus, RenderingHost};
use crate::utils::error::AppError;
use crate::Result;

#[derive(Debug, Default)]
struct ResourceHandle {
    exists: bool,
    last_checked_at: Option<Instant>,
    creating: bool,
}

/// Broadcast once per finished creation attempt.
#[derive(Debug, Clone, Copy, Default)]
struct CreationSignal {
    generation: u64,
    succeeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub exists: bool,
    pub creating: bool,
    pub cache_fresh: bool,
    pub cache_age_ms: Option<u64>,
}

/// Sole owner of the rendering sandbox lifecycle.
pub struct ResourceManager {
    host: Arc<dyn RenderingHost>,
    config: ResourceConfig,
    handle: Mutex<ResourceHandle>,
    creation: watch::Sender<CreationSignal>,
}

/// Clears `creating` and wakes waiters even if the creator is dropped mid-call.
struct CreationGuard<'a> {
    manager: &'a ResourceManager,
    succeeded: bool,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        {
            let mut handle = self.manager.handle();
            handle.creating = false;
            if self.succeeded {
                handle.exists = true;
                handle.last_checked_at = Some(Instant::now());
            } else {
                handle.last_checked_at = None;
            }
        }
        let succeeded = self.succeeded;
        self.manager.creation.send_modify(|signal| {
            signal.generation += 1;
            signal.succeeded = succeeded;
        });
    }
}

impl ResourceManager {
    pub fn new(host: Arc<dyn RenderingHost>, config: ResourceConfig) -> Self {
        let (creation, _) = watch::channel(CreationSignal::default());
        Self {
            host,
            config,
            handle: Mutex::new(ResourceHandle::default()),
            creation,
        }
    }

    fn handle(&self) -> MutexGuard<'_, ResourceHandle> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_exists(&self, handle: &ResourceHandle) -> Option<bool> {
        match handle.last_checked_at {
            Some(checked) if checked.elapsed() < self.config.cache_window() => Some(handle.exists),
            _ => None,
        }
    }

    /// Whether the sandbox exists. Answers from cache inside the cache window,
    /// otherwise asks the host. Host failures count as "absent".
    pub async fn has_resource(&self) -> bool {
        let cached = self.cached_exists(&self.handle());
        if let Some(exists) = cached {
            return exists;
        }

        let exists = match timeout(self.config.exists_timeout(), self.host.exists()).await {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                tracing::warn!("Sandbox existence check failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Sandbox existence check timed out after {}ms",
                    self.config.exists_timeout_ms
                );
                false
            }
        };

        let mut handle = self.handle();
        handle.exists = exists;
        handle.last_checked_at = Some(Instant::now());
        exists
    }

    /// Make sure the sandbox exists, creating it at most once across
    /// concurrent callers.
    pub async fn ensure_resource(&self) -> Result<()> {
        if self.has_resource().await {
            return Ok(());
        }

        let mut waiter = {
            let mut handle = self.handle();
            if self.cached_exists(&handle) == Some(true) {
                return Ok(());
            }
            if handle.creating {
                Some(self.creation.subscribe())
            } else {
                handle.creating = true;
                None
            }
        };

        if let Some(rx) = waiter.as_mut() {
            tracing::debug!("Sandbox creation already in flight, waiting for it");
            rx.changed()
                .await
                .map_err(|_| AppError::Internal("creation signal dropped".into()))?;
            let signal = *rx.borrow();
            return if signal.succeeded {
                Ok(())
            } else {
                Err(AppError::Resource("concurrent sandbox creation failed".into()))
            };
        }

        let mut guard = CreationGuard {
            manager: self,
            succeeded: false,
        };

        let create_timeout = self.config.create_timeout();
        match timeout(create_timeout, self.host.create()).await {
            Ok(Ok(outcome)) => {
                match outcome {
                    CreateOutcome::Created => {
                        tracing::info!("Rendering sandbox created");
                        metrics::counter!("watcher_sandbox_created_total").increment(1);
                    }
                    CreateOutcome::AlreadyExists => {
                        tracing::debug!("Host reported sandbox already exists");
                    }
                }
                guard.succeeded = true;
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("Sandbox creation failed: {}", e);
                Err(e)
            }
            Err(_) => {
                tracing::error!("Sandbox creation timed out after {}ms", self.config.create_timeout_ms);
                Err(AppError::timeout("Sandbox creation", create_timeout))
            }
        }
    }

    /// Destroy the sandbox if it exists.
    pub async fn close_resource(&self) -> Result<()> {
        if !self.has_resource().await {
            return Ok(());
        }

        let destroy_timeout = self.config.destroy_timeout();
        let result = match timeout(destroy_timeout, self.host.destroy()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("Sandbox destroy", destroy_timeout)),
        };
        self.invalidate_cache();

        if result.is_ok() {
            tracing::info!("Rendering sandbox closed");
        }
        result
    }

    /// Destroy regardless of what the cache says. Errors are logged and absorbed.
    pub async fn force_close(&self) {
        match timeout(self.config.destroy_timeout(), self.host.destroy()).await {
            Ok(Ok(())) => tracing::debug!("Rendering sandbox force-closed"),
            Ok(Err(e)) => tracing::warn!("Force close failed: {}", e),
            Err(_) => tracing::warn!("Force close timed out after {}ms", self.config.destroy_timeout_ms),
        }

        let mut handle = self.handle();
        handle.exists = false;
        handle.last_checked_at = None;
    }

    /// Next `has_resource` call goes to the host.
    pub fn invalidate_cache(&self) {
        self.handle().last_checked_at = None;
    }

    pub async fn ping(&self, ping_timeout: Duration) -> Result<PingStatus> {
        match timeout(ping_timeout, self.host.ping()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("Sandbox ping", ping_timeout)),
        }
    }

    pub async fn extract(&self, request: &ExtractionRequest, extract_timeout: Duration) -> Result<String> {
        match timeout(extract_timeout, self.host.extract(request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("Extraction", extract_timeout)),
        }
    }

    pub async fn cancel_extraction(&self, correlation_id: &str) {
        match timeout(self.config.exists_timeout(), self.host.cancel(correlation_id)).await {
            Ok(Ok(())) => tracing::debug!(correlation_id, "Cancelled extraction"),
            Ok(Err(e)) => tracing::warn!(correlation_id, "Failed to cancel extraction: {}", e),
            Err(_) => tracing::warn!(correlation_id, "Cancelling extraction timed out"),
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let handle = self.handle();
        ResourceSnapshot {
            exists: handle.exists,
            creating: handle.creating,
            cache_fresh: self.cached_exists(&handle).is_some(),
            cache_age_ms: handle.last_checked_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}
