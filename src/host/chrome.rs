use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use super::{CreateOutcome, ExtractionRequest, PingStatus, RenderingHost};
use crate::config::BrowserConfig;
use crate::utils::error::AppError;
use crate::Result;

/// Headless Chrome as the rendering sandbox.
///
/// `headless_chrome` is blocking, so every call hops onto the blocking pool.
pub struct ChromeHost {
    config: BrowserConfig,
    browser: Arc<Mutex<Option<Arc<Browser>>>>,
    in_flight: Arc<Mutex<HashMap<String, Arc<Tab>>>>,
}

impl ChromeHost {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn current_browser(&self) -> Result<Option<Arc<Browser>>> {
        let guard = self
            .browser
            .lock()
            .map_err(|_| AppError::Internal("browser mutex poisoned".into()))?;
        Ok(guard.clone())
    }

    fn launch(config: &BrowserConfig) -> Result<Browser> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false) // Often needed in containerized environments
            .idle_browser_timeout(Duration::from_secs(u32::MAX as u64))
            .args(vec![
                std::ffi::OsStr::new("--no-sandbox"),
                std::ffi::OsStr::new("--disable-dev-shm-usage"),
                std::ffi::OsStr::new("--disable-gpu"),
                std::ffi::OsStr::new("--disable-extensions"),
                std::ffi::OsStr::new("--disable-background-timer-throttling"),
                std::ffi::OsStr::new("--disable-backgrounding-occluded-windows"),
                std::ffi::OsStr::new("--disable-renderer-backgrounding"),
            ])
            .build()
            .map_err(|e| AppError::Resource(format!("Failed to create launch options: {}", e)))?;

        if let Some(chrome_path) = &config.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(chrome_path));
        }

        Browser::new(launch_options)
            .map_err(|e| AppError::Resource(format!("Failed to launch browser: {}", e)))
    }

    fn extract_blocking(
        browser: Arc<Browser>,
        in_flight: Arc<Mutex<HashMap<String, Arc<Tab>>>>,
        config: BrowserConfig,
        request: ExtractionRequest,
    ) -> Result<String> {
        let tab = browser
            .new_tab()
            .map_err(|e| AppError::Resource(format!("Failed to create tab: {}", e)))?;

        if let Ok(mut tabs) = in_flight.lock() {
            tabs.insert(request.correlation_id.clone(), Arc::clone(&tab));
        }

        let result = Self::render_and_select(&tab, &config, &request);

        // A cancelled request has already had its tab removed and closed.
        let still_ours = in_flight
            .lock()
            .map(|mut tabs| tabs.remove(&request.correlation_id).is_some())
            .unwrap_or(false);
        if still_ours {
            let _ = tab.close(true);
        }

        result
    }

    fn render_and_select(tab: &Tab, config: &BrowserConfig, request: &ExtractionRequest) -> Result<String> {
        tab.set_default_timeout(Duration::from_secs(config.navigation_timeout_secs));
        tab.set_user_agent(&config.user_agent, None, None)
            .map_err(|e| AppError::Extraction(format!("Failed to set user agent: {}", e)))?;

        tab.navigate_to(&request.url)
            .map_err(|e| AppError::Extraction(format!("Navigation failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| AppError::Extraction(format!("Page load failed: {}", e)))?;

        let html = tab
            .get_content()
            .map_err(|e| AppError::Extraction(format!("Failed to get page content: {}", e)))?;

        extract_fragment(&html, &request.selector)?.ok_or_else(|| AppError::ElementNotFound {
            selector: request.selector.clone(),
        })
    }
}

#[async_trait]
impl RenderingHost for ChromeHost {
    async fn exists(&self) -> Result<bool> {
        Ok(self.current_browser()?.is_some())
    }

    async fn create(&self) -> Result<CreateOutcome> {
        if self.current_browser()?.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let config = self.config.clone();
        let browser = tokio::task::spawn_blocking(move || Self::launch(&config))
            .await
            .map_err(|e| AppError::Internal(format!("browser launch task failed: {}", e)))??;

        let mut guard = self
            .browser
            .lock()
            .map_err(|_| AppError::Internal("browser mutex poisoned".into()))?;
        if guard.is_some() {
            // Lost a race with another launcher; keep the first browser.
            return Ok(CreateOutcome::AlreadyExists);
        }
        *guard = Some(Arc::new(browser));
        tracing::info!("Launched headless browser");
        Ok(CreateOutcome::Created)
    }

    async fn destroy(&self) -> Result<()> {
        let browser = {
            let mut guard = self
                .browser
                .lock()
                .map_err(|_| AppError::Internal("browser mutex poisoned".into()))?;
            guard.take()
        };

        if let Some(browser) = browser {
            if let Ok(mut tabs) = self.in_flight.lock() {
                tabs.clear();
            }
            // Dropping the last handle kills the Chrome process.
            tokio::task::spawn_blocking(move || drop(browser))
                .await
                .map_err(|e| AppError::Internal(format!("browser shutdown task failed: {}", e)))?;
            tracing::info!("Closed headless browser");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<PingStatus> {
        let Some(browser) = self.current_browser()? else {
            return Ok(PingStatus::Unresponsive);
        };

        let alive = tokio::task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .map_err(|e| AppError::Internal(format!("ping task failed: {}", e)))?;

        Ok(if alive {
            PingStatus::Alive
        } else {
            PingStatus::Unresponsive
        })
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String> {
        let browser = self
            .current_browser()?
            .ok_or_else(|| AppError::Resource("browser is not running".into()))?;

        let in_flight = Arc::clone(&self.in_flight);
        let config = self.config.clone();
        let request = request.clone();

        tokio::task::spawn_blocking(move || Self::extract_blocking(browser, in_flight, config, request))
            .await
            .map_err(|e| AppError::Internal(format!("extraction task failed: {}", e)))?
    }

    async fn cancel(&self, correlation_id: &str) -> Result<()> {
        let tab = self
            .in_flight
            .lock()
            .map_err(|_| AppError::Internal("in-flight mutex poisoned".into()))?
            .remove(correlation_id);

        if let Some(tab) = tab {
            tracing::debug!(correlation_id, "Closing tab of cancelled extraction");
            tokio::task::spawn_blocking(move || {
                let _ = tab.close(true);
            })
            .await
            .map_err(|e| AppError::Internal(format!("tab close task failed: {}", e)))?;
        }
        Ok(())
    }
}

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Collapse runs of whitespace so layout-only reflows don't register as changes.
pub fn normalize_content(text: &str) -> String {
    whitespace().replace_all(text.trim(), " ").into_owned()
}

/// Text of every element matching `selector`, one per line; `None` when nothing matches.
pub fn extract_fragment(html: &str, selector: &str) -> Result<Option<String>> {
    let document = Html::parse_document(html);
    let css_selector = Selector::parse(selector)
        .map_err(|e| AppError::Validation(format!("Invalid CSS selector '{}': {:?}", selector, e)))?;

    let parts: Vec<String> = document
        .select(&css_selector)
        .map(|element| normalize_content(&element.text().collect::<Vec<_>>().join(" ")))
        .collect();

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("\n")))
    }
}
