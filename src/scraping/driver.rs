//! Headless-browser driver contract
//!
//! The scrape client drives an opaque browser through a narrow action
//! surface: navigate, evaluate a script, subscribe to network response
//! bodies, close. [`ChromiumFactory`] implements the contract over the
//! Chrome DevTools Protocol via chromiumoxide; tests substitute an
//! in-process fake that serves canned response bodies.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors from the browser driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// None of the configured executable paths exists.
    #[error("no browser executable found")]
    BrowserNotFound,
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Evaluate(String),
    #[error("network subscription failed: {0}")]
    Subscribe(String),
}

/// Fingerprint and environment for one browser session.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Candidate executable paths, tried in order.
    pub executables: Vec<PathBuf>,
    /// User agent presented by the session.
    pub user_agent: String,
    /// Window size in pixels.
    pub window: (u32, u32),
    /// Run without a visible window.
    pub headless: bool,
}

/// One live browser session.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn evaluate(&self, script: &str) -> Result<(), DriverError>;

    /// Stream the bodies of network responses whose URL contains
    /// `marker`. The channel closes when the session ends.
    async fn subscribe_responses(
        &self,
        marker: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, DriverError>;

    /// Tear the session down. Must return promptly; a wedged browser
    /// process is killed rather than awaited.
    async fn close(&self);
}

/// Launches fresh [`BrowserDriver`] sessions.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserDriver>, DriverError>;
}

/// Grace period for a clean browser shutdown before the process is
/// killed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Chrome-DevTools-Protocol driver factory.
pub struct ChromiumFactory;

#[async_trait]
impl DriverFactory for ChromiumFactory {
    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserDriver>, DriverError> {
        let executable = opts
            .executables
            .iter()
            .find(|path| path.exists())
            .ok_or(DriverError::BrowserNotFound)?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .window_size(opts.window.0, opts.window.1)
            .args(vec![
                format!("--user-agent={}", opts.user_agent),
                "--disable-gpu".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
                "--excludeSwitches=enable-automation".to_string(),
            ]);
        if !opts.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        // The handler stream must be polled for the whole session or no
        // CDP message makes progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        page.execute(EnableParams::default())
            .await
            .map_err(|e| DriverError::Subscribe(e.to_string()))?;

        Ok(Box::new(ChromiumDriver {
            browser: Mutex::new(browser),
            page,
            handler_task,
        }))
    }
}

struct ChromiumDriver {
    browser: Mutex<Browser>,
    page: Page,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<(), DriverError> {
        self.page
            .evaluate_expression(script)
            .await
            .map_err(|e| DriverError::Evaluate(e.to_string()))?;
        Ok(())
    }

    async fn subscribe_responses(
        &self,
        marker: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, DriverError> {
        let mut events = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| DriverError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let page = self.page.clone();
        let marker = marker.to_string();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if !event.response.url.contains(&marker) {
                    continue;
                }
                // Body retrieval is async per response so a slow fetch
                // never stalls the event stream.
                let page = page.clone();
                let tx = tx.clone();
                let request_id = event.request_id.clone();
                tokio::spawn(async move {
                    match page.execute(GetResponseBodyParams::new(request_id)).await {
                        Ok(resp) => {
                            let body = if resp.result.base64_encoded {
                                BASE64.decode(resp.result.body.as_bytes()).unwrap_or_default()
                            } else {
                                resp.result.body.clone().into_bytes()
                            };
                            let _ = tx.send(body).await;
                        }
                        Err(e) => debug!(error = %e, "failed to fetch response body"),
                    }
                });
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        match tokio::time::timeout(CLOSE_GRACE, browser.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("browser did not exit in time, killing process");
                browser.kill().await;
            }
        }
        self.handler_task.abort();
    }
}
