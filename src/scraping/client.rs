//! Paginated image-search scraping
//!
//! Drives one headless browser tab through an infinite-scroll search
//! page, intercepting the JSON responses of the search resource and
//! emitting previously-unseen pins until the query stops producing new
//! data. Launch and navigation run under the circuit breaker; repeated
//! response timeouts signal exhaustion, which is a normal end state and
//! never trips the breaker.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::breaker::{CallError, CircuitBreaker};
use super::driver::{BrowserDriver, DriverError, DriverFactory, LaunchOptions};
use super::rate_limit::RateLimiter;
use crate::types::HarvestedPin;

/// Search endpoint; the query is appended URL-encoded.
const SEARCH_URL: &str = "https://www.pinterest.com/search/pins/?q=";

/// Substring identifying the search-resource responses worth
/// intercepting.
const RESPONSE_MARKER: &str = "BaseSearchResource";

/// Errors starting a scrape.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The circuit breaker is open; no browser was launched.
    #[error("circuit breaker is open")]
    BreakerOpen,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Tuning for the scrape client.
#[derive(Debug, Clone)]
pub struct ScrapeClientConfig {
    /// Candidate browser executables, tried in order.
    pub executables: Vec<PathBuf>,
    /// User-agent pool; one is picked per session.
    pub user_agents: Vec<String>,
    /// Run the browser headless.
    pub headless: bool,
    /// How long to wait for a search response before counting a timeout.
    pub response_timeout: Duration,
    /// Consecutive timeouts after which the query is exhausted.
    pub max_consecutive_timeouts: u32,
    /// Capacity of the emitted pin channel.
    pub pin_buffer: usize,
    /// Bounds of the random pause between the scroll nudge and the
    /// bottom jump, in milliseconds.
    pub scroll_pause_ms: (u64, u64),
}

impl Default for ScrapeClientConfig {
    fn default() -> Self {
        Self {
            executables: vec![
                PathBuf::from("/usr/bin/google-chrome"),
                PathBuf::from("/usr/bin/chromium"),
                PathBuf::from("/usr/bin/chromium-browser"),
                PathBuf::from("/usr/bin/microsoft-edge"),
                PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            ],
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.36".to_string(),
            ],
            headless: true,
            response_timeout: Duration::from_secs(15),
            max_consecutive_timeouts: 3,
            pin_buffer: 64,
            scroll_pause_ms: (500, 1500),
        }
    }
}

/// How one harvest loop ended.
enum HarvestEnd {
    /// No new data for too long; rotate to the next query.
    Exhausted,
    Cancelled,
}

/// Drives paginated searches against the upstream service.
pub struct ScrapeClient {
    factory: Arc<dyn DriverFactory>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    config: ScrapeClientConfig,
}

impl ScrapeClient {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        config: ScrapeClientConfig,
    ) -> Self {
        Self {
            factory,
            limiter,
            breaker,
            config,
        }
    }

    /// Start scraping `query`.
    ///
    /// Launch and navigation run under the circuit breaker; on success a
    /// background task fills the returned channel with unseen pins and
    /// closes it on exhaustion, cancellation, or driver failure.
    pub async fn scrape(
        &self,
        cancel: CancellationToken,
        query: &str,
    ) -> Result<mpsc::Receiver<HarvestedPin>, ScrapeError> {
        let opts = self.launch_options();
        let url = search_url(query);

        let launched = self
            .breaker
            .call(async {
                let driver = self.factory.launch(opts).await?;
                let prepared = async {
                    let bodies = driver.subscribe_responses(RESPONSE_MARKER).await?;
                    driver.navigate(&url).await?;
                    Ok::<_, DriverError>(bodies)
                }
                .await;
                match prepared {
                    Ok(bodies) => Ok((driver, bodies)),
                    Err(e) => {
                        driver.close().await;
                        Err(e)
                    }
                }
            })
            .await;

        let (driver, bodies) = match launched {
            Ok(session) => session,
            Err(CallError::Open) => return Err(ScrapeError::BreakerOpen),
            Err(CallError::Inner(e)) => return Err(ScrapeError::Driver(e)),
        };

        info!(query, "scrape session started");

        let (tx, rx) = mpsc::channel(self.config.pin_buffer);
        let limiter = Arc::clone(&self.limiter);
        let breaker = Arc::clone(&self.breaker);
        let config = self.config.clone();
        let query = query.to_string();

        tokio::spawn(async move {
            let outcome = harvest(&*driver, bodies, tx, &cancel, &limiter, &config).await;
            driver.close().await;
            match outcome {
                Ok(HarvestEnd::Exhausted) => info!(query, "query exhausted"),
                Ok(HarvestEnd::Cancelled) => debug!(query, "scrape cancelled"),
                Err(e) => {
                    warn!(query, error = %e, "scrape failed");
                    breaker.record_failure().await;
                }
            }
        });

        Ok(rx)
    }

    fn launch_options(&self) -> LaunchOptions {
        let mut rng = rand::thread_rng();
        let user_agent = self.config.user_agents
            [rng.gen_range(0..self.config.user_agents.len())]
        .clone();
        LaunchOptions {
            executables: self.config.executables.clone(),
            user_agent,
            window: (
                1920 + rng.gen_range(0..=200),
                1080 + rng.gen_range(0..=200),
            ),
            headless: self.config.headless,
        }
    }
}

fn search_url(query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("{}{}", SEARCH_URL, encoded)
}

/// The scroll-and-harvest loop: nudge the page, wait for an intercepted
/// response, forward fresh pins, and give up after enough silence.
async fn harvest(
    driver: &dyn BrowserDriver,
    mut bodies: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<HarvestedPin>,
    cancel: &CancellationToken,
    limiter: &RateLimiter,
    config: &ScrapeClientConfig,
) -> Result<HarvestEnd, DriverError> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut timeouts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(HarvestEnd::Cancelled);
        }

        limiter.wait().await;

        // Human-like scrolling: a small nudge, a pause, then the jump to
        // the bottom that triggers the next result page.
        let (step, pause_ms) = {
            let mut rng = rand::thread_rng();
            let (lo, hi) = config.scroll_pause_ms;
            (rng.gen_range(200..1000), rng.gen_range(lo..hi))
        };
        driver
            .evaluate(&format!("window.scrollBy(0, {});", step))
            .await?;
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        driver
            .evaluate("window.scrollTo(0, document.body.scrollHeight);")
            .await?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(HarvestEnd::Cancelled),
            body = bodies.recv() => {
                let Some(body) = body else {
                    return Err(DriverError::Subscribe("response stream ended".to_string()));
                };
                let pins = parse_search_response(&body);
                if pins.is_empty() {
                    // A response with nothing in it is as good as silence.
                    timeouts += 1;
                    debug!(timeouts, "search response carried no results");
                    if timeouts >= config.max_consecutive_timeouts {
                        return Ok(HarvestEnd::Exhausted);
                    }
                    continue;
                }

                timeouts = 0;
                let mut fresh = 0usize;
                for pin in pins {
                    if !seen_ids.insert(pin.id.clone()) {
                        continue;
                    }
                    fresh += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(HarvestEnd::Cancelled),
                        sent = tx.send(pin) => {
                            if sent.is_err() {
                                // Downstream is gone; nothing left to feed.
                                return Ok(HarvestEnd::Cancelled);
                            }
                        }
                    }
                }
                debug!(fresh, total_seen = seen_ids.len(), "harvested pins");
            }
            _ = tokio::time::sleep(config.response_timeout) => {
                timeouts += 1;
                debug!(timeouts, "timed out waiting for search results");
                if timeouts >= config.max_consecutive_timeouts {
                    return Ok(HarvestEnd::Exhausted);
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    resource_response: ResourceResponse,
}

#[derive(Deserialize, Default)]
struct ResourceResponse {
    #[serde(default)]
    data: ResourceData,
}

#[derive(Deserialize, Default)]
struct ResourceData {
    #[serde(default)]
    results: Vec<RawPin>,
}

#[derive(Deserialize)]
struct RawPin {
    id: String,
    #[serde(default)]
    images: RawImages,
}

#[derive(Deserialize, Default)]
struct RawImages {
    #[serde(default)]
    orig: Option<RawOriginal>,
}

#[derive(Deserialize)]
struct RawOriginal {
    #[serde(default)]
    url: String,
}

/// Extract `(id, url)` pairs from an intercepted search response.
/// Unparseable bodies and pins without an original-resolution URL yield
/// nothing.
fn parse_search_response(body: &[u8]) -> Vec<HarvestedPin> {
    let parsed: SearchResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable search response");
            return Vec::new();
        }
    };

    parsed
        .resource_response
        .data
        .results
        .into_iter()
        .filter_map(|pin| {
            let url = pin.images.orig.map(|orig| orig.url).unwrap_or_default();
            if url.is_empty() {
                return None;
            }
            Some(HarvestedPin { id: pin.id, url })
        })
        .collect()
}
