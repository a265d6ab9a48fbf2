//! Concurrent image download workers
//!
//! A fixed pool of workers drains harvested pins, fetches the image
//! bytes, decodes and fingerprints them, and emits [`ScrapedImage`]s.
//! The bounded output channel provides natural backpressure: workers
//! block when downstream is slow, which in turn pauses the scrape.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{REFERER, USER_AGENT};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::imaging;
use crate::types::{HarvestedPin, ScrapedImage};

/// Per-download timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

/// Referer presented on image downloads; the CDN refuses bare requests.
const DOWNLOAD_REFERER: &str = "https://www.pinterest.com/";

#[derive(Debug, Error)]
enum DownloadError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("hash task failed: {0}")]
    HashTask(String),
}

/// Fixed-size pool turning pins into decoded, fingerprinted images.
pub struct ImageWorkerPool {
    http: reqwest::Client,
    user_agents: Vec<String>,
    num_workers: usize,
}

impl ImageWorkerPool {
    pub fn new(num_workers: usize, user_agents: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            user_agents,
            num_workers: num_workers.max(1),
        }
    }

    /// Drain `pins` with the worker pool; the returned channel closes
    /// once every worker has finished (input exhausted or cancelled).
    ///
    /// Transient failures (non-200, undecodable payload) drop the pin
    /// and keep the pool running.
    pub fn process(
        &self,
        cancel: CancellationToken,
        pins: mpsc::Receiver<HarvestedPin>,
    ) -> mpsc::Receiver<ScrapedImage> {
        let (tx, rx) = mpsc::channel(self.num_workers);
        let pins = Arc::new(Mutex::new(pins));

        let mut workers = Vec::with_capacity(self.num_workers);
        for _ in 0..self.num_workers {
            let pins = Arc::clone(&pins);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let http = self.http.clone();
            let user_agents = self.user_agents.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let pin = {
                        let mut pins = pins.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            pin = pins.recv() => pin,
                        }
                    };
                    let Some(pin) = pin else { break };

                    match fetch_and_hash(&http, &user_agents, &pin).await {
                        Ok(image) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                sent = tx.send(image) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(pin = %pin.id, url = %pin.url, error = %e, "dropping pin");
                        }
                    }
                }
            }));
        }

        // Closing the output is the supervisor's job: it joins every
        // worker and drops the last sender.
        tokio::spawn(async move {
            for worker in workers {
                let _ = worker.await;
            }
            drop(tx);
            debug!("image worker pool drained");
        });

        rx
    }
}

async fn fetch_and_hash(
    http: &reqwest::Client,
    user_agents: &[String],
    pin: &HarvestedPin,
) -> Result<ScrapedImage, DownloadError> {
    let mut request = http.get(&pin.url).header(REFERER, DOWNLOAD_REFERER);
    if !user_agents.is_empty() {
        let ua = &user_agents[rand::thread_rng().gen_range(0..user_agents.len())];
        request = request.header(USER_AGENT, ua.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status(status.as_u16()));
    }

    let bytes = response.bytes().await?.to_vec();

    // Decode and hash off the runtime; large JPEGs are CPU-bound work.
    let hash_input = bytes.clone();
    let hash = tokio::task::spawn_blocking(move || {
        image::load_from_memory(&hash_input).map(|img| imaging::dhash(&img))
    })
    .await
    .map_err(|e| DownloadError::HashTask(e.to_string()))??;

    Ok(ScrapedImage {
        id: pin.id.clone(),
        hash,
        bytes,
    })
}
