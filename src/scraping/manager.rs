//! Scrape job lifecycle and query chaining
//!
//! One job per client: the manager owns the registry, replaces a
//! client's previous job on restart, and drives each job through its
//! query rotation. When a query exhausts, the job chains to the next one
//! without closing the subscriber channel; the channel closes only when
//! the limit is reached, every query is exhausted, or the client stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ScrapeClient;
use super::downloader::ImageWorkerPool;
use super::rotation::{QueryRotator, RotationOrder};
use crate::types::ScrapedImage;

/// Capacity of each job's subscriber channel.
const JOB_CHANNEL_CAPACITY: usize = 100;

/// How long a stopped job's tasks get to wind down before being aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed scrape before rotating to the next query, so an
/// open breaker does not turn the driver loop into a busy spin.
const ROTATE_BACKOFF: Duration = Duration::from_millis(500);

struct ScrapeJob {
    id: u64,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// Per-process registry of in-flight scrape jobs, keyed by client name.
pub struct ScrapeManager {
    scraper: Arc<ScrapeClient>,
    pool: Arc<ImageWorkerPool>,
    jobs: Arc<DashMap<String, ScrapeJob>>,
    shutdown: CancellationToken,
    /// Optional modifier pool; when non-empty, jobs rotate
    /// `"{modifier} {query}"` combinations instead of walking the plain
    /// query list once.
    modifiers: Vec<String>,
    next_job_id: AtomicU64,
}

impl ScrapeManager {
    /// `shutdown` is the manager-level cancellation scope; every job
    /// token is a child of it.
    pub fn new(
        scraper: Arc<ScrapeClient>,
        pool: Arc<ImageWorkerPool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scraper,
            pool,
            jobs: Arc::new(DashMap::new()),
            shutdown,
            modifiers: Vec::new(),
            next_job_id: AtomicU64::new(0),
        }
    }

    /// Use `modifiers` to diversify every job's queries.
    pub fn with_modifiers(mut self, modifiers: Vec<String>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Start (or restart) a job for `client_name` over `queries`,
    /// delivering at most `limit` images into the returned channel.
    ///
    /// Any previous job for the client is stopped first.
    pub async fn start(
        &self,
        client_name: &str,
        queries: Vec<String>,
        limit: usize,
    ) -> mpsc::Receiver<ScrapedImage> {
        self.stop(client_name).await;

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        let rotator = if self.modifiers.is_empty() {
            QueryRotator::new(queries, RotationOrder::Sequential)
        } else {
            QueryRotator::with_modifiers(queries, self.modifiers.clone())
        };

        info!(client = client_name, job = id, limit, "starting scrape job");

        // The job must not outrun its own registration, or its final
        // deregistration could happen before the insert below.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let task = drive_job(
            client_name.to_string(),
            id,
            rotator,
            limit,
            Arc::clone(&self.scraper),
            Arc::clone(&self.pool),
            cancel.clone(),
            tx,
            Arc::clone(&self.jobs),
        );
        let driver = tokio::spawn(async move {
            let _ = registered_rx.await;
            task.await;
        });

        self.jobs
            .insert(client_name.to_string(), ScrapeJob { id, cancel, driver });
        let _ = registered_tx.send(());

        rx
    }

    /// Cancel the client's job and wait for its tasks to terminate.
    pub async fn stop(&self, client_name: &str) {
        let Some((_, job)) = self.jobs.remove(client_name) else {
            return;
        };

        info!(client = client_name, job = job.id, "stopping scrape job");
        job.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, job.driver).await.is_err() {
            warn!(client = client_name, "job did not stop in time");
        }
    }

    /// Stop every job; used during process shutdown.
    pub async fn stop_all(&self) {
        let clients: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for client in clients {
            self.stop(&client).await;
        }
    }

    /// Number of registered jobs (finished jobs deregister themselves).
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }
}

/// The job driver: rotate queries, feed pins through the worker pool,
/// and relay images to the subscriber until done.
#[allow(clippy::too_many_arguments)]
async fn drive_job(
    client_name: String,
    job_id: u64,
    rotator: QueryRotator,
    limit: usize,
    scraper: Arc<ScrapeClient>,
    pool: Arc<ImageWorkerPool>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ScrapedImage>,
    jobs: Arc<DashMap<String, ScrapeJob>>,
) {
    let mut sent = 0usize;

    'rotation: while sent < limit && !cancel.is_cancelled() {
        let Some(query) = rotator.next() else {
            info!(client = %client_name, "queries exhausted");
            break;
        };

        let query_cancel = cancel.child_token();
        let pins = match scraper.scrape(query_cancel.clone(), &query).await {
            Ok(pins) => pins,
            Err(e) => {
                warn!(client = %client_name, query = %query, error = %e, "scrape failed, rotating");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ROTATE_BACKOFF) => {}
                }
                continue;
            }
        };

        let mut images = pool.process(query_cancel.clone(), pins);
        while let Some(image) = images.recv().await {
            if sent >= limit {
                query_cancel.cancel();
                break 'rotation;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    query_cancel.cancel();
                    break 'rotation;
                }
                delivered = tx.send(image) => {
                    if delivered.is_err() {
                        debug!(client = %client_name, "subscriber gone, ending job");
                        query_cancel.cancel();
                        break 'rotation;
                    }
                }
            }
            sent += 1;
        }
        // Image channel closed: the query is exhausted (or its tasks were
        // cancelled). Chain to the next query; subscribers keep their
        // channel.
        query_cancel.cancel();
    }

    // Deregister, but only if the registry still points at this job; a
    // restart may have replaced the entry already.
    jobs.remove_if(&client_name, |_, job| job.id == job_id);
    info!(client = %client_name, job = job_id, sent, "scrape job finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraping::breaker::CircuitBreaker;
    use crate::scraping::client::ScrapeClientConfig;
    use crate::scraping::rate_limit::RateLimiter;
    use crate::scraping::testing::{search_body, FakeDriver, FakeFactory};
    use axum::routing::get;
    use axum::Router;
    use image::{ImageBuffer, Rgb};

    /// Serve `count` distinct small PNGs at `/img/{i}` and return the
    /// bound address.
    async fn serve_images(count: u32) -> std::net::SocketAddr {
        let mut app = Router::new();
        for i in 0..count {
            let img = image::DynamicImage::ImageRgb8(ImageBuffer::from_fn(16, 16, move |x, y| {
                Rgb([(x * 10 + i * 40) as u8, (y * 10) as u8, (i * 90) as u8])
            }));
            let mut buf = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageOutputFormat::Png,
            )
            .unwrap();
            app = app.route(
                &format!("/img/{}", i),
                get(move || {
                    let buf = buf.clone();
                    async move { buf }
                }),
            );
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn manager(factory: Arc<FakeFactory>) -> ScrapeManager {
        let config = ScrapeClientConfig {
            response_timeout: Duration::from_millis(100),
            max_consecutive_timeouts: 3,
            scroll_pause_ms: (1, 3),
            ..ScrapeClientConfig::default()
        };
        let scraper = Arc::new(ScrapeClient::new(
            factory,
            Arc::new(RateLimiter::with_jitter(
                Duration::from_millis(1),
                Duration::ZERO,
            )),
            Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
            config,
        ));
        let pool = Arc::new(ImageWorkerPool::new(2, Vec::new()));
        ScrapeManager::new(scraper, pool, CancellationToken::new())
    }

    fn body_for(addr: std::net::SocketAddr, ids: &[u32]) -> Vec<u8> {
        let pins: Vec<(String, String)> = ids
            .iter()
            .map(|i| (i.to_string(), format!("http://{}/img/{}", addr, i)))
            .collect();
        let refs: Vec<(&str, &str)> = pins
            .iter()
            .map(|(id, url)| (id.as_str(), url.as_str()))
            .collect();
        search_body(&refs)
    }

    #[tokio::test]
    async fn chains_queries_without_closing_the_channel() {
        let addr = serve_images(7).await;
        // First query yields three pins then exhausts; the second yields
        // four more. Factory pops from the back.
        let factory = Arc::new(FakeFactory::new(vec![
            FakeDriver::new(vec![body_for(addr, &[3, 4, 5, 6])]),
            FakeDriver::new(vec![body_for(addr, &[0, 1, 2])]),
        ]));
        let manager = manager(factory);

        let mut rx = manager
            .start("bot", vec!["a".to_string(), "b".to_string()], 5)
            .await;

        let mut ids = Vec::new();
        while let Some(image) = rx.recv().await {
            ids.push(image.id);
        }

        // Five images delivered across the query boundary, no early
        // close between pin 3 and pin 4.
        assert_eq!(ids.len(), 5);
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);
    }

    #[tokio::test]
    async fn channel_closes_when_all_queries_exhaust() {
        let addr = serve_images(2).await;
        let factory = Arc::new(FakeFactory::new(vec![FakeDriver::new(vec![body_for(
            addr,
            &[0, 1],
        )])]));
        let manager = manager(factory);

        let mut rx = manager.start("bot", vec!["only".to_string()], 10).await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(manager.active_jobs(), 0);
    }

    #[tokio::test]
    async fn restart_replaces_the_previous_job() {
        let addr = serve_images(1).await;
        let factory = Arc::new(FakeFactory::new(vec![
            FakeDriver::new(vec![body_for(addr, &[0])]),
            FakeDriver::new(vec![body_for(addr, &[0])]),
        ]));
        let manager = manager(factory);

        let mut first = manager.start("bot", vec!["a".to_string()], 10).await;
        let mut second = manager.start("bot", vec!["a".to_string()], 10).await;

        // The first subscriber's channel ends once its job is replaced.
        while first.recv().await.is_some() {}
        assert!(second.recv().await.is_some());
        assert!(manager.active_jobs() <= 1);
    }

    #[tokio::test]
    async fn stop_terminates_within_grace() {
        let addr = serve_images(1).await;
        // Plenty of pages so the job would keep running on its own.
        let bodies = vec![body_for(addr, &[0]); 100];
        let factory = Arc::new(FakeFactory::new(vec![FakeDriver::new(bodies)]));
        let manager = manager(factory);

        let mut rx = manager.start("bot", vec!["a".to_string()], 1000).await;
        let _ = rx.recv().await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), manager.stop("bot")).await;
        assert!(stopped.is_ok(), "stop exceeded the 5s budget");
        assert_eq!(manager.active_jobs(), 0);

        // Channel drains and closes after the stop.
        while rx.recv().await.is_some() {}
    }
}
