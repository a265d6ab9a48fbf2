//! HTTP surface and process wiring
//!
//! Builds the axum application (index + authenticated `/scrape`
//! WebSocket), owns the scrape manager and history store handles, runs
//! the periodic history cleanup, and serves with graceful shutdown.

pub mod auth;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::history::ClientHistoryStore;
use crate::scraping::{
    CircuitBreaker, DriverFactory, ImageWorkerPool, RateLimiter, ScrapeClient, ScrapeManager,
};

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ScrapeManager>,
    pub history: Arc<dyn ClientHistoryStore>,
}

/// The pinstream server: scrape orchestration plus its HTTP surface.
pub struct Server {
    config: Config,
    state: AppState,
    shutdown: CancellationToken,
}

impl Server {
    /// Wire the scraping core from configuration. `shutdown` is the
    /// process-level cancellation scope.
    pub fn new(
        config: Config,
        history: Arc<dyn ClientHistoryStore>,
        factory: Arc<dyn DriverFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::with_jitter(
            config.scraping.min_delay(),
            config.scraping.jitter_max(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreaker::DEFAULT_MAX_FAILURES,
            CircuitBreaker::DEFAULT_TIMEOUT,
        ));
        let scraper = Arc::new(ScrapeClient::new(
            factory,
            limiter,
            breaker,
            config.scraping.client_config(),
        ));
        let pool = Arc::new(ImageWorkerPool::new(
            config.num_workers,
            config.scraping.user_agents.clone(),
        ));
        let manager = Arc::new(
            ScrapeManager::new(scraper, pool, shutdown.child_token())
                .with_modifiers(config.scraping.modifiers.clone()),
        );

        Self {
            state: AppState { manager, history },
            config,
            shutdown,
        }
    }

    /// Build the router; split out so tests can drive the app without a
    /// listener.
    pub fn router(&self) -> Router {
        let auth_state = auth::AuthState::new(self.config.credentials.clone());

        Router::new()
            .route("/scrape", get(ws::scrape_ws))
            .route_layer(middleware::from_fn_with_state(
                auth_state,
                auth::auth_middleware,
            ))
            .route("/", get(|| async { "Image scraper server is running.\n" }))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown token fires, then stop every job.
    pub async fn run(&self) -> Result<()> {
        self.spawn_cleanup_ticker();

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(addr = %addr, "server listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("server error")?;

        info!("shutting down, stopping scrape jobs");
        self.state.manager.stop_all().await;
        Ok(())
    }

    /// Periodic history sweep; entries older than the configured max age
    /// are removed.
    fn spawn_cleanup_ticker(&self) {
        let interval = self.config.database.cleanup_interval();
        let max_age = self.config.database.max_age();
        let history = Arc::clone(&self.state.history);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sweep at boot; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match history.cleanup_older_than(max_age) {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "history cleanup finished");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "history cleanup failed"),
                        }
                    }
                }
            }
        });
    }
}
