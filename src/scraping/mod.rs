//! Scrape orchestration core
//!
//! Coordinates long-running scrape jobs against an adversarial upstream:
//! pacing and failure isolation (rate limiter + circuit breaker), the
//! browser-driven search state machine, the download worker pool, query
//! rotation, and the per-client job registry that chains queries without
//! interrupting subscribers.

pub mod breaker;
pub mod client;
pub mod downloader;
pub mod driver;
pub mod manager;
pub mod rate_limit;
pub mod rotation;

pub use breaker::{CallError, CircuitBreaker, CircuitState};
pub use client::{ScrapeClient, ScrapeClientConfig, ScrapeError};
pub use downloader::ImageWorkerPool;
pub use driver::{BrowserDriver, ChromiumFactory, DriverError, DriverFactory, LaunchOptions};
pub use manager::ScrapeManager;
pub use rate_limit::RateLimiter;
pub use rotation::{QueryRotator, RotationOrder};
