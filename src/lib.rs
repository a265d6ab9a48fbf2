//! pinstream: streams perceptually-unique scraped images to
//! authenticated WebSocket clients
//!
//! Clients subscribe with a pool of search queries; the server drives
//! headless-browser scrapes of the upstream image search, deduplicates
//! results twice (perceptual hash, then per-client durable history), and
//! multiplexes the stream to subscribers. Built around:
//! - Scrape orchestration with rate limiting and a circuit breaker
//! - A chromiumoxide-driven paginated search state machine
//! - A fixed worker pool downloading and fingerprinting images (dHash)
//! - A sled-backed per-client history with TTL cleanup
//! - An axum WebSocket surface with header credential auth

pub mod config;
pub mod history;
pub mod imaging;
pub mod scraping;
pub mod server;
pub mod types;

pub use config::Config;
pub use types::*;
