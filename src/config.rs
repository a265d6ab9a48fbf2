//! Server configuration
//!
//! Decoded once at startup from `config.json`. Duration fields are
//! human-readable strings (`"5s"`, `"30m"`, `"720h"`); `validate`
//! collects every problem so the operator can fix the file in one pass.
//! Invalid configuration is fatal at boot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::scraping::ScrapeClientConfig;

fn default_port() -> String {
    "8080".to_string()
}

fn default_num_workers() -> usize {
    10
}

fn default_min_delay() -> String {
    "5s".to_string()
}

fn default_max_delay() -> String {
    "6s".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/render.db")
}

fn default_cleanup_interval() -> String {
    "1h".to_string()
}

fn default_max_age() -> String {
    "720h".to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listen port, e.g. "8080"
    #[serde(default = "default_port")]
    pub port: String,
    /// Client name → password
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Download worker pool size
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Scraping behavior
    #[serde(default)]
    pub scraping: ScrapingConfig,
    /// History store location and retention
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            credentials: HashMap::new(),
            num_workers: default_num_workers(),
            scraping: ScrapingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all fields, collecting every error.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        match self.port.parse::<u32>() {
            Ok(port) if port != 0 && port <= 65535 => {}
            _ => errors.push(format!(
                "port must be a number between 1 and 65535, got '{}'",
                self.port
            )),
        }

        if self.num_workers == 0 {
            errors.push("numWorkers must be positive".to_string());
        }

        for (field, value) in [
            ("scraping.minDelay", &self.scraping.min_delay),
            ("scraping.maxDelay", &self.scraping.max_delay),
            ("database.cleanupInterval", &self.database.cleanup_interval),
            ("database.maxAge", &self.database.max_age),
        ] {
            if let Err(e) = humantime::parse_duration(value) {
                errors.push(format!("{} is not a valid duration ('{}'): {}", field, value, e));
            }
        }

        if humantime::parse_duration(&self.scraping.min_delay)
            .ok()
            .zip(humantime::parse_duration(&self.scraping.max_delay).ok())
            .map(|(min, max)| max < min)
            .unwrap_or(false)
        {
            errors.push("scraping.maxDelay must not be smaller than scraping.minDelay".to_string());
        }

        if self.database.path.as_os_str().is_empty() {
            errors.push("database.path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

/// Scraping behavior and browser fingerprinting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapingConfig {
    /// Minimum spacing between upstream actions
    #[serde(default = "default_min_delay")]
    pub min_delay: String,
    /// Upper bound for spacing; the difference to minDelay becomes jitter
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
    /// Seed queries (kept for operators pre-provisioning clients)
    #[serde(default)]
    pub queries: Vec<String>,
    /// Optional modifiers combined with client queries
    #[serde(default)]
    pub modifiers: Vec<String>,
    /// User-agent pool for browser sessions and downloads
    #[serde(default)]
    pub user_agents: Vec<String>,
    /// Candidate browser executables; empty falls back to built-ins
    #[serde(default)]
    pub browser_paths: Vec<PathBuf>,
    /// Run browsers headless
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Legacy image-pool size; accepted and ignored
    #[serde(default, skip_serializing)]
    pub pool_size: Option<usize>,
    /// Legacy pool refresh interval; accepted and ignored
    #[serde(default, skip_serializing)]
    pub refresh_interval: Option<String>,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            queries: Vec::new(),
            modifiers: Vec::new(),
            user_agents: Vec::new(),
            browser_paths: Vec::new(),
            headless: default_headless(),
            pool_size: None,
            refresh_interval: None,
        }
    }
}

impl ScrapingConfig {
    /// Minimum spacing between upstream actions.
    pub fn min_delay(&self) -> Duration {
        humantime::parse_duration(&self.min_delay).unwrap_or(Duration::from_secs(5))
    }

    /// Jitter budget: the gap between maxDelay and minDelay, at least
    /// zero. Validation already rejected unparseable values.
    pub fn jitter_max(&self) -> Duration {
        let max = humantime::parse_duration(&self.max_delay).unwrap_or(Duration::from_secs(6));
        max.saturating_sub(self.min_delay())
    }

    /// Scrape-client tuning derived from this config; unset pools fall
    /// back to the client defaults.
    pub fn client_config(&self) -> ScrapeClientConfig {
        let mut config = ScrapeClientConfig::default();
        if !self.browser_paths.is_empty() {
            config.executables = self.browser_paths.clone();
        }
        if !self.user_agents.is_empty() {
            config.user_agents = self.user_agents.clone();
        }
        config.headless = self.headless;
        config
    }
}

/// History store location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database directory
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// How often the cleanup sweep runs
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
    /// Entries older than this are removed
    #[serde(default = "default_max_age")]
    pub max_age: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            cleanup_interval: default_cleanup_interval(),
            max_age: default_max_age(),
        }
    }
}

impl DatabaseConfig {
    pub fn cleanup_interval(&self) -> Duration {
        humantime::parse_duration(&self.cleanup_interval)
            .unwrap_or(Duration::from_secs(3600))
    }

    pub fn max_age(&self) -> Duration {
        humantime::parse_duration(&self.max_age)
            .unwrap_or(Duration::from_secs(720 * 3600))
    }
}
