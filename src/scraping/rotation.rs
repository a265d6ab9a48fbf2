//! Query rotation for long-running scrape jobs
//!
//! Yields search queries from a caller-supplied pool. Without modifiers
//! the pool is walked once per session; with modifiers, fresh
//! `"{modifier} {base}"` combinations are sampled with a reuse window so
//! the upstream keeps seeing varied queries.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

/// How long a modifier/base combination is considered "recently used".
const REUSE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Attempts at finding an unused combination before giving up and
/// returning the latest candidate anyway.
const MAX_SAMPLE_ATTEMPTS: usize = 10;

/// Order in which a modifier-less rotator walks its base pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOrder {
    /// In the order the queries were supplied.
    Sequential,
    /// A uniform-random permutation fixed at construction.
    Shuffled,
}

struct RotatorInner {
    /// Next index into `queue` (modifier-less mode).
    cursor: usize,
    /// Base pool, possibly shuffled.
    queue: Vec<String>,
    /// Combination → last emission time (modifier mode).
    used: HashMap<String, Instant>,
}

/// Thread-safe query source for one scrape session.
pub struct QueryRotator {
    base_queries: Vec<String>,
    modifiers: Vec<String>,
    inner: Mutex<RotatorInner>,
}

impl QueryRotator {
    /// Rotator that walks `base_queries` once, in the given order, then
    /// reports exhaustion.
    pub fn new(base_queries: Vec<String>, order: RotationOrder) -> Self {
        let mut queue = base_queries.clone();
        if order == RotationOrder::Shuffled {
            queue.shuffle(&mut rand::thread_rng());
        }
        Self {
            base_queries,
            modifiers: Vec::new(),
            inner: Mutex::new(RotatorInner {
                cursor: 0,
                queue,
                used: HashMap::new(),
            }),
        }
    }

    /// Rotator that samples `"{modifier} {base}"` combinations, avoiding
    /// any combination emitted within the last hour. Never exhausts while
    /// both pools are non-empty.
    pub fn with_modifiers(base_queries: Vec<String>, modifiers: Vec<String>) -> Self {
        Self {
            base_queries,
            modifiers,
            inner: Mutex::new(RotatorInner {
                cursor: 0,
                queue: Vec::new(),
                used: HashMap::new(),
            }),
        }
    }

    /// Next query, or `None` when the source is exhausted (or was empty
    /// to begin with).
    pub fn next(&self) -> Option<String> {
        if self.base_queries.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock();

        if self.modifiers.is_empty() {
            let query = inner.queue.get(inner.cursor).cloned()?;
            inner.cursor += 1;
            return Some(query);
        }

        let mut rng = rand::thread_rng();
        let now = Instant::now();
        let mut candidate = String::new();
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let base = &self.base_queries[rng.gen_range(0..self.base_queries.len())];
            let modifier = &self.modifiers[rng.gen_range(0..self.modifiers.len())];
            candidate = format!("{} {}", modifier, base);

            let recently_used = inner
                .used
                .get(&candidate)
                .map(|at| now.duration_since(*at) < REUSE_WINDOW)
                .unwrap_or(false);
            if !recently_used {
                break;
            }
        }

        inner.used.insert(candidate.clone(), now);
        Some(candidate)
    }
}
