//! In-memory history store
//!
//! Same contract as the sled backend, with no durability. Used by tests
//! and by deployments that do not care about history across restarts.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{ClientHistoryStore, HistoryKey};

/// Volatile history store backed by nested hash maps.
#[derive(Default)]
pub struct MemoryHistoryStore {
    buckets: RwLock<HashMap<String, HashMap<String, DateTime<Utc>>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientHistoryStore for MemoryHistoryStore {
    fn has_seen(&self, client: &str, key: &HistoryKey) -> bool {
        self.buckets
            .read()
            .get(client)
            .map(|bucket| bucket.contains_key(&key.encode()))
            .unwrap_or(false)
    }

    fn mark_seen(&self, client: &str, key: &HistoryKey) {
        self.buckets
            .write()
            .entry(client.to_string())
            .or_default()
            .insert(key.encode(), Utc::now());
    }

    fn clear(&self, client: &str) -> anyhow::Result<()> {
        self.buckets.write().remove(client);
        Ok(())
    }

    fn cleanup_older_than(&self, max_age: Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let mut removed = 0usize;
        let mut buckets = self.buckets.write();
        for bucket in buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|_, stamp| *stamp >= cutoff);
            removed += before - bucket.len();
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        Ok(removed)
    }
}
