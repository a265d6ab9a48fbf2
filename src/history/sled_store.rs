//! Sled-backed history store
//!
//! One sled tree per client; entries map encoded keys to RFC 3339
//! timestamps. Survives restarts; a cleanup task sweeps stale entries.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

use super::{ClientHistoryStore, HistoryKey};

/// Durable history store persisted at a single sled database path.
pub struct SledHistoryStore {
    db: sled::Db,
}

impl SledHistoryStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("failed to open history database at {:?}", path))?;
        Ok(Self { db })
    }

    /// Flush pending writes to disk. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("failed to flush history database")?;
        Ok(())
    }

    fn tree(&self, client: &str) -> sled::Result<sled::Tree> {
        self.db.open_tree(client.as_bytes())
    }
}

impl ClientHistoryStore for SledHistoryStore {
    fn has_seen(&self, client: &str, key: &HistoryKey) -> bool {
        let tree = match self.tree(client) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(client, error = %e, "history read failed, treating as unseen");
                return false;
            }
        };
        match tree.get(key.encode().as_bytes()) {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                warn!(client, error = %e, "history read failed, treating as unseen");
                false
            }
        }
    }

    fn mark_seen(&self, client: &str, key: &HistoryKey) {
        let stamp = Utc::now().to_rfc3339();
        let result = self
            .tree(client)
            .and_then(|tree| tree.insert(key.encode().as_bytes(), stamp.as_bytes()));
        if let Err(e) = result {
            warn!(client, error = %e, "failed to record delivered image");
        }
    }

    fn clear(&self, client: &str) -> Result<()> {
        self.db
            .drop_tree(client.as_bytes())
            .with_context(|| format!("failed to clear history for client {}", client))?;
        Ok(())
    }

    fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let mut removed = 0usize;

        for name in self.db.tree_names() {
            // Sled's internal default tree holds no client entries.
            if name.as_ref() == b"__sled__default" {
                continue;
            }
            let tree = self.db.open_tree(&name)?;
            for entry in tree.iter() {
                let (key, value) = entry?;
                let expired = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|stamp| stamp.with_timezone(&Utc) < cutoff)
                    // Unparseable timestamps are corrupt; sweep them too.
                    .unwrap_or(true);
                if expired {
                    tree.remove(&key)?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SledHistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledHistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn unknown_client_has_seen_nothing() {
        let (_dir, store) = open_store();
        assert!(!store.has_seen("nobody", &HistoryKey::Hash(42)));
    }

    #[test]
    fn mark_then_has_seen() {
        let (_dir, store) = open_store();
        let key = HistoryKey::Hash(0xDEAD_BEEF);

        store.mark_seen("bot", &key);
        assert!(store.has_seen("bot", &key));
        // Idempotent.
        store.mark_seen("bot", &key);
        assert!(store.has_seen("bot", &key));
    }

    #[test]
    fn histories_are_isolated_per_client() {
        let (_dir, store) = open_store();
        let key = HistoryKey::Pin("12345".to_string());

        store.mark_seen("alpha", &key);
        assert!(store.has_seen("alpha", &key));
        assert!(!store.has_seen("beta", &key));
    }

    #[test]
    fn clear_drops_the_whole_bucket() {
        let (_dir, store) = open_store();
        store.mark_seen("bot", &HistoryKey::Hash(1));
        store.mark_seen("bot", &HistoryKey::Pin("2".to_string()));

        store.clear("bot").unwrap();
        assert!(!store.has_seen("bot", &HistoryKey::Hash(1)));
        assert!(!store.has_seen("bot", &HistoryKey::Pin("2".to_string())));
    }

    #[test]
    fn cleanup_removes_only_stale_entries() {
        let (_dir, store) = open_store();
        let fresh = HistoryKey::Hash(1);
        let stale = HistoryKey::Hash(2);

        store.mark_seen("bot", &fresh);
        // Backdate one entry past the cutoff.
        let old_stamp = (Utc::now() - chrono::Duration::hours(48)).to_rfc3339();
        store
            .tree("bot")
            .unwrap()
            .insert(stale.encode().as_bytes(), old_stamp.as_bytes())
            .unwrap();

        let removed = store.cleanup_older_than(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.has_seen("bot", &fresh));
        assert!(!store.has_seen("bot", &stale));
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let key = HistoryKey::Hash(7);

        {
            let store = SledHistoryStore::open(&path).unwrap();
            store.mark_seen("bot", &key);
            store.flush().unwrap();
        }

        let store = SledHistoryStore::open(&path).unwrap();
        assert!(store.has_seen("bot", &key));
    }
}
