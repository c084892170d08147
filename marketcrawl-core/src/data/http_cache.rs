//! On-disk cache of provider response bodies, keyed by request URL.
//!
//! Layout: `{cache_dir}/{blake3(url)}.json`, each entry holding the URL, the
//! fetch time and the body. Entries older than the TTL are ignored and
//! replaced on the next successful fetch. Writes go through a temp file and a
//! rename so concurrent workers never observe a half-written entry.

use super::provider::DataError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    fetched_at: DateTime<Utc>,
    body: String,
}

#[derive(Debug)]
pub struct HttpCache {
    cache_dir: PathBuf,
    ttl: Duration,
    tmp_counter: AtomicU64,
}

impl HttpCache {
    /// Open (and create if needed) a cache directory.
    pub fn open(cache_dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, DataError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            DataError::Cache(format!("failed to create {}: {e}", cache_dir.display()))
        })?;
        Ok(Self {
            cache_dir,
            ttl,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let hash = blake3::hash(url.as_bytes()).to_hex();
        self.cache_dir.join(format!("{hash}.json"))
    }

    /// Fresh cached body for `url`, if any. Unreadable entries count as misses.
    pub fn get(&self, url: &str) -> Option<String> {
        let content = fs::read_to_string(self.entry_path(url)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&content).ok()?;
        if entry.url != url {
            return None;
        }
        let age = Utc::now().signed_duration_since(entry.fetched_at);
        // A TTL too large for chrono never expires.
        let expired = chrono::Duration::from_std(self.ttl).is_ok_and(|ttl| age > ttl);
        if expired {
            tracing::debug!(url, "http cache entry expired");
            return None;
        }
        Some(entry.body)
    }

    pub fn put(&self, url: &str, body: &str) -> Result<(), DataError> {
        let entry = CacheEntry {
            url: url.to_string(),
            fetched_at: Utc::now(),
            body: body.to_string(),
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| DataError::Cache(format!("entry serialization: {e}")))?;

        let path = self.entry_path(url);
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("json.{}.{n}.tmp", std::process::id()));

        fs::write(&tmp_path, json)
            .map_err(|e| DataError::Cache(format!("write {}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::Cache(format!("atomic rename failed: {e}"))
        })
    }
}
