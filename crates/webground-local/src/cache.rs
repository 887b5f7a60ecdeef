//! Read-through cache for acquired page content.
//!
//! Policy (independent of the backend):
//! - key: `scrape:` + the first 200 chars of the normalized URL; a hit must carry that exact URL
//! - entries live for `ttl_s` (7 days by default), judged both by the backend and by `cached_at`
//! - reads are schema-validated; a stored record that fails validation is deleted and missed
//! - writes skip invalid records and anything whose serialized form exceeds 1,024,000 bytes
//! - every backend failure is logged and swallowed

use std::sync::Arc;
use webground_core::{is_content_valid, CacheBackend, ExtractedContent};

pub const CACHE_KEY_PREFIX: &str = "scrape:";
pub const MAX_KEY_URL_CHARS: usize = 200;
pub const DEFAULT_TTL_S: u64 = 7 * 24 * 60 * 60;
pub const MAX_ENTRY_BYTES: usize = 1_024_000;

/// What a write attempt did. Writes never fail the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    SkippedInvalid,
    SkippedTooLarge,
    BackendFailed,
}

#[derive(Clone)]
pub struct AcquisitionCache {
    backend: Arc<dyn CacheBackend>,
    ttl_s: u64,
    max_entry_bytes: usize,
}

impl AcquisitionCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            ttl_s: DEFAULT_TTL_S,
            max_entry_bytes: MAX_ENTRY_BYTES,
        }
    }

    pub fn with_ttl_s(self, ttl_s: u64) -> Self {
        Self { ttl_s, ..self }
    }

    pub fn with_max_entry_bytes(self, max_entry_bytes: usize) -> Self {
        Self {
            max_entry_bytes,
            ..self
        }
    }

    pub fn ttl_s(&self) -> u64 {
        self.ttl_s
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn normalize(url: &str) -> String {
        url::Url::parse(url.trim())
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.trim().to_string())
    }

    /// Normalized, length-bounded, ASCII key for a URL.
    pub fn key_for(url: &str) -> String {
        let bounded: String = Self::normalize(url).chars().take(MAX_KEY_URL_CHARS).collect();
        format!("{CACHE_KEY_PREFIX}{bounded}")
    }

    pub async fn get(&self, url: &str) -> Option<ExtractedContent> {
        let normalized = Self::normalize(url);
        let key = Self::key_for(url);
        let raw = match self.backend.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(%key, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(%key, backend = self.backend.name(), error = %e, "cache read failed; treating as miss");
                return None;
            }
        };

        let record = serde_json::from_str::<ExtractedContent>(&raw)
            .ok()
            .filter(is_content_valid);
        let Some(record) = record else {
            tracing::warn!(%key, "cached record failed validation; deleting");
            self.delete_quietly(&key).await;
            return None;
        };

        // Keys are truncated, so distinct long URLs can share one.
        if record.url != normalized {
            tracing::debug!(%key, cached_url = %record.url, "cache entry belongs to another url");
            return None;
        }

        if let Some(cached_at) = record.cached_at {
            let age_ms = crate::now_epoch_ms().saturating_sub(cached_at);
            if age_ms >= self.ttl_s.saturating_mul(1_000) {
                tracing::debug!(%key, age_ms, "cached record past ttl");
                return None;
            }
        }

        tracing::debug!(%key, "cache hit");
        Some(record)
    }

    /// Store `content` under `url`, stamping `cached_at`. Returns the stamped record only
    /// when it was actually stored.
    pub async fn put(&self, url: &str, content: &ExtractedContent) -> (PutOutcome, Option<ExtractedContent>) {
        let key = Self::key_for(url);
        if !is_content_valid(content) {
            tracing::info!(%key, "content failed validation; not caching");
            return (PutOutcome::SkippedInvalid, None);
        }

        let stamped = content.clone().with_cached_at(crate::now_epoch_ms());
        let serialized = match serde_json::to_string(&stamped) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%key, error = %e, "cache serialization failed");
                return (PutOutcome::BackendFailed, None);
            }
        };
        if serialized.len() > self.max_entry_bytes {
            tracing::info!(%key, bytes = serialized.len(), max = self.max_entry_bytes, "content too large for cache");
            return (PutOutcome::SkippedTooLarge, None);
        }

        match self.backend.set(&key, &serialized, self.ttl_s).await {
            Ok(()) => {
                tracing::debug!(%key, bytes = serialized.len(), "cached content");
                (PutOutcome::Stored, Some(stamped))
            }
            Err(e) => {
                tracing::warn!(%key, backend = self.backend.name(), error = %e, "cache write failed");
                (PutOutcome::BackendFailed, None)
            }
        }
    }

    async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            tracing::warn!(%key, error = %e, "cache delete failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::MemoryCache;
    use webground_core::{Error, ExtractionMethod, Result};

    /// Backend whose every operation fails.
    pub(crate) struct BrokenCache;

    #[async_trait::async_trait]
    impl CacheBackend for BrokenCache {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Cache("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl_s: u64) -> Result<()> {
            Err(Error::Cache("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::Cache("connection refused".to_string()))
        }
    }

    fn record(chars: usize) -> ExtractedContent {
        ExtractedContent::new("Title", &"x".repeat(chars), Vec::new(), "https://example.com/a")
            .with_method(ExtractionMethod::Static)
    }

    #[test]
    fn keys_are_prefixed_normalized_and_bounded() {
        assert_eq!(
            AcquisitionCache::key_for("HTTPS://Example.COM"),
            "scrape:https://example.com/"
        );
        let long = format!("https://example.com/{}", "p".repeat(500));
        let key = AcquisitionCache::key_for(&long);
        assert_eq!(key.len(), CACHE_KEY_PREFIX.len() + MAX_KEY_URL_CHARS);
        assert!(key.is_ascii());
        // Non-ASCII paths are percent-encoded by normalization.
        assert!(AcquisitionCache::key_for("https://example.com/ünï").is_ascii());
    }

    #[tokio::test]
    async fn put_then_get_returns_stamped_record() {
        let cache = AcquisitionCache::new(Arc::new(MemoryCache::default()));
        let c = record(500);
        let (outcome, stored) = cache.put(&c.url, &c).await;
        assert_eq!(outcome, PutOutcome::Stored);
        let stored = stored.unwrap();
        assert!(stored.cached_at.is_some());

        let hit = cache.get(&c.url).await.unwrap();
        assert_eq!(hit, stored);
        assert_eq!(
            ExtractedContent {
                cached_at: None,
                ..hit
            },
            c
        );
    }

    #[tokio::test]
    async fn invalid_records_are_never_written() {
        let backend = Arc::new(MemoryCache::default());
        let cache = AcquisitionCache::new(backend.clone());
        let c = record(100);
        assert_eq!(cache.put(&c.url, &c).await.0, PutOutcome::SkippedInvalid);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn oversized_records_are_dropped_not_truncated() {
        let backend = Arc::new(MemoryCache::default());
        let cache = AcquisitionCache::new(backend.clone()).with_max_entry_bytes(2_000);
        let c = record(5_000);
        assert_eq!(cache.put(&c.url, &c).await, (PutOutcome::SkippedTooLarge, None));
        assert!(backend.is_empty());
        assert!(cache.get(&c.url).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_or_invalid_entries_are_missed_and_deleted() {
        let backend = Arc::new(MemoryCache::default());
        let cache = AcquisitionCache::new(backend.clone());

        let key = AcquisitionCache::key_for("https://example.com/a");
        backend.set(&key, "{not json", 60).await.unwrap();
        assert!(cache.get("https://example.com/a").await.is_none());
        assert_eq!(backend.get(&key).await.unwrap(), None);

        // Well-formed JSON that breaks the >100 chars invariant.
        let short = serde_json::to_string(&record(50)).unwrap();
        backend.set(&key, &short, 60).await.unwrap();
        assert!(cache.get("https://example.com/a").await.is_none());
        assert_eq!(backend.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn records_older_than_ttl_are_absent() {
        let backend = Arc::new(MemoryCache::default());
        let cache = AcquisitionCache::new(backend.clone()).with_ttl_s(60);
        let old = record(500).with_cached_at(1_000);
        let key = AcquisitionCache::key_for(&old.url);
        backend
            .set(&key, &serde_json::to_string(&old).unwrap(), 3_600)
            .await
            .unwrap();
        assert!(cache.get(&old.url).await.is_none());
    }

    #[tokio::test]
    async fn urls_sharing_a_key_prefix_do_not_share_records() {
        let cache = AcquisitionCache::new(Arc::new(MemoryCache::default()));
        let base = format!("https://example.com/{}", "p".repeat(MAX_KEY_URL_CHARS));
        let (one, two) = (format!("{base}?id=1"), format!("{base}?id=2"));
        assert_eq!(AcquisitionCache::key_for(&one), AcquisitionCache::key_for(&two));

        let first = record(500).with_url(one.clone());
        assert_eq!(cache.put(&one, &first).await.0, PutOutcome::Stored);
        assert!(cache.get(&two).await.is_none());
        assert_eq!(cache.get(&one).await.map(|c| c.url), Some(one.clone()));

        // The colliding write replaces the entry.
        let second = record(500).with_url(two.clone());
        assert_eq!(cache.put(&two, &second).await.0, PutOutcome::Stored);
        assert_eq!(cache.get(&two).await.map(|c| c.url), Some(two));
        assert!(cache.get(&one).await.is_none());
    }

    #[tokio::test]
    async fn backend_failures_fail_open() {
        let cache = AcquisitionCache::new(Arc::new(BrokenCache));
        let c = record(500);
        assert!(cache.get(&c.url).await.is_none());
        assert_eq!(cache.put(&c.url, &c).await, (PutOutcome::BackendFailed, None));
    }
}
