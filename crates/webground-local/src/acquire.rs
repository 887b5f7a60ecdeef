//! Content acquisition: URL check, cache, then extraction tiers in order.

use std::sync::Arc;
use webground_core::{is_content_valid, ContentExtractor, Error, ExtractedContent, Result};

use crate::cache::AcquisitionCache;

/// Orchestrates one URL per call.
///
/// Tiers run in order. Every tier but the last is a planned fallback: its errors and
/// too-short results move on to the next tier. The last tier is trusted as-is and its
/// failure ends the call with [`Error::Acquisition`].
#[derive(Clone)]
pub struct ContentAcquirer {
    cache: AcquisitionCache,
    tiers: Vec<Arc<dyn ContentExtractor>>,
}

impl ContentAcquirer {
    pub fn new(cache: AcquisitionCache, tiers: Vec<Arc<dyn ContentExtractor>>) -> Self {
        Self { cache, tiers }
    }

    pub fn cache(&self) -> &AcquisitionCache {
        &self.cache
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Parse and normalize a target URL. Only absolute http(s) URLs are accepted.
    pub fn parse_url(raw: &str) -> Result<url::Url> {
        let u = url::Url::parse(raw.trim()).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
        match u.scheme() {
            "http" | "https" if u.host_str().is_some() => Ok(u),
            _ => Err(Error::InvalidUrl(format!("{raw}: expected an http(s) URL"))),
        }
    }

    pub async fn acquire(&self, raw_url: &str) -> Result<ExtractedContent> {
        let url = Self::parse_url(raw_url)?;

        if let Some(hit) = self.cache.get(url.as_str()).await {
            tracing::info!(url = %url, tier = ?hit.extraction_method, "served from cache");
            return Ok(hit);
        }

        let content = self.run_tiers(&url).await?;

        // A record that did not make it into the cache is still the answer.
        match self.cache.put(url.as_str(), &content).await {
            (_, Some(stored)) => Ok(stored),
            (outcome, None) => {
                tracing::debug!(url = %url, ?outcome, "returning uncached record");
                Ok(content)
            }
        }
    }

    async fn run_tiers(&self, url: &url::Url) -> Result<ExtractedContent> {
        let Some((last, fallbacks)) = self.tiers.split_last() else {
            return Err(Error::NotConfigured("no extraction tiers".to_string()));
        };

        for tier in fallbacks {
            let method = tier.method();
            tracing::debug!(url = %url, tier = %method, "trying tier");
            match tier.extract(url).await {
                Ok(c) if is_content_valid(&c) => {
                    tracing::info!(url = %url, tier = %method, chars = c.main_content_chars(), "extracted");
                    return Ok(c.with_method(method).with_url(url.as_str()));
                }
                Ok(c) => {
                    tracing::info!(url = %url, tier = %method, chars = c.main_content_chars(), "content too short; falling back");
                }
                Err(e) => {
                    tracing::warn!(url = %url, tier = %method, error = %e, "tier failed; falling back");
                }
            }
        }

        let method = last.method();
        tracing::debug!(url = %url, tier = %method, "trying last tier");
        let c = last.extract(url).await.map_err(|e| Error::Acquisition {
            tier: method,
            source: Box::new(e),
        })?;
        tracing::info!(url = %url, tier = %method, chars = c.main_content_chars(), "extracted");
        Ok(c.with_method(method).with_url(url.as_str()))
    }
}
