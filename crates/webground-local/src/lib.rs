use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use webground_core::{CacheBackend, ContentExtractor, Error, ExtractedContent, ExtractionMethod, Result};

pub mod acquire;
pub mod answer;
pub mod cache;
pub mod chat;
pub mod config;
pub mod extract;
pub mod memory_cache;
pub mod ollama;
pub mod openai_compat;
pub mod render_playwright;
pub mod upstash;

pub use acquire::ContentAcquirer;
pub use answer::Answerer;
pub use cache::AcquisitionCache;
pub use chat::{ChatEnvelope, ChatReply, ChatRoute, ChatService};
pub use config::Settings;
pub use memory_cache::MemoryCache;
pub use render_playwright::RenderedExtractor;
pub use upstash::UpstashCache;

/// Sent by both extraction tiers; some sites refuse obviously non-browser clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// System message sent with every completion.
pub const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Remove and return every complete `\n`-terminated line in `buf` (without the terminator
/// or a trailing `\r`). A partial last line stays buffered.
pub(crate) fn take_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let rest = buf.split_off(end + 1);
    let done = std::mem::replace(buf, rest);
    // `done` ends with '\n', so the last piece of the split is always empty.
    let mut lines: Vec<String> = done
        .split(|b| *b == b'\n')
        .map(|l| String::from_utf8_lossy(l.strip_suffix(b"\r").unwrap_or(l)).into_owned())
        .collect();
    lines.pop();
    lines
}

/// Next body chunk of a streamed model response, failing if the server goes quiet for
/// longer than `idle`. The stream as a whole is not bounded.
pub(crate) async fn next_chunk_within<S, T, E>(
    stream: &mut S,
    idle: Duration,
    provider: &str,
) -> Result<Option<T>>
where
    S: futures_util::Stream<Item = std::result::Result<T, E>> + Unpin,
    E: std::fmt::Display,
{
    match tokio::time::timeout(idle, futures_util::StreamExt::next(stream)).await {
        Err(_) => Err(Error::Model(format!(
            "{provider} stream stalled for {}ms",
            idle.as_millis()
        ))),
        Ok(None) => Ok(None),
        Ok(Some(Err(e))) => Err(Error::Model(e.to_string())),
        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
    }
}

pub(crate) fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Serialize, Deserialize)]
struct FsEntry {
    schema_version: u32,
    key: String,
    stored_at_epoch_s: u64,
    expires_at_epoch_s: u64,
    value: String,
}

/// Filesystem cache backend: one JSON envelope per key.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn default_dir() -> PathBuf {
        // Keep it local + user-owned; caller can override.
        std::env::temp_dir().join("webground-cache")
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut h = Sha256::new();
        h.update(key.as_bytes());
        let hex = hex::encode(h.finalize());
        self.root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{hex}.json"))
    }

    fn get_blocking(&self, key: &str) -> Result<Option<String>> {
        let p = self.path_for(key);
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).map_err(|e| Error::Cache(e.to_string()))?;
        let entry: FsEntry =
            serde_json::from_slice(&bytes).map_err(|e| Error::Cache(e.to_string()))?;
        if entry.key != key {
            return Ok(None);
        }
        if now_epoch_s() >= entry.expires_at_epoch_s {
            // Expired entries are absent; removal is best-effort.
            let _ = fs::remove_file(&p);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn set_blocking(&self, key: &str, value: &str, ttl_s: u64) -> Result<()> {
        let p = self.path_for(key);
        let Some(parent) = p.parent() else {
            return Err(Error::Cache(format!("bad cache path: {}", p.display())));
        };
        fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        let now_s = now_epoch_s();
        let entry = FsEntry {
            schema_version: 1,
            key: key.to_string(),
            stored_at_epoch_s: now_s,
            expires_at_epoch_s: now_s.saturating_add(ttl_s),
            value: value.to_string(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| Error::Cache(e.to_string()))?;
        // Write-then-rename so concurrent readers never see a partial file.
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::Cache(e.to_string()))?;
        tmp.write_all(&bytes)
            .map_err(|e| Error::Cache(e.to_string()))?;
        tmp.persist(&p).map_err(|e| Error::Cache(e.to_string()))?;
        Ok(())
    }

    fn delete_blocking(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cache(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for FsCache {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let cache = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.get_blocking(&key))
            .await
            .map_err(|e| Error::Cache(format!("cache get join failed: {e}")))?
    }

    async fn set(&self, key: &str, value: &str, ttl_s: u64) -> Result<()> {
        let cache = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || cache.set_blocking(&key, &value, ttl_s))
            .await
            .map_err(|e| Error::Cache(format!("cache put join failed: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let cache = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.delete_blocking(&key))
            .await
            .map_err(|e| Error::Cache(format!("cache delete join failed: {e}")))?
    }
}

/// First tier: plain HTTP GET, then a static parse of the returned markup.
#[derive(Debug, Clone)]
pub struct StaticExtractor {
    client: reqwest::Client,
    max_bytes: usize,
}

impl StaticExtractor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_BYTES: usize = 5_000_000;

    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            // Avoid “hang forever” on DNS/TLS/body stalls.
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client, max_bytes })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Self::DEFAULT_TIMEOUT, Self::DEFAULT_MAX_BYTES)
    }

    /// GET the document. Non-2xx statuses are failures.
    pub async fn fetch_html(&self, url: &url::Url) -> Result<String> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status}")));
        }

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                let can_take = self.max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                tracing::debug!(url = %url, max_bytes = self.max_bytes, "static fetch body truncated");
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait::async_trait]
impl ContentExtractor for StaticExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Static
    }

    async fn extract(&self, url: &url::Url) -> Result<ExtractedContent> {
        let html = self.fetch_html(url).await?;
        let url_s = url.to_string();
        // html5ever parsing is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || extract::extract_from_html(&html, &url_s))
            .await
            .map_err(|e| Error::Fetch(format!("static parse join failed: {e}")))
    }
}
