//! Environment-driven settings, read once at startup, and the wiring that turns them into a
//! [`ChatService`].

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use webground_core::{CacheBackend, ContentExtractor, Error, LanguageModel, Result};

use crate::cache::DEFAULT_TTL_S;
use crate::ollama::OllamaClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::render_playwright::{detect_node_path, RenderOptions};
use crate::{
    AcquisitionCache, Answerer, ChatService, ContentAcquirer, FsCache, MemoryCache,
    RenderedExtractor, StaticExtractor, UpstashCache,
};

/// Variable lookup; blank values count as unset.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn truthy(&self, key: &str) -> bool {
        matches!(
            self.get(key).unwrap_or_default().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<T>()
                .map_err(|_| Error::NotConfigured(format!("{key}={v:?} is not a valid value"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Fs,
    Memory,
    Upstash,
}

impl CacheKind {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" => Ok(CacheKind::Fs),
            "memory" => Ok(CacheKind::Memory),
            "upstash" => Ok(CacheKind::Upstash),
            other => Err(Error::NotConfigured(format!(
                "WEBGROUND_CACHE={other:?} (expected fs, memory or upstash)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenaiCompat,
    Ollama,
}

impl LlmProvider {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai_compat" | "openai-compat" | "groq" => Ok(LlmProvider::OpenaiCompat),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(Error::NotConfigured(format!(
                "WEBGROUND_LLM_PROVIDER={other:?} (expected openai_compat or ollama)"
            ))),
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenaiCompat => OpenAiCompatClient::DEFAULT_BASE_URL,
            LlmProvider::Ollama => OllamaClient::DEFAULT_BASE_URL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheKind,
    pub cache_dir: PathBuf,
    pub cache_ttl_s: u64,
    pub upstash_url: Option<String>,
    pub upstash_token: Option<String>,

    pub fetch_timeout: Duration,
    pub fetch_max_bytes: usize,

    pub render_disabled: bool,
    pub node_bin: String,
    pub node_path: Option<String>,
    pub render_timeout: Duration,
    pub render_no_sandbox: bool,

    pub llm_provider: LlmProvider,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheKind::Fs,
            cache_dir: FsCache::default_dir(),
            cache_ttl_s: DEFAULT_TTL_S,
            upstash_url: None,
            upstash_token: None,
            fetch_timeout: StaticExtractor::DEFAULT_TIMEOUT,
            fetch_max_bytes: StaticExtractor::DEFAULT_MAX_BYTES,
            render_disabled: false,
            node_bin: "node".to_string(),
            node_path: None,
            render_timeout: Duration::from_secs(30),
            render_no_sandbox: false,
            llm_provider: LlmProvider::OpenaiCompat,
            llm_base_url: OpenAiCompatClient::DEFAULT_BASE_URL.to_string(),
            llm_api_key: None,
            llm_model: OpenAiCompatClient::DEFAULT_MODEL.to_string(),
            llm_temperature: 0.7,
            llm_timeout: Duration::from_secs(60),
        }
    }
}

/// Non-secret view of the settings (what `doctor` prints).
#[derive(Debug, Clone, Serialize)]
pub struct SettingsSummary {
    pub cache: CacheKind,
    pub cache_dir: Option<String>,
    pub cache_ttl_s: u64,
    pub upstash_configured: bool,
    pub fetch_timeout_ms: u64,
    pub fetch_max_bytes: usize,
    pub render_enabled: bool,
    pub node_bin: String,
    pub render_timeout_ms: u64,
    pub llm_provider: LlmProvider,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key_present: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);
        let d = Settings::default();
        let llm_provider = match env.get("WEBGROUND_LLM_PROVIDER") {
            Some(s) => LlmProvider::parse(&s)?,
            None => d.llm_provider,
        };
        Ok(Self {
            cache: match env.get("WEBGROUND_CACHE") {
                Some(s) => CacheKind::parse(&s)?,
                None => d.cache,
            },
            cache_dir: env
                .get("WEBGROUND_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.cache_dir),
            cache_ttl_s: env.parse("WEBGROUND_CACHE_TTL_S", d.cache_ttl_s)?,
            upstash_url: env.get("UPSTASH_REDIS_REST_URL"),
            upstash_token: env.get("UPSTASH_REDIS_REST_TOKEN"),

            fetch_timeout: Duration::from_millis(env.parse(
                "WEBGROUND_FETCH_TIMEOUT_MS",
                d.fetch_timeout.as_millis() as u64,
            )?),
            fetch_max_bytes: env.parse("WEBGROUND_FETCH_MAX_BYTES", d.fetch_max_bytes)?,

            render_disabled: env.truthy("WEBGROUND_RENDER_DISABLE"),
            node_bin: env.get("WEBGROUND_NODE").unwrap_or(d.node_bin),
            node_path: env.get("WEBGROUND_NODE_PATH"),
            render_timeout: Duration::from_millis(env.parse(
                "WEBGROUND_RENDER_TIMEOUT_MS",
                d.render_timeout.as_millis() as u64,
            )?),
            render_no_sandbox: env.truthy("WEBGROUND_RENDER_NO_SANDBOX"),

            llm_provider,
            llm_base_url: env
                .get("WEBGROUND_LLM_BASE_URL")
                .unwrap_or_else(|| llm_provider.default_base_url().to_string()),
            llm_api_key: env.get("WEBGROUND_LLM_API_KEY").or_else(|| env.get("GROQ_API_KEY")),
            llm_model: env.get("WEBGROUND_LLM_MODEL").unwrap_or(d.llm_model),
            llm_temperature: env.parse("WEBGROUND_LLM_TEMPERATURE", d.llm_temperature)?,
            llm_timeout: Duration::from_millis(env.parse(
                "WEBGROUND_LLM_TIMEOUT_MS",
                d.llm_timeout.as_millis() as u64,
            )?),
        })
    }

    pub fn summary(&self) -> SettingsSummary {
        SettingsSummary {
            cache: self.cache,
            cache_dir: (self.cache == CacheKind::Fs)
                .then(|| self.cache_dir.to_string_lossy().to_string()),
            cache_ttl_s: self.cache_ttl_s,
            upstash_configured: self.upstash_url.is_some() && self.upstash_token.is_some(),
            fetch_timeout_ms: self.fetch_timeout.as_millis() as u64,
            fetch_max_bytes: self.fetch_max_bytes,
            render_enabled: !self.render_disabled,
            node_bin: self.node_bin.clone(),
            render_timeout_ms: self.render_timeout.as_millis() as u64,
            llm_provider: self.llm_provider,
            llm_base_url: self.llm_base_url.clone(),
            llm_model: self.llm_model.clone(),
            llm_api_key_present: self.llm_api_key.is_some(),
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::NotConfigured(format!("http client: {e}")))
    }

    pub fn build_cache_backend(&self) -> Result<Arc<dyn CacheBackend>> {
        let backend: Arc<dyn CacheBackend> = match self.cache {
            CacheKind::Fs => Arc::new(FsCache::new(self.cache_dir.clone())),
            CacheKind::Memory => Arc::new(MemoryCache::default()),
            CacheKind::Upstash => {
                let (Some(url), Some(token)) = (&self.upstash_url, &self.upstash_token) else {
                    return Err(Error::NotConfigured(
                        "WEBGROUND_CACHE=upstash needs UPSTASH_REDIS_REST_URL and UPSTASH_REDIS_REST_TOKEN"
                            .to_string(),
                    ));
                };
                Arc::new(UpstashCache::new(self.http_client()?, url.clone(), token.clone()))
            }
        };
        Ok(backend)
    }

    /// Static tier then rendered tier.
    pub fn build_tiers(&self) -> Result<Vec<Arc<dyn ContentExtractor>>> {
        let stat = StaticExtractor::new(self.fetch_timeout, self.fetch_max_bytes)?;
        let rendered = if self.render_disabled {
            RenderedExtractor::disabled()
        } else {
            RenderedExtractor::new(RenderOptions {
                node_bin: self.node_bin.clone(),
                node_path: detect_node_path(self.node_path.as_deref()),
                navigation_timeout: self.render_timeout,
                no_sandbox: self.render_no_sandbox,
                max_html_bytes: self.fetch_max_bytes,
                ..RenderOptions::default()
            })
        };
        let tiers: Vec<Arc<dyn ContentExtractor>> = vec![Arc::new(stat), Arc::new(rendered)];
        Ok(tiers)
    }

    pub fn build_acquirer(&self) -> Result<ContentAcquirer> {
        let cache = AcquisitionCache::new(self.build_cache_backend()?).with_ttl_s(self.cache_ttl_s);
        Ok(ContentAcquirer::new(cache, self.build_tiers()?))
    }

    pub fn build_model(&self) -> Result<Arc<dyn LanguageModel>> {
        let client = self.http_client()?;
        let model: Arc<dyn LanguageModel> = match self.llm_provider {
            LlmProvider::OpenaiCompat => Arc::new(
                OpenAiCompatClient::new(
                    client,
                    self.llm_base_url.clone(),
                    self.llm_api_key.clone(),
                    self.llm_model.clone(),
                )
                .with_temperature(self.llm_temperature)
                .with_timeout(self.llm_timeout),
            ),
            LlmProvider::Ollama => Arc::new(
                OllamaClient::new(client, self.llm_base_url.clone(), self.llm_model.clone())
                    .with_temperature(self.llm_temperature)
                    .with_timeout(self.llm_timeout),
            ),
        };
        Ok(model)
    }

    pub fn build_service(&self) -> Result<ChatService> {
        Ok(ChatService::new(
            self.build_acquirer()?,
            Answerer::new(self.build_model()?),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_and_cache_names_parse() {
        assert_eq!(LlmProvider::parse("Ollama").unwrap(), LlmProvider::Ollama);
        assert_eq!(LlmProvider::parse("groq").unwrap(), LlmProvider::OpenaiCompat);
        assert!(LlmProvider::parse("bard").is_err());
        assert_eq!(CacheKind::parse("MEMORY").unwrap(), CacheKind::Memory);
        assert!(matches!(CacheKind::parse("redis"), Err(Error::NotConfigured(_))));
    }

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.cache, CacheKind::Fs);
        assert_eq!(s.cache_ttl_s, DEFAULT_TTL_S);
        assert_eq!(s.llm_provider, LlmProvider::OpenaiCompat);
        assert_eq!(s.llm_base_url, OpenAiCompatClient::DEFAULT_BASE_URL);
        assert!(s.llm_api_key.is_none());
        assert!(!s.render_disabled);
    }

    #[test]
    fn variables_are_read_and_trimmed() {
        let s = settings(&[
            ("WEBGROUND_CACHE", " memory "),
            ("WEBGROUND_CACHE_TTL_S", "60"),
            ("WEBGROUND_FETCH_TIMEOUT_MS", "1500"),
            ("WEBGROUND_RENDER_DISABLE", "TRUE"),
            ("WEBGROUND_RENDER_NO_SANDBOX", "0"),
            ("WEBGROUND_LLM_PROVIDER", "ollama"),
            ("WEBGROUND_LLM_MODEL", "llama3"),
        ])
        .unwrap();
        assert_eq!(s.cache, CacheKind::Memory);
        assert_eq!(s.cache_ttl_s, 60);
        assert_eq!(s.fetch_timeout, Duration::from_millis(1500));
        assert!(s.render_disabled);
        assert!(!s.render_no_sandbox);
        assert_eq!(s.llm_provider, LlmProvider::Ollama);
        // The base url follows the provider unless set explicitly.
        assert_eq!(s.llm_base_url, OllamaClient::DEFAULT_BASE_URL);
        assert_eq!(s.llm_model, "llama3");
    }

    #[test]
    fn groq_key_is_a_fallback_for_the_llm_key() {
        let s = settings(&[("GROQ_API_KEY", "gsk_a")]).unwrap();
        assert_eq!(s.llm_api_key.as_deref(), Some("gsk_a"));
        let s = settings(&[("GROQ_API_KEY", "gsk_a"), ("WEBGROUND_LLM_API_KEY", "k_b")]).unwrap();
        assert_eq!(s.llm_api_key.as_deref(), Some("k_b"));
        let s = settings(&[("WEBGROUND_LLM_API_KEY", "   ")]).unwrap();
        assert!(s.llm_api_key.is_none());
    }

    #[test]
    fn malformed_values_are_not_configured() {
        for (k, v) in [
            ("WEBGROUND_CACHE_TTL_S", "a week"),
            ("WEBGROUND_CACHE_TTL_S", "-1"),
            ("WEBGROUND_FETCH_MAX_BYTES", "5MB"),
            ("WEBGROUND_LLM_TEMPERATURE", "warm"),
            ("WEBGROUND_CACHE", "redis"),
        ] {
            let err = settings(&[(k, v)]).unwrap_err();
            assert!(matches!(err, Error::NotConfigured(ref m) if m.contains(k)), "{k}: {err}");
        }
    }

    #[test]
    fn upstash_without_credentials_is_not_configured() {
        let s = Settings {
            cache: CacheKind::Upstash,
            ..Settings::default()
        };
        assert!(matches!(s.build_cache_backend(), Err(Error::NotConfigured(_))));
    }

    #[test]
    fn upstash_backend_comes_from_settings() {
        let s = settings(&[
            ("WEBGROUND_CACHE", "upstash"),
            ("UPSTASH_REDIS_REST_URL", "https://eu1-example.upstash.io"),
            ("UPSTASH_REDIS_REST_TOKEN", "tok"),
        ])
        .unwrap();
        assert!(s.summary().upstash_configured);
        assert_eq!(s.build_cache_backend().unwrap().name(), "upstash");
    }

    #[test]
    fn summary_never_contains_secrets() {
        let s = Settings {
            llm_api_key: Some("gsk_secret".to_string()),
            upstash_token: Some("tok_secret".to_string()),
            ..Settings::default()
        };
        let v = serde_json::to_string(&s.summary()).unwrap();
        assert!(!v.contains("secret"));
        assert!(v.contains("\"llm_api_key_present\":true"));
    }

    #[tokio::test]
    async fn memory_backed_service_builds_without_network() {
        let s = Settings {
            cache: CacheKind::Memory,
            render_disabled: true,
            ..Settings::default()
        };
        let svc = s.build_service().unwrap();
        assert_eq!(svc.acquirer().tier_count(), 2);
        assert_eq!(svc.acquirer().cache().backend_name(), "memory");
        assert_eq!(svc.answerer().model_name(), "openai_compat");
    }
}
