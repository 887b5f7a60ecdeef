use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::ControlFlow;

pub mod input;

pub use input::{detect_input, InputDetection};

/// Hard cap on `ExtractedContent::main_content`, in chars.
pub const MAX_MAIN_CONTENT_CHARS: usize = 10_000;
/// Paragraphs kept per record (document order).
pub const MAX_PARAGRAPHS: usize = 20;
/// Paragraphs at or below this many chars are dropped.
pub const MIN_PARAGRAPH_CHARS: usize = 30;
/// A record is usable only when `main_content` is strictly longer than this.
pub const MIN_VALID_CONTENT_CHARS: usize = 100;
/// Title used when neither `<title>` nor a first heading is present.
pub const UNTITLED: &str = "Untitled";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("acquisition failed in {tier} tier: {source}")]
    Acquisition {
        tier: ExtractionMethod,
        #[source]
        source: Box<Error>,
    },
    #[error("cache error: {0}")]
    Cache(String),
    #[error("llm failed: {0}")]
    Model(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which stage a terminal error belongs to, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Bad request shape (client error).
    InvalidInput,
    /// The page could not be read.
    ScrapeFailed,
    /// Anything else, including model failures.
    GenericFailure,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::InvalidInput => "invalid-input",
            FailureClass::ScrapeFailed => "scrape-failed",
            FailureClass::GenericFailure => "generic-failure",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            FailureClass::InvalidInput => 400,
            FailureClass::ScrapeFailed | FailureClass::GenericFailure => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, FailureClass::InvalidInput)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::InvalidInput(_) => FailureClass::InvalidInput,
            Error::InvalidUrl(_)
            | Error::Fetch(_)
            | Error::Render(_)
            | Error::Acquisition { .. } => FailureClass::ScrapeFailed,
            Error::Cache(_) | Error::Model(_) | Error::NotConfigured(_) => {
                FailureClass::GenericFailure
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Plain HTTP GET + static DOM parse.
    Static,
    /// Headless browser, DOM read after scripts ran.
    Rendered,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Static => "static",
            ExtractionMethod::Rendered => "rendered",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one acquisition attempt.
///
/// Records are built once per tier and never edited afterwards; the `with_*` helpers consume
/// the record and return a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub title: String,
    /// Whitespace-collapsed body text, at most [`MAX_MAIN_CONTENT_CHARS`] chars.
    pub main_content: String,
    #[serde(default)]
    pub paragraphs: Vec<String>,
    pub url: String,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    /// Epoch millis; only set on records that went through the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<u64>,
}

impl ExtractedContent {
    /// Build a record from already-cleaned parts, applying the size bounds.
    pub fn new(
        title: impl Into<String>,
        main_content: &str,
        paragraphs: Vec<String>,
        url: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let title = if title.trim().is_empty() {
            UNTITLED.to_string()
        } else {
            title.trim().to_string()
        };
        let main_content = truncate_chars(main_content, MAX_MAIN_CONTENT_CHARS);
        let word_count = main_content.split_whitespace().count();
        let paragraphs = paragraphs.into_iter().take(MAX_PARAGRAPHS).collect();
        Self {
            title,
            main_content,
            paragraphs,
            url: url.into(),
            word_count,
            extraction_method: None,
            cached_at: None,
        }
    }

    pub fn with_method(self, method: ExtractionMethod) -> Self {
        Self {
            extraction_method: Some(method),
            ..self
        }
    }

    pub fn with_url(self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self
        }
    }

    pub fn with_cached_at(self, epoch_ms: u64) -> Self {
        Self {
            cached_at: Some(epoch_ms),
            ..self
        }
    }

    pub fn main_content_chars(&self) -> usize {
        self.main_content.chars().count()
    }
}

/// The content validator: is this extraction good enough to ground an answer on?
///
/// True iff `main_content` is longer than [`MIN_VALID_CONTENT_CHARS`] chars (exclusive).
pub fn is_content_valid(content: &ExtractedContent) -> bool {
    content.main_content.chars().count() > MIN_VALID_CONTENT_CHARS
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte, _)) => s[..byte].to_string(),
        None => s.to_string(),
    }
}

/// One extraction tier (`extract(url) -> ExtractedContent`, fallible).
#[async_trait::async_trait]
pub trait ContentExtractor: Send + Sync {
    fn method(&self) -> ExtractionMethod;
    async fn extract(&self, url: &url::Url) -> Result<ExtractedContent>;
}

/// Key/value store with per-entry TTL. Every operation may fail; callers decide the policy.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_s: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Overrides the client's default model.
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            temperature: None,
        }
    }
}

/// Stateless language-model collaborator. No context survives between calls.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, req: &CompletionRequest) -> Result<String>;

    /// Deliver the response as ordered fragments, each as soon as it is produced.
    ///
    /// Returning `ControlFlow::Break` from the consumer stops delivery and releases the
    /// underlying connection; the call then returns `Ok(())`.
    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn content(main: &str) -> ExtractedContent {
        ExtractedContent::new("t", main, Vec::new(), "https://example.com/")
    }

    #[test]
    fn validator_boundary_is_exclusive() {
        assert!(!is_content_valid(&content("")));
        assert!(!is_content_valid(&content(&"x".repeat(100))));
        assert!(is_content_valid(&content(&"x".repeat(101))));
    }

    #[test]
    fn validator_counts_chars_not_bytes() {
        // 60 two-byte chars: 120 bytes but only 60 chars.
        assert!(!is_content_valid(&content(&"é".repeat(60))));
    }

    #[test]
    fn new_applies_bounds_and_defaults() {
        let paras = (0..30).map(|i| format!("paragraph {i}")).collect();
        let c = ExtractedContent::new("  ", &"w ".repeat(8_000), paras, "https://x/");
        assert_eq!(c.title, UNTITLED);
        assert_eq!(c.main_content_chars(), MAX_MAIN_CONTENT_CHARS);
        assert_eq!(c.paragraphs.len(), MAX_PARAGRAPHS);
        assert_eq!(c.word_count, 5_000);
        assert!(c.extraction_method.is_none());
        assert!(c.cached_at.is_none());
    }

    #[test]
    fn with_method_returns_tagged_copy() {
        let c = content(&"x".repeat(200)).with_method(ExtractionMethod::Rendered);
        assert_eq!(c.extraction_method, Some(ExtractionMethod::Rendered));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["extraction_method"], "rendered");
    }

    #[test]
    fn failure_classes_separate_scrape_from_model_errors() {
        let acq = Error::Acquisition {
            tier: ExtractionMethod::Rendered,
            source: Box::new(Error::Render("timeout".to_string())),
        };
        assert_eq!(acq.failure_class(), FailureClass::ScrapeFailed);
        assert_eq!(
            Error::InvalidUrl("x".into()).failure_class(),
            FailureClass::ScrapeFailed
        );
        assert_eq!(
            Error::Model("401".into()).failure_class(),
            FailureClass::GenericFailure
        );
        let bad = Error::InvalidInput("missing message".into()).failure_class();
        assert!(bad.is_client_error());
        assert_eq!(bad.http_status(), 400);
        assert!(acq.to_string().contains("rendered tier"));
    }

    proptest! {
        #[test]
        fn validator_matches_char_length(s in ".{0,300}") {
            let c = content(&s);
            prop_assert_eq!(is_content_valid(&c), c.main_content.chars().count() > 100);
        }
    }
}
