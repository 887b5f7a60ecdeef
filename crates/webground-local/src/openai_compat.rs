use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Duration;
use webground_core::{CompletionRequest, Error, LanguageModel, Result};

use crate::{next_chunk_within, take_lines, SYSTEM_PROMPT};

/// Any `/v1/chat/completions` endpoint (Groq by default).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.groq.com/openai";
    pub const DEFAULT_MODEL: &'static str = "llama-3.1-8b-instant";

    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            temperature: 0.7,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_temperature(self, temperature: f64) -> Self {
        Self {
            temperature,
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, req: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let Some(key) = &self.api_key else {
            return Err(Error::NotConfigured(
                "missing WEBGROUND_LLM_API_KEY (or GROQ_API_KEY)".to_string(),
            ));
        };
        let body = ChatCompletionsRequest {
            model: req.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: req.prompt.clone(),
                },
            ],
            temperature: Some(req.temperature.unwrap_or(self.temperature)),
            stream: Some(stream),
        };

        let request = self
            .client
            .post(self.endpoint_chat_completions())
            .bearer_auth(key)
            .json(&body);
        // Streams are bounded per read (see `complete_stream`), not as a whole.
        let request = if stream {
            request
        } else {
            request.timeout(self.timeout)
        };
        let resp = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                Error::Model(format!(
                    "openai_compat: no response within {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::Model(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Model(format!(
                "openai_compat chat.completions HTTP {status}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let resp = self.send(req, false).await?;
        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Model(e.to_string()))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<()> {
        let resp = self.send(req, true).await?;
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = next_chunk_within(&mut stream, self.timeout, "openai_compat").await? {
            buf.extend_from_slice(&chunk);
            for line in take_lines(&mut buf) {
                // SSE: only `data:` lines matter; blank lines and comments separate events.
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                let event: StreamChunk = serde_json::from_str(data)
                    .map_err(|e| Error::Model(format!("bad stream event: {e}")))?;
                if let Some(err) = event.error {
                    return Err(Error::Model(err.message));
                }
                let fragment = event
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .unwrap_or_default();
                if fragment.is_empty() {
                    continue;
                }
                if on_fragment(&fragment).is_break() {
                    tracing::debug!("stream consumer stopped early");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamError {
    message: String,
}
