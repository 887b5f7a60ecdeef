use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Duration;
use webground_core::{CompletionRequest, Error, LanguageModel, Result};

use crate::{next_chunk_within, take_lines, SYSTEM_PROMPT};

/// Local Ollama server (`/api/chat`). No credentials.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OllamaClient {
    pub const DEFAULT_BASE_URL: &'static str = "http://127.0.0.1:11434";

    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
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

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, req: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: req.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: req.prompt.clone(),
                },
            ],
            stream,
            options: ChatOptions {
                temperature: req.temperature.unwrap_or(self.temperature),
            },
        };

        let request = self
            .client
            .post(self.endpoint_chat())
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
                    "ollama: no response within {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::Model(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Model(format!("ollama chat HTTP {status}")));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let resp = self.send(req, false).await?;
        let parsed: ChatResponse = resp.json().await.map_err(|e| Error::Model(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(Error::Model(err));
        }
        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }

    async fn complete_stream(
        &self,
        req: &CompletionRequest,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<()> {
        let resp = self.send(req, true).await?;
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = next_chunk_within(&mut stream, self.timeout, "ollama").await? {
            buf.extend_from_slice(&chunk);
            // One JSON object per line.
            for line in take_lines(&mut buf) {
                if line.trim().is_empty() {
                    continue;
                }
                let part: ChatResponse = serde_json::from_str(&line)
                    .map_err(|e| Error::Model(format!("bad stream line: {e}")))?;
                if let Some(err) = part.error {
                    return Err(Error::Model(err));
                }
                let fragment = part.message.map(|m| m.content).unwrap_or_default();
                if !fragment.is_empty() && on_fragment(&fragment).is_break() {
                    tracing::debug!("stream consumer stopped early");
                    return Ok(());
                }
                if part.done {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Clone, Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn ndjson(parts: &[&str]) -> String {
        let mut out = String::new();
        for p in parts {
            out.push_str(
                &serde_json::json!({ "message": { "role": "assistant", "content": p }, "done": false })
                    .to_string(),
            );
            out.push('\n');
        }
        out.push_str(r#"{"message":{"role":"assistant","content":""},"done":true}"#);
        out.push('\n');
        // Anything after `done` is ignored.
        out.push_str(r#"{"message":{"role":"assistant","content":"ignored"},"done":false}"#);
        out.push('\n');
        out
    }

    #[tokio::test]
    async fn complete_reads_message_content() {
        let app = Router::new().route(
            "/api/chat",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["stream"], false);
                assert_eq!(body["messages"][0]["content"], SYSTEM_PROMPT);
                let echo = body["messages"][1]["content"].as_str().unwrap_or("").to_string();
                Json(serde_json::json!({
                    "message": { "role": "assistant", "content": format!("echo: {echo}") },
                    "done": true
                }))
            }),
        );
        let addr = serve(app).await;
        let llm = OllamaClient::new(reqwest::Client::new(), format!("http://{addr}"), "m");
        assert_eq!(
            llm.complete(&CompletionRequest::new("hi")).await.unwrap(),
            "echo: hi"
        );
    }

    #[tokio::test]
    async fn stream_reads_ndjson_until_done() {
        let app = Router::new().route("/api/chat", post(|| async { ndjson(&["a", "b", "c"]) }));
        let addr = serve(app).await;
        let llm = OllamaClient::new(reqwest::Client::new(), format!("http://{addr}"), "m");

        let mut got = String::new();
        llm.complete_stream(&CompletionRequest::new("x"), &mut |f| {
            got.push_str(f);
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
        assert_eq!(got, "abc");
    }

    #[tokio::test]
    async fn missing_model_is_a_model_error() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async {
                (
                    axum::http::StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "model 'm' not found" })),
                )
            }),
        );
        let addr = serve(app).await;
        let llm = OllamaClient::new(reqwest::Client::new(), format!("http://{addr}"), "m");
        let err = llm.complete(&CompletionRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, Error::Model(ref m) if m.contains("404")), "{err}");
    }
}
