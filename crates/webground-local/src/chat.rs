//! The inbound chat operation: classify, acquire when a URL is present, answer.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use webground_core::{detect_input, Error, ExtractionMethod, FailureClass, Result};

use crate::{Answerer, ContentAcquirer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    /// The message as received.
    pub user: String,
    pub ai_text: String,
    pub has_url: bool,
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
}

/// What a streamed reply was grounded on; the text itself went to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoute {
    pub has_url: bool,
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
}

/// Wire shape of a chat outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatEnvelope {
    Success {
        success: bool,
        user: String,
        ai: String,
        has_url: bool,
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction_method: Option<ExtractionMethod>,
        #[serde(skip_serializing_if = "Option::is_none")]
        word_count: Option<usize>,
    },
    Failure {
        success: bool,
        status: u16,
        error: FailureClass,
        message: String,
    },
}

impl ChatEnvelope {
    pub fn from_result(r: Result<ChatReply>) -> Self {
        match r {
            Ok(reply) => ChatEnvelope::Success {
                success: true,
                user: reply.user,
                ai: reply.ai_text,
                has_url: reply.has_url,
                url: reply.url,
                extraction_method: reply.extraction_method,
                word_count: reply.word_count,
            },
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn from_error(e: &Error) -> Self {
        let class = e.failure_class();
        ChatEnvelope::Failure {
            success: false,
            status: class.http_status(),
            error: class,
            message: e.to_string(),
        }
    }

    /// HTTP-equivalent status (200 on success).
    pub fn status(&self) -> u16 {
        match self {
            ChatEnvelope::Success { .. } => 200,
            ChatEnvelope::Failure { status, .. } => *status,
        }
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            ChatEnvelope::Success { .. } => None,
            ChatEnvelope::Failure { error, .. } => Some(*error),
        }
    }
}

/// One request = one independent pass through classify → acquire → answer.
#[derive(Clone)]
pub struct ChatService {
    acquirer: ContentAcquirer,
    answerer: Answerer,
}

fn require_message(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        return Err(Error::InvalidInput(
            "message is required and must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

impl ChatService {
    pub fn new(acquirer: ContentAcquirer, answerer: Answerer) -> Self {
        Self { acquirer, answerer }
    }

    pub fn acquirer(&self) -> &ContentAcquirer {
        &self.acquirer
    }

    pub fn answerer(&self) -> &Answerer {
        &self.answerer
    }

    pub async fn handle(&self, message: &str) -> Result<ChatReply> {
        require_message(message)?;
        let input = detect_input(message);

        let Some(url) = input.url else {
            tracing::info!("plain chat message");
            let ai_text = self.answerer.answer_plain(message).await?;
            return Ok(ChatReply {
                user: message.to_string(),
                ai_text,
                has_url: false,
                url: None,
                extraction_method: None,
                word_count: None,
            });
        };

        tracing::info!(url = %url, "chat message with url");
        let content = self.acquirer.acquire(&url).await?;
        tracing::info!(url = %url, tier = ?content.extraction_method, word_count = content.word_count, "grounding answer");
        let ai_text = self.answerer.answer_grounded(&input.query, &content).await?;
        Ok(ChatReply {
            user: message.to_string(),
            ai_text,
            has_url: true,
            url: Some(url),
            extraction_method: content.extraction_method,
            word_count: Some(content.word_count),
        })
    }

    /// `handle` for an untrusted JSON request body of the form `{"message": "..."}`.
    pub async fn handle_value(&self, payload: &serde_json::Value) -> Result<ChatReply> {
        let Some(message) = payload.get("message").and_then(|m| m.as_str()) else {
            return Err(Error::InvalidInput(
                "message is required and must be a string".to_string(),
            ));
        };
        self.handle(message).await
    }

    /// Like `handle`, but the answer is delivered to `on_fragment` as it is generated.
    pub async fn handle_stream(
        &self,
        message: &str,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<ChatRoute> {
        require_message(message)?;
        let input = detect_input(message);

        let Some(url) = input.url else {
            self.answerer.stream_plain(message, on_fragment).await?;
            return Ok(ChatRoute {
                has_url: false,
                url: None,
                extraction_method: None,
            });
        };

        let content = self.acquirer.acquire(&url).await?;
        self.answerer
            .stream_grounded(&input.query, &content, on_fragment)
            .await?;
        Ok(ChatRoute {
            has_url: true,
            url: Some(url),
            extraction_method: content.extraction_method,
        })
    }
}
