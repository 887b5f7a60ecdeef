use std::ops::ControlFlow;
use std::sync::Arc;
use webground_core::{CompletionRequest, ExtractedContent, LanguageModel, Result};

/// Query used when the message was nothing but a URL.
pub const DEFAULT_QUERY: &str = "Summarize this content";

/// Build the grounded prompt: page title, URL and body text, then the user's question and
/// the citation instruction. Body text is cut to `max_context_chars` chars.
pub fn grounded_prompt(query: &str, content: &ExtractedContent, max_context_chars: usize) -> String {
    let query = match query.trim() {
        "" => DEFAULT_QUERY,
        q => q,
    };
    let body: String = content.main_content.chars().take(max_context_chars).collect();
    let url = content.url.trim();
    let url_line = if url.is_empty() {
        String::new()
    } else {
        format!("URL: {url}\n")
    };
    let cite = if url.is_empty() { "provided content" } else { url };

    format!(
        "Based on the following web content, answer the user's question.\n\
         Always cite specific information from the source.\n\
         \n\
         WEB CONTENT:\n\
         Title: {title}\n\
         {url_line}\
         Content: {body}\n\
         \n\
         USER QUESTION: {query}\n\
         \n\
         Provide your answer with citations like [Source: {cite}]\n",
        title = content.title,
    )
}

/// Grounded and plain answering on top of one language model.
#[derive(Clone)]
pub struct Answerer {
    model: Arc<dyn LanguageModel>,
    model_id: Option<String>,
    temperature: Option<f64>,
    max_context_chars: usize,
}

impl Answerer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            model_id: None,
            temperature: None,
            max_context_chars: webground_core::MAX_MAIN_CONTENT_CHARS,
        }
    }

    /// Per-request model override; `None` uses the client's default.
    pub fn with_model_id(self, model_id: Option<String>) -> Self {
        Self { model_id, ..self }
    }

    pub fn with_temperature(self, temperature: Option<f64>) -> Self {
        Self {
            temperature,
            ..self
        }
    }

    pub fn with_max_context_chars(self, max_context_chars: usize) -> Self {
        Self {
            max_context_chars,
            ..self
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest {
            prompt,
            model: self.model_id.clone(),
            temperature: self.temperature,
        }
    }

    pub async fn answer_grounded(&self, query: &str, content: &ExtractedContent) -> Result<String> {
        let req = self.request(grounded_prompt(query, content, self.max_context_chars));
        self.model.complete(&req).await
    }

    /// The message goes to the model unmodified.
    pub async fn answer_plain(&self, message: &str) -> Result<String> {
        self.model.complete(&self.request(message.to_string())).await
    }

    pub async fn stream_grounded(
        &self,
        query: &str,
        content: &ExtractedContent,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<()> {
        let req = self.request(grounded_prompt(query, content, self.max_context_chars));
        self.model.complete_stream(&req, on_fragment).await
    }

    pub async fn stream_plain(
        &self,
        message: &str,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) -> ControlFlow<()> + Send),
    ) -> Result<()> {
        self.model
            .complete_stream(&self.request(message.to_string()), on_fragment)
            .await
    }
}
