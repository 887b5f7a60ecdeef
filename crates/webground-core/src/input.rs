//! Input classification: does a chat message carry a URL to ground on?

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static URL_TOKEN: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"https?://\S+").ok());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDetection {
    pub has_url: bool,
    /// First URL token, verbatim.
    pub url: Option<String>,
    /// The message with every URL token removed, trimmed.
    pub query: String,
}

/// Split a message into `(first url, residual query)`.
///
/// A URL token is a run of non-whitespace starting at `http://` or `https://` (case-sensitive).
/// Absence of a URL is a normal outcome, not an error.
pub fn detect_input(input: &str) -> InputDetection {
    let Some(re) = URL_TOKEN.as_ref() else {
        return InputDetection {
            has_url: false,
            url: None,
            query: input.trim().to_string(),
        };
    };
    let url = re.find(input).map(|m| m.as_str().to_string());
    let query = re.replace_all(input, "").trim().to_string();
    InputDetection {
        has_url: url.is_some(),
        url,
        query,
    }
}
