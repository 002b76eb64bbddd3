use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core trait for completion providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier requests are sent to
    fn model(&self) -> &str;

    /// Generate a completion for a system prompt + user content pair
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM endpoint rejected credentials ({status})")]
    Unauthorized { status: u16 },

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed LLM response: {0}")]
    Malformed(String),

    #[error("LLM returned empty content")]
    Empty,
}

impl LlmError {
    /// Errors that no amount of per-article isolation can work around
    pub fn is_credential_error(&self) -> bool {
        matches!(self, LlmError::Unauthorized { .. })
    }
}

pub mod remote;

/// Strip a surrounding ``` fence (with optional language tag) that models like to add.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, if any
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Turn a configured base URL into the chat completions endpoint.
///
/// Accepts either the full endpoint or an OpenAI-compatible root such as
/// `https://generativelanguage.googleapis.com/v1beta/openai/`.
pub fn completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{}/chat/completions", base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_is_stripped() {
        assert_eq!(strip_code_fence("```markdown\n## AI\n- x\n```"), "## AI\n- x");
        assert_eq!(strip_code_fence("```\nplain\n```"), "plain");
        assert_eq!(strip_code_fence("  no fence  "), "no fence");
    }

    #[test]
    fn completions_url_variants() {
        assert_eq!(
            completions_url("https://generativelanguage.googleapis.com/v1beta/openai/"),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
        assert_eq!(
            completions_url("http://localhost:11434/v1/chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(completions_url("http://127.0.0.1:1234"), "http://127.0.0.1:1234/chat/completions");
    }

    #[test]
    fn credential_errors() {
        assert!(LlmError::Unauthorized { status: 401 }.is_credential_error());
        assert!(!LlmError::Empty.is_credential_error());
    }
}
