use anyhow::Result;

/// Core trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
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
#[derive(Debug, Clone, Default)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod remote;
pub mod summarizer;

/// Strip a surrounding markdown code fence (```html ... ```) that models like to add.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag on the opening fence line
    let body = match rest.find('\n') {
        Some(idx) if !rest[..idx].contains(' ') => &rest[idx + 1..],
        _ => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_language_fence() {
        assert_eq!(strip_code_fence("```html\n<p>Hi</p>\n```"), "<p>Hi</p>");
        assert_eq!(strip_code_fence("  ```\nplain\n```  "), "plain");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        assert_eq!(strip_code_fence("<h2>News</h2>"), "<h2>News</h2>");
    }

    #[test]
    fn tolerates_missing_closing_fence() {
        assert_eq!(strip_code_fence("```html\n<p>cut off"), "<p>cut off");
    }
}
