// Digest summarizer: one synthesized summary per topic, across all extracted articles
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{strip_code_fence, LlmProvider, LlmRequest};
use crate::error::{PipelineError, Result};
use crate::model::{ExtractedArticle, Topic};

const SYSTEM_PROMPT: &str = "You are a research assistant who is working for a busy executive.";

const DIGEST_INSTRUCTIONS: &str = r#"Please provide a comprehensive summary of the following articles. Focus on the key points and main ideas.
The summary should be:
1. Clear and easy to understand
2. Include the key takeaways from the articles
3. Capture the main topic and important details
4. Written in a professional tone
5. Use emojis sparingly to make it easier to scan
6. Group similar stories together
7. Highlight any conflicting information or different perspectives
8. End with a conclusion that ties everything together

Cover every article below, not only the first one. Refer to articles by their [n] marker.
Output HTML only (<h2>, <h3>, <p>, <ul>, <li>, <strong>), no <html> or <body> wrapper, no markdown."#;

const NOTES_INSTRUCTIONS: &str = r#"Write concise research notes on the following articles: for each article, its [n] marker followed by 3-5 bullet points with the key facts, numbers and claims. Plain text only."#;

pub struct DigestSummarizer {
    provider: Arc<dyn LlmProvider>,
    max_input_chars: usize,
    max_article_chars: usize,
    max_tokens: usize,
}

impl DigestSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_input_chars: 24_000,
            max_article_chars: 6_000,
            max_tokens: 2_000,
        }
    }

    pub fn with_limits(mut self, max_input_chars: usize, max_article_chars: usize, max_tokens: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1_000);
        self.max_article_chars = max_article_chars.clamp(200, self.max_input_chars);
        self.max_tokens = max_tokens;
        self
    }

    /// Summarize the successfully extracted articles of a topic into one digest text.
    ///
    /// Articles keep their ranking order and are numbered [1], [2], ... in that order. When the
    /// combined text does not fit one model call, each chunk is reduced to notes first and the
    /// digest is synthesized from all the notes.
    pub async fn summarize(&self, topic: &Topic, articles: &[ExtractedArticle]) -> Result<String> {
        let usable: Vec<(usize, &ExtractedArticle)> = articles
            .iter()
            .filter(|a| a.is_ok() && !a.text.trim().is_empty())
            .enumerate()
            .map(|(i, a)| (i + 1, a))
            .collect();

        if usable.is_empty() {
            return Err(PipelineError::SummarizationFailed(
                "no successfully extracted articles".to_string(),
            ));
        }

        let blocks: Vec<String> = usable
            .iter()
            .map(|(n, a)| article_block(*n, a, self.max_article_chars))
            .collect();
        let chunks = pack_chunks(&blocks, self.max_input_chars);

        let material = if chunks.len() == 1 {
            chunks.into_iter().next().unwrap_or_default()
        } else {
            info!(topic = %topic.id, chunks = chunks.len(), "summarizer: input over budget, reducing in chunks");
            let mut notes = Vec::with_capacity(chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                let prompt = format!("{}\n\nArticles:\n{}", NOTES_INSTRUCTIONS, chunk);
                let part = self.complete(prompt, self.max_tokens / 2).await?;
                debug!(topic = %topic.id, chunk = i + 1, chars = part.len(), "summarizer: chunk notes ready");
                notes.push(part);
            }
            truncate_chars(&notes.join("\n\n"), self.max_input_chars)
        };

        let prompt = format!(
            "Topic: {}\n\n{}\n\nArticles:\n{}",
            topic.display_name, DIGEST_INSTRUCTIONS, material
        );
        let digest = self.complete(prompt, self.max_tokens).await?;
        info!(topic = %topic.id, articles = usable.len(), chars = digest.len(), "summarizer: digest generated");
        Ok(digest)
    }

    async fn complete(&self, prompt: String, max_tokens: usize) -> Result<String> {
        let request = LlmRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            prompt,
            max_tokens: Some(max_tokens),
            temperature: Some(0.4),
            timeout_seconds: None,
        };

        let response = self.provider.generate(request).await.map_err(|e| {
            warn!(error = %e, "summarizer: provider call failed");
            PipelineError::SummarizationFailed(e.to_string())
        })?;

        let text = strip_code_fence(&response.content);
        if text.is_empty() {
            return Err(PipelineError::SummarizationFailed(
                "model returned an empty summary".to_string(),
            ));
        }
        Ok(text)
    }
}

fn article_block(n: usize, article: &ExtractedArticle, max_chars: usize) -> String {
    let title = if article.title.is_empty() { "Untitled" } else { &article.title };
    format!(
        "[{}] Title: {}\nLink: {}\nContent: {}\n",
        n,
        title,
        article.url,
        truncate_chars(&article.text, max_chars)
    )
}

/// Greedily pack blocks into chunks of at most `budget` chars, preserving order.
/// A single oversized block becomes its own (truncated) chunk.
fn pack_chunks(blocks: &[String], budget: usize) -> Vec<String> {
    const SEPARATOR: &str = "\n---\n\n";
    let mut chunks = Vec::new();
    let mut current = String::new();

    for block in blocks {
        let extra = if current.is_empty() { 0 } else { SEPARATOR.len() };
        if !current.is_empty() && current.len() + extra + block.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(SEPARATOR);
        }
        current.push_str(&truncate_chars(block, budget));
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncate on a char boundary, marking the cut.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((idx, _)) => format!("{} [...]", &s[..idx]),
    }
}
