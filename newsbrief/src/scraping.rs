use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::model::ExtractedArticle;

/// Fetches a result URL and pulls out readable article text.
///
/// Never returns an error: failures are reported through the article's status so that one
/// bad URL cannot take its siblings down with it.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> ExtractedArticle;
}

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Containers tried in order when readability comes back short.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    ".article-content",
    ".post-content",
    ".entry-content",
    "#content",
];

const BOILERPLATE_PREFIXES: &[&str] = &["advertisement", "sponsored", "related"];

pub struct HttpExtractor {
    client: Client,
    timeout: Duration,
    min_chars: usize,
    max_response_bytes: u64,
}

impl HttpExtractor {
    pub fn new(timeout_secs: u64, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.unwrap_or(BROWSER_UA))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;

        Ok(Self {
            client,
            timeout,
            min_chars: 200,
            max_response_bytes: 2 * 1024 * 1024,
        })
    }

    pub fn with_limits(mut self, min_chars: usize, max_response_bytes: u64) -> Self {
        self.min_chars = min_chars;
        self.max_response_bytes = max_response_bytes;
        self
    }

    async fn fetch(&self, url: &Url) -> Result<String, String> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("timed out after {}s", self.timeout.as_secs())
                } else {
                    format!("fetch failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_response_bytes {
                return Err(format!("response too large ({} bytes)", len));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("failed to read response body: {}", e))?;
        if bytes.len() as u64 > self.max_response_bytes {
            return Err(format!("response too large ({} bytes)", bytes.len()));
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl ContentExtractor for HttpExtractor {
    async fn extract(&self, url: &str) -> ExtractedArticle {
        let parsed = match parse_article_url(url) {
            Some(u) => u,
            None => {
                warn!(url, "scraping: invalid article URL");
                return ExtractedArticle::failed(url, "invalid url");
            }
        };

        // reqwest enforces the timeout too; this also bounds DNS and body streaming
        let fetched = match tokio::time::timeout(self.timeout, self.fetch(&parsed)).await {
            Ok(res) => res,
            Err(_) => Err(format!("timed out after {}s", self.timeout.as_secs())),
        };

        match fetched {
            Ok(html) => {
                let article = extract_from_html(&parsed, &html, self.min_chars);
                info!(url, status = ?article.status, chars = article.text.len(), "scraping: extracted");
                article
            }
            Err(reason) => {
                warn!(url, %reason, "scraping: fetch failed");
                ExtractedArticle::failed(url, reason)
            }
        }
    }
}

fn parse_article_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    (web && url.host_str().is_some()).then_some(url)
}

/// Readability first, the selector cascade when readability yields too little.
pub fn extract_from_html(url: &Url, html: &str, min_chars: usize) -> ExtractedArticle {
    let (readable, readable_title) = readability_text(url, html);
    let document = Html::parse_document(html);

    let mut text = clean_text(&readable);
    if text.chars().count() < min_chars {
        let fallback = clean_text(&selector_text(&document));
        if fallback.len() > text.len() {
            debug!(url = %url, "scraping: using selector fallback");
            text = fallback;
        }
    }

    let title = extract_title(&document)
        .or(readable_title)
        .unwrap_or_default();

    if text.trim().is_empty() || text.chars().count() < min_chars {
        return ExtractedArticle::empty(url.as_str(), title);
    }
    ExtractedArticle::ok(url.as_str(), title, text)
}

fn readability_text(url: &Url, html: &str) -> (String, Option<String>) {
    let mut reader = Cursor::new(html.as_bytes());
    match readability::extractor::extract(&mut reader, url) {
        Ok(product) => {
            let title = Some(product.title.trim().to_string()).filter(|t| !t.is_empty());
            // Markdown keeps paragraph breaks, which the model uses
            let text = match html2text::from_read(product.content.as_bytes(), 100) {
                Ok(markdown) => markdown,
                Err(e) => {
                    debug!(url = %url, error = %e, "scraping: html2text failed, using plain text");
                    product.text
                }
            };
            (text, title)
        }
        Err(e) => {
            debug!(url = %url, error = %e, "scraping: readability failed");
            (String::new(), None)
        }
    }
}

fn selector_text(document: &Html) -> String {
    let Ok(paragraphs) = Selector::parse("p") else {
        return String::new();
    };

    for expr in CONTENT_SELECTORS {
        let Ok(container_sel) = Selector::parse(expr) else {
            continue;
        };
        if let Some(container) = document.select(&container_sel).next() {
            let text = container
                .select(&paragraphs)
                .map(|p| p.text().collect::<String>())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.trim().is_empty() {
                return text;
            }
        }
    }

    document
        .select(&paragraphs)
        .map(|p| p.text().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_title(document: &Html) -> Option<String> {
    let text_of = |expr: &str| -> Option<String> {
        let sel = Selector::parse(expr).ok()?;
        let el = document.select(&sel).next()?;
        Some(el.text().collect::<String>().trim().to_string()).filter(|t| !t.is_empty())
    };
    let attr_of = |expr: &str| -> Option<String> {
        let sel = Selector::parse(expr).ok()?;
        let el = document.select(&sel).next()?;
        el.value()
            .attr("content")
            .map(|c| c.trim().to_string())
            .filter(|t| !t.is_empty())
    };

    text_of("h1")
        .or_else(|| text_of("title"))
        .or_else(|| attr_of(r#"meta[property="og:title"]"#))
        .or_else(|| attr_of(r#"meta[name="twitter:title"]"#))
}

/// Collapse whitespace per line, drop boilerplate lines and bare links.
pub fn clean_text(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            line.split_whitespace()
                .filter(|word| !is_link(word))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .filter(|line| !is_link_reference(line))
        .filter(|line| {
            let lower = line.to_lowercase();
            !BOILERPLATE_PREFIXES.iter().any(|p| lower.starts_with(p))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_link(word: &str) -> bool {
    let w = word.trim_start_matches(['(', '<', '[']);
    w.starts_with("http://") || w.starts_with("https://")
}

// html2text footnotes look like "[3]:" once the URL has been dropped
fn is_link_reference(line: &str) -> bool {
    line.starts_with('[') && line.ends_with("]:")
}
