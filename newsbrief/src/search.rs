use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::model::SearchResult;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Web search for a topic query. Results come back in provider relevance order.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

/// How far back the news search looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePeriod {
    Day,
    Week,
    Month,
}

impl TimePeriod {
    /// Unknown values fall back to a week, the digest cadence.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "day" => TimePeriod::Day,
            "month" => TimePeriod::Month,
            _ => TimePeriod::Week,
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            TimePeriod::Day => 1,
            TimePeriod::Week => 7,
            TimePeriod::Month => 30,
        }
    }
}

/// Google News search through SerpApi.
pub struct SerpApiClient {
    api_url: String,
    api_key: String,
    country: String,
    language: String,
    time_period: TimePeriod,
    max_attempts: u32,
    retry_base: Duration,
    client: Client,
}

impl SerpApiClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("newsbrief/0.1.0")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;

        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            country: "us".to_string(),
            language: "en".to_string(),
            time_period: TimePeriod::Week,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            client,
        })
    }

    pub fn with_locale(mut self, country: impl Into<String>, language: impl Into<String>) -> Self {
        self.country = country.into();
        self.language = language.into();
        self
    }

    pub fn with_time_period(mut self, period: TimePeriod) -> Self {
        self.time_period = period;
        self
    }

    /// `max_attempts` includes the first try; backoff doubles from `base` (1s, 2s, 4s...).
    pub fn with_retry(mut self, max_attempts: u32, base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_base = base;
        self
    }

    /// Sleep before `attempt` (2-based), capped at a minute.
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
            .min(MAX_BACKOFF)
    }

    fn date_window(&self, today: NaiveDate) -> String {
        let start = today - ChronoDuration::days(self.time_period.days());
        format!(
            "cdr:1,cd_min:{},cd_max:{}",
            start.format("%m/%d/%Y"),
            today.format("%m/%d/%Y")
        )
    }

    async fn fetch_once(&self, query: &str, max_results: usize) -> std::result::Result<SerpResponse, Attempt> {
        let num = max_results.to_string();
        let tbs = self.date_window(Utc::now().date_naive());
        let params = [
            ("engine", "google"),
            ("tbm", "nws"),
            ("q", query),
            ("num", num.as_str()),
            ("gl", self.country.as_str()),
            ("hl", self.language.as_str()),
            ("tbs", tbs.as_str()),
            ("api_key", self.api_key.as_str()),
        ];

        let response = match self.client.get(&self.api_url).query(&params).send().await {
            Ok(r) => r,
            Err(e) => return Err(Attempt::Retry(format!("network error: {}", e))),
        };

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Retry(format!("provider returned {}", status)));
        }
        if !status.is_success() {
            // 4xx other than 429: bad key or bad request, retrying will not help
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(format!("provider returned {}: {}", status, body)));
        }

        response
            .json::<SerpResponse>()
            .await
            .map_err(|e| Attempt::Fatal(format!("malformed search response: {}", e)))
    }
}

enum Attempt {
    Retry(String),
    Fatal(String),
}

#[async_trait]
impl SearchProvider for SerpApiClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = self.backoff(attempt);
                info!(query, attempt, max = self.max_attempts, ?backoff, "retrying search");
                tokio::time::sleep(backoff).await;
            }

            match self.fetch_once(query, max_results).await {
                Ok(body) => {
                    if let Some(err) = body.error.filter(|_| body.news_results.is_empty()) {
                        // SerpApi reports "no results" as an error string with a 200
                        if err.contains("hasn't returned any results") {
                            debug!(query, "search returned no results");
                            return Ok(Vec::new());
                        }
                        return Err(PipelineError::SearchUnavailable(err));
                    }

                    let results: Vec<SearchResult> = body
                        .news_results
                        .into_iter()
                        .filter(|r| !r.link.is_empty())
                        .take(max_results)
                        .map(SerpNewsResult::into_result)
                        .collect();
                    info!(query, count = results.len(), "search complete");
                    return Ok(results);
                }
                Err(Attempt::Fatal(e)) => return Err(PipelineError::SearchUnavailable(e)),
                Err(Attempt::Retry(e)) => {
                    warn!(query, attempt, error = %e, "search attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(PipelineError::SearchUnavailable(
            last_error.unwrap_or_else(|| "unknown error after retries".to_string()),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    news_results: Vec<SerpNewsResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpNewsResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    date: Option<String>,
    // Older responses use a plain string, newer ones an object with a name
    #[serde(default)]
    source: Option<serde_json::Value>,
}

impl SerpNewsResult {
    fn into_result(self) -> SearchResult {
        let source = match self.source {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Object(map)) => map
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        };

        SearchResult {
            url: self.link,
            title: self.title,
            snippet: self.snippet,
            source,
            date: self.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_period_parsing() {
        assert_eq!(TimePeriod::parse("day"), TimePeriod::Day);
        assert_eq!(TimePeriod::parse("MONTH"), TimePeriod::Month);
        assert_eq!(TimePeriod::parse("fortnight"), TimePeriod::Week);
        assert_eq!(TimePeriod::Week.days(), 7);
    }

    #[test]
    fn date_window_spans_period() {
        let client = SerpApiClient::new("http://localhost/search", "k", 5)
            .expect("client")
            .with_time_period(TimePeriod::Week);
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).expect("date");
        assert_eq!(client.date_window(today), "cdr:1,cd_min:03/03/2024,cd_max:03/10/2024");
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let client = SerpApiClient::new("http://localhost/search", "k", 5)
            .expect("client")
            .with_retry(64, Duration::from_secs(1));
        assert_eq!(client.backoff(2), Duration::from_secs(1));
        assert_eq!(client.backoff(4), Duration::from_secs(4));
        assert_eq!(client.backoff(64), MAX_BACKOFF);
    }

    #[test]
    fn source_accepts_string_or_object() {
        let raw = r#"{"news_results": [
            {"title": "A", "link": "https://a.example/1", "snippet": "s", "source": "Wire"},
            {"title": "B", "link": "https://b.example/2", "snippet": "s", "source": {"name": "Daily", "icon": "x"}}
        ]}"#;
        let parsed: SerpResponse = serde_json::from_str(raw).expect("parse");
        let results: Vec<SearchResult> = parsed
            .news_results
            .into_iter()
            .map(SerpNewsResult::into_result)
            .collect();
        assert_eq!(results[0].source.as_deref(), Some("Wire"));
        assert_eq!(results[1].source.as_deref(), Some("Daily"));
    }
}
