use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A news topic as supplied by the topic registry. Immutable for the length of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub display_name: String,
    pub search_query: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Inactive,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Inactive => "inactive",
        }
    }

    /// Anything the store does not recognise as active is treated as inactive.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("active") {
            SubscriberStatus::Active
        } else {
            SubscriberStatus::Inactive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub name: String,
    pub topic_id: String,
    pub status: SubscriberStatus,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }
}

/// One ranked hit from the search provider. Lives only for the duration of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub source: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Ok,
    Failed(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedArticle {
    pub url: String,
    pub title: String,
    pub text: String,
    pub status: ExtractionStatus,
}

impl ExtractedArticle {
    pub fn ok(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            text: text.into(),
            status: ExtractionStatus::Ok,
        }
    }

    pub fn failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            text: String::new(),
            status: ExtractionStatus::Failed(reason.into()),
        }
    }

    pub fn empty(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            text: String::new(),
            status: ExtractionStatus::Empty,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExtractionStatus::Ok
    }
}

/// A cited source in a digest, in provider ranking order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
    pub source: Option<String>,
    pub date: Option<String>,
}

/// The unit sent to every subscriber of a topic. Generated once per topic per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub topic_id: String,
    pub summary: String,
    pub citations: Vec<Citation>,
    pub generated_at: DateTime<Utc>,
}

impl Digest {
    pub fn cited_urls(&self) -> Vec<&str> {
        self.citations.iter().map(|c| c.url.as_str()).collect()
    }
}

/// Rendered email, identical for every subscriber of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
