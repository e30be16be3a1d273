//! Run report: the pipeline's only output artifact.
//!
//! Serialized to JSON for whatever decides whether an operator should be alerted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent { retry_count: u32 },
    Failed { attempts: u32, error: String },
    SkippedQuota,
    SkippedInactive,
    SkippedDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subscriber_id: String,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

/// Why a topic produced no digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TopicFailure {
    SearchUnavailable(String),
    NoSearchResults,
    NoArticlesExtracted,
    SummarizationFailed(String),
    SubscriberStoreUnavailable(String),
    TimedOut(String),
    Panicked(String),
}

impl fmt::Display for TopicFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicFailure::SearchUnavailable(_) => write!(f, "search unavailable"),
            TopicFailure::NoSearchResults => write!(f, "no search results"),
            TopicFailure::NoArticlesExtracted => write!(f, "no articles extracted"),
            TopicFailure::SummarizationFailed(_) => write!(f, "summarization failed"),
            TopicFailure::SubscriberStoreUnavailable(_) => write!(f, "subscriber store unavailable"),
            TopicFailure::TimedOut(stage) => write!(f, "{} timed out", stage),
            TopicFailure::Panicked(_) => write!(f, "internal error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TopicStatus {
    /// A digest was generated and dispatch was attempted (individual sends may still fail).
    Delivered,
    /// Nothing to do, e.g. no active subscribers.
    Skipped { reason: String },
    Failed { failure: TopicFailure },
}

impl fmt::Display for TopicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicStatus::Delivered => write!(f, "delivered"),
            TopicStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            TopicStatus::Failed { failure } => write!(f, "failed: {}", failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicReport {
    pub topic_id: String,
    pub display_name: String,
    pub status: TopicStatus,
    pub articles_fetched: usize,
    pub articles_failed: usize,
    pub emails_sent: usize,
    pub emails_failed: usize,
    pub emails_skipped_quota: usize,
    pub emails_skipped_inactive: usize,
    pub emails_skipped_duplicate: usize,
    pub cited_urls: Vec<String>,
    pub deliveries: Vec<DeliveryRecord>,
    pub errors: Vec<String>,
}

impl TopicReport {
    pub fn new(topic_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            display_name: display_name.into(),
            status: TopicStatus::Delivered,
            articles_fetched: 0,
            articles_failed: 0,
            emails_sent: 0,
            emails_failed: 0,
            emails_skipped_quota: 0,
            emails_skipped_inactive: 0,
            emails_skipped_duplicate: 0,
            cited_urls: Vec::new(),
            deliveries: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn fail(&mut self, failure: TopicFailure) {
        // a failed topic always explains itself in `errors`
        let detail = match &failure {
            TopicFailure::SearchUnavailable(d)
            | TopicFailure::SummarizationFailed(d)
            | TopicFailure::SubscriberStoreUnavailable(d)
            | TopicFailure::Panicked(d) => d.clone(),
            other => other.to_string(),
        };
        self.errors.push(detail);
        self.status = TopicStatus::Failed { failure };
    }

    pub fn record_delivery(&mut self, record: DeliveryRecord) {
        match &record.outcome {
            DeliveryOutcome::Sent { .. } => self.emails_sent += 1,
            DeliveryOutcome::Failed { error, .. } => {
                self.emails_failed += 1;
                self.errors
                    .push(format!("delivery to {} failed: {}", record.subscriber_id, error));
            }
            DeliveryOutcome::SkippedQuota => self.emails_skipped_quota += 1,
            DeliveryOutcome::SkippedInactive => self.emails_skipped_inactive += 1,
            DeliveryOutcome::SkippedDuplicate => self.emails_skipped_duplicate += 1,
        }
        self.deliveries.push(record);
    }

    pub fn delivery_for(&self, subscriber_id: &str) -> Option<&DeliveryOutcome> {
        self.deliveries
            .iter()
            .find(|d| d.subscriber_id == subscriber_id)
            .map(|d| &d.outcome)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TopicStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub topics: BTreeMap<String, TopicReport>,
    /// Run-scope problems, e.g. the topic registry could not be read.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub topics: usize,
    pub topics_failed: usize,
    pub articles_fetched: usize,
    pub articles_failed: usize,
    pub emails_sent: usize,
    pub emails_failed: usize,
    pub emails_skipped: usize,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            topics: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn insert(&mut self, report: TopicReport) {
        self.topics.insert(report.topic_id.clone(), report);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn totals(&self) -> RunTotals {
        self.topics.values().fold(RunTotals::default(), |mut t, r| {
            t.topics += 1;
            t.topics_failed += usize::from(r.is_failed());
            t.articles_fetched += r.articles_fetched;
            t.articles_failed += r.articles_failed;
            t.emails_sent += r.emails_sent;
            t.emails_failed += r.emails_failed;
            t.emails_skipped +=
                r.emails_skipped_quota + r.emails_skipped_inactive + r.emails_skipped_duplicate;
            t
        })
    }

    /// True when anything an operator might want to look at went wrong.
    pub fn needs_attention(&self) -> bool {
        !self.errors.is_empty() || self.topics.values().any(|r| r.is_failed() || r.emails_failed > 0)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_status_renders_reason() {
        let mut report = TopicReport::new("ml", "ML");
        report.fail(TopicFailure::SearchUnavailable("503 Service Unavailable".into()));
        assert_eq!(report.status.to_string(), "failed: search unavailable");
        assert_eq!(report.errors, vec!["503 Service Unavailable".to_string()]);
    }

    #[test]
    fn failures_without_detail_still_leave_an_error() {
        let mut report = TopicReport::new("robotics", "Robotics");
        report.fail(TopicFailure::TimedOut("summarization".into()));
        assert_eq!(report.status.to_string(), "failed: summarization timed out");
        assert_eq!(report.errors, vec!["summarization timed out".to_string()]);

        let mut report = TopicReport::new("ml", "ML");
        report.fail(TopicFailure::NoArticlesExtracted);
        assert_eq!(report.errors, vec!["no articles extracted".to_string()]);
    }

    #[test]
    fn deliveries_update_counters() {
        let mut report = TopicReport::new("t", "T");
        report.record_delivery(DeliveryRecord {
            subscriber_id: "a".into(),
            outcome: DeliveryOutcome::Sent { retry_count: 2 },
        });
        report.record_delivery(DeliveryRecord {
            subscriber_id: "b".into(),
            outcome: DeliveryOutcome::SkippedQuota,
        });
        report.record_delivery(DeliveryRecord {
            subscriber_id: "c".into(),
            outcome: DeliveryOutcome::Failed {
                attempts: 4,
                error: "throttled".into(),
            },
        });
        assert_eq!(report.emails_sent, 1);
        assert_eq!(report.emails_skipped_quota, 1);
        assert_eq!(report.emails_failed, 1);
        assert_eq!(
            report.delivery_for("a"),
            Some(&DeliveryOutcome::Sent { retry_count: 2 })
        );
    }

    #[test]
    fn totals_and_json_shape() {
        let mut run = RunReport::new();
        let mut ok = TopicReport::new("robotics", "Robotics");
        ok.articles_fetched = 3;
        ok.articles_failed = 1;
        ok.record_delivery(DeliveryRecord {
            subscriber_id: "s1".into(),
            outcome: DeliveryOutcome::Sent { retry_count: 0 },
        });
        let mut bad = TopicReport::new("ml", "ML");
        bad.fail(TopicFailure::NoSearchResults);
        run.insert(ok);
        run.insert(bad);
        run.finish();

        let totals = run.totals();
        assert_eq!(totals.topics, 2);
        assert_eq!(totals.topics_failed, 1);
        assert_eq!(totals.articles_fetched, 3);
        assert_eq!(totals.emails_sent, 1);
        assert!(run.needs_attention());

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["topics"]["robotics"]["deliveries"][0]["outcome"], "sent");
        assert_eq!(json["topics"]["robotics"]["deliveries"][0]["retry_count"], 0);
        assert_eq!(json["topics"]["ml"]["status"]["state"], "failed");
        assert_eq!(json["topics"]["ml"]["status"]["failure"]["kind"], "no_search_results");
    }
}
