use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How far a failure is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// One article; excluded from summarization, the topic continues.
    Item,
    /// One subscriber; the topic's remaining deliveries continue.
    Subscriber,
    /// One topic; the run continues with the next topic.
    Topic,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("extraction failed for {url}: {reason}")]
    ExtractionFailed { url: String, reason: String },

    #[error("no readable content at {url}")]
    ExtractionEmpty { url: String },

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("email provider throttled the request")]
    DispatchThrottled { retry_after: Option<Duration> },

    #[error("email delivery failed: {0}")]
    DispatchFailed(String),

    #[error("email quota exhausted")]
    QuotaExceeded,

    #[error("store error: {0}")]
    Store(String),

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: &'static str, seconds: u64 },
}

impl PipelineError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            PipelineError::ExtractionFailed { .. } | PipelineError::ExtractionEmpty { .. } => {
                ErrorScope::Item
            }
            PipelineError::DispatchThrottled { .. } | PipelineError::DispatchFailed(_) => {
                ErrorScope::Subscriber
            }
            PipelineError::SearchUnavailable(_)
            | PipelineError::SummarizationFailed(_)
            | PipelineError::QuotaExceeded
            | PipelineError::Store(_)
            | PipelineError::Timeout { .. } => ErrorScope::Topic,
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, PipelineError::DispatchThrottled { .. })
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Store(err.to_string())
    }
}
