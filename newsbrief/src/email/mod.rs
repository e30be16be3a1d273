use async_trait::async_trait;

use crate::error::Result;
use crate::model::EmailMessage;

pub mod brevo;
pub mod dispatcher;
pub mod quota;
pub mod rate_limit;

pub use dispatcher::{DeliveryLog, Dispatcher, RetryPolicy};
pub use quota::QuotaGate;
pub use rate_limit::RateLimiter;

/// Recipient of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

/// Transactional email API.
///
/// Implementations map provider throttling (HTTP 429) to `PipelineError::DispatchThrottled`
/// and every other failure to `PipelineError::DispatchFailed`.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, message: &EmailMessage, to: &Recipient) -> Result<()>;
}
