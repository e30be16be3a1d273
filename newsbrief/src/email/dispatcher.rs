use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EmailProvider, QuotaGate, RateLimiter, Recipient};
use crate::error::PipelineError;
use crate::model::{EmailMessage, Subscriber, SubscriberStatus, Topic};
use crate::report::{DeliveryOutcome, DeliveryRecord};
use crate::storage::{DigestArchive, SubscriberStore};

/// Bounded retry for throttled sends: exponential backoff with jitter, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). Honors the provider's Retry-After when larger.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
            .min(self.max_delay);
        // up to +50% jitter so throttled workers do not retry in lockstep
        let jitter_ms = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let computed = (exp + jitter).min(self.max_delay);
        match retry_after {
            Some(ra) if ra > computed => ra.min(self.max_delay),
            _ => computed,
        }
    }
}

/// Idempotency for re-runs within one weekly cycle. Off unless configured.
#[derive(Clone)]
pub struct DeliveryLog {
    pub archive: Arc<dyn DigestArchive>,
    pub cycle: String,
    pub run_id: Uuid,
}

/// Sends one topic's digest to its subscribers.
///
/// Shared state (rate limiter, global quota) is held by `Arc` so that concurrent topic workers
/// draw from the same buckets. The global quota counts one run: call [`Dispatcher::for_run`]
/// at the start of each run.
#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn EmailProvider>,
    subscribers: Arc<dyn SubscriberStore>,
    limiter: Arc<RateLimiter>,
    global_limit: Option<usize>,
    global_quota: Arc<QuotaGate>,
    per_topic_quota: Option<usize>,
    retry: RetryPolicy,
    delivery_log: Option<DeliveryLog>,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        subscribers: Arc<dyn SubscriberStore>,
        limiter: Arc<RateLimiter>,
        global_quota: Option<usize>,
    ) -> Self {
        Self {
            provider,
            subscribers,
            limiter,
            global_limit: global_quota,
            global_quota: Arc::new(QuotaGate::new(global_quota)),
            per_topic_quota: None,
            retry: RetryPolicy::default(),
            delivery_log: None,
        }
    }

    pub fn with_per_topic_quota(mut self, limit: Option<usize>) -> Self {
        self.per_topic_quota = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A dispatcher for a new run: same provider and limiter, global quota counter back at zero.
    pub fn for_run(&self) -> Self {
        Self {
            global_quota: Arc::new(QuotaGate::new(self.global_limit)),
            ..self.clone()
        }
    }

    pub fn with_delivery_log(mut self, log: Option<DeliveryLog>) -> Self {
        self.delivery_log = log;
        self
    }

    /// Deliver `message` to every subscriber, in order. Never fails as a whole: each distinct
    /// subscriber id gets exactly one record, including entries that are not sent to.
    pub async fn dispatch_topic(
        &self,
        topic: &Topic,
        message: &EmailMessage,
        subscribers: &[Subscriber],
    ) -> Vec<DeliveryRecord> {
        let topic_quota = QuotaGate::new(self.per_topic_quota);
        let mut seen_ids = HashSet::new();
        let mut seen_emails = HashSet::new();
        let mut records = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            // same id listed twice: it already has its record
            if !seen_ids.insert(subscriber.id.as_str()) {
                debug!(topic = %topic.id, subscriber = %subscriber.id, "dispatch: repeated roster entry dropped");
                continue;
            }

            let outcome = if subscriber.topic_id != topic.id {
                warn!(
                    topic = %topic.id,
                    subscriber = %subscriber.id,
                    subscribed_to = %subscriber.topic_id,
                    "dispatch: subscriber belongs to another topic"
                );
                DeliveryOutcome::Failed {
                    attempts: 0,
                    error: format!("subscriber belongs to topic {}", subscriber.topic_id),
                }
            } else if !seen_emails.insert(subscriber.email.trim().to_lowercase()) {
                // a second account on the same address still gets one email
                debug!(topic = %topic.id, subscriber = %subscriber.id, "dispatch: address already on this roster");
                DeliveryOutcome::SkippedDuplicate
            } else {
                self.deliver(topic, message, subscriber, &topic_quota).await
            };
            records.push(DeliveryRecord {
                subscriber_id: subscriber.id.clone(),
                outcome,
            });
        }

        let sent = records
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Sent { .. }))
            .count();
        info!(topic = %topic.id, sent, total = records.len(), "dispatch: topic complete");
        records
    }

    async fn deliver(
        &self,
        topic: &Topic,
        message: &EmailMessage,
        subscriber: &Subscriber,
        topic_quota: &QuotaGate,
    ) -> DeliveryOutcome {
        // (a) still subscribed?
        match self.subscribers.subscriber_status(&subscriber.id).await {
            Ok(Some(SubscriberStatus::Active)) => {}
            Ok(_) => {
                info!(topic = %topic.id, subscriber = %subscriber.id, "dispatch: subscriber no longer active");
                return DeliveryOutcome::SkippedInactive;
            }
            Err(e) => {
                warn!(subscriber = %subscriber.id, error = %e, "dispatch: status re-check failed");
                return DeliveryOutcome::Failed {
                    attempts: 0,
                    error: format!("status re-check failed: {}", e),
                };
            }
        }

        if let Some(log) = &self.delivery_log {
            match log.archive.delivered_in_cycle(&log.cycle, &topic.id, &subscriber.id).await {
                Ok(true) => return DeliveryOutcome::SkippedDuplicate,
                Ok(false) => {}
                Err(e) => warn!(subscriber = %subscriber.id, error = %e, "dispatch: delivery log lookup failed"),
            }
        }

        // (b) quota; topic cap first so a full topic does not burn global slots
        if topic_quota.limit().is_some_and(|l| topic_quota.used() >= l) {
            return DeliveryOutcome::SkippedQuota;
        }
        if !self.global_quota.try_acquire() {
            debug!(subscriber = %subscriber.id, error = %PipelineError::QuotaExceeded, "dispatch: global quota reached");
            return DeliveryOutcome::SkippedQuota;
        }
        if !topic_quota.try_acquire() {
            return DeliveryOutcome::SkippedQuota;
        }

        let outcome = self.send(message, subscriber).await;

        if let (DeliveryOutcome::Sent { .. }, Some(log)) = (&outcome, &self.delivery_log) {
            if let Err(e) = log
                .archive
                .record_delivery(log.run_id, &log.cycle, &topic.id, &subscriber.id)
                .await
            {
                warn!(subscriber = %subscriber.id, error = %e, "dispatch: failed to record delivery");
            }
        }
        outcome
    }

    /// One message to one subscriber, paced by the shared limiter; throttling is retried.
    pub async fn send(&self, message: &EmailMessage, subscriber: &Subscriber) -> DeliveryOutcome {
        let to = Recipient {
            email: subscriber.email.clone(),
            name: subscriber.name.clone(),
        };
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            match self.provider.send(message, &to).await {
                Ok(()) => {
                    debug!(subscriber = %subscriber.id, email = %subscriber.email, attempt, "dispatch: sent");
                    return DeliveryOutcome::Sent {
                        retry_count: attempt - 1,
                    };
                }
                Err(PipelineError::DispatchThrottled { retry_after }) if attempt < max_attempts => {
                    let delay = self.retry.delay(attempt, retry_after);
                    warn!(subscriber = %subscriber.id, attempt, ?delay, "dispatch: throttled, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(subscriber = %subscriber.id, attempt, error = %e, "dispatch: giving up");
                    return DeliveryOutcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
            }
        }
    }
}
