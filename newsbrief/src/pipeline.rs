//! The weekly digest cycle: search, extract, summarize, assemble and dispatch, per topic.
//!
//! `Pipeline::run` is the only entry point. It never returns an error: everything that goes
//! wrong ends up in the `RunReport`.

use chrono::Utc;
use futures::{stream, FutureExt, StreamExt};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assembler::{self, AssemblerOptions};
use crate::email::{DeliveryLog, Dispatcher};
use crate::error::PipelineError;
use crate::llm::summarizer::DigestSummarizer;
use crate::model::{Citation, Digest, ExtractedArticle, ExtractionStatus, SearchResult, Subscriber, Topic};
use crate::report::{RunReport, TopicFailure, TopicReport, TopicStatus};
use crate::schedule::cycle_key;
use crate::scraping::ContentExtractor;
use crate::search::SearchProvider;
use crate::storage::{DigestArchive, SubscriberStore, TopicRegistry};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_results: usize,
    /// Concurrent article fetches within one topic.
    pub extraction_concurrency: usize,
    /// Topics processed at once. 1 means strictly sequential.
    pub topic_concurrency: usize,
    /// Upper bound for the search, each extraction and the summarization of a topic.
    pub stage_timeout: Duration,
    pub archive_digests: bool,
    /// Skip subscribers already sent this topic's digest in the current ISO week.
    pub skip_already_delivered: bool,
    pub assembler: AssemblerOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            extraction_concurrency: 4,
            topic_concurrency: 1,
            stage_timeout: Duration::from_secs(180),
            archive_digests: true,
            skip_already_delivered: false,
            assembler: AssemblerOptions::default(),
        }
    }
}

pub struct Pipeline {
    topics: Arc<dyn TopicRegistry>,
    subscribers: Arc<dyn SubscriberStore>,
    search: Arc<dyn SearchProvider>,
    extractor: Arc<dyn ContentExtractor>,
    summarizer: Arc<DigestSummarizer>,
    dispatcher: Dispatcher,
    archive: Option<Arc<dyn DigestArchive>>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        topics: Arc<dyn TopicRegistry>,
        subscribers: Arc<dyn SubscriberStore>,
        search: Arc<dyn SearchProvider>,
        extractor: Arc<dyn ContentExtractor>,
        summarizer: Arc<DigestSummarizer>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            topics,
            subscribers,
            search,
            extractor,
            summarizer,
            dispatcher,
            archive: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn DigestArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run one weekly digest cycle over the current topic snapshot.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::new();
        info!(run_id = %report.run_id, "pipeline: run starting");

        let topics = match self.topics.active_topics().await {
            Ok(topics) => topics,
            Err(e) => {
                error!(error = %e, "pipeline: topic registry unavailable, nothing to do");
                report.errors.push(format!("topic registry unavailable: {}", e));
                report.finish();
                return report;
            }
        };

        let mut seen = HashSet::new();
        let topics: Vec<Topic> = topics
            .into_iter()
            .filter(|t| t.active)
            .filter(|t| {
                let first = seen.insert(t.id.clone());
                if !first {
                    warn!(topic = %t.id, "pipeline: duplicate topic in snapshot ignored");
                }
                first
            })
            .collect();
        info!(run_id = %report.run_id, topics = topics.len(), "pipeline: active topics loaded");

        // quota is per run; the limiter stays shared across runs
        let dispatcher = self
            .dispatcher
            .for_run()
            .with_delivery_log(self.delivery_log(report.run_id, report.started_at));
        let run_id = report.run_id;

        let topic_reports: Vec<TopicReport> = stream::iter(topics.iter())
            .map(|topic| self.run_topic(topic, &dispatcher, run_id))
            .buffer_unordered(self.options.topic_concurrency.max(1))
            .collect()
            .await;

        for topic_report in topic_reports {
            report.insert(topic_report);
        }
        report.finish();

        let totals = report.totals();
        info!(
            run_id = %report.run_id,
            topics = totals.topics,
            topics_failed = totals.topics_failed,
            articles_fetched = totals.articles_fetched,
            articles_failed = totals.articles_failed,
            emails_sent = totals.emails_sent,
            emails_failed = totals.emails_failed,
            emails_skipped = totals.emails_skipped,
            "pipeline: run finished"
        );
        report
    }

    fn delivery_log(&self, run_id: Uuid, started_at: chrono::DateTime<Utc>) -> Option<DeliveryLog> {
        if !self.options.skip_already_delivered {
            return None;
        }
        match &self.archive {
            Some(archive) => Some(DeliveryLog {
                archive: archive.clone(),
                cycle: cycle_key(started_at),
                run_id,
            }),
            None => {
                warn!("pipeline: skip_already_delivered set but no archive configured, dedup disabled");
                None
            }
        }
    }

    /// One topic, with a panic anywhere inside it contained to that topic.
    async fn run_topic(&self, topic: &Topic, dispatcher: &Dispatcher, run_id: Uuid) -> TopicReport {
        match AssertUnwindSafe(self.process_topic(topic, dispatcher, run_id))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(topic = %topic.id, panic = %message, "pipeline: topic worker panicked");
                let mut report = TopicReport::new(topic.id.clone(), topic.display_name.clone());
                report.fail(TopicFailure::Panicked(message));
                report
            }
        }
    }

    async fn process_topic(&self, topic: &Topic, dispatcher: &Dispatcher, run_id: Uuid) -> TopicReport {
        let mut report = TopicReport::new(topic.id.clone(), topic.display_name.clone());
        info!(topic = %topic.id, query = %topic.search_query, "pipeline: processing topic");

        let subscribers: Vec<Subscriber> = match self.subscribers.active_subscribers(&topic.id).await {
            Ok(list) => list.into_iter().filter(Subscriber::is_active).collect(),
            Err(e) => {
                warn!(topic = %topic.id, error = %e, "pipeline: subscriber store unavailable");
                report.fail(TopicFailure::SubscriberStoreUnavailable(e.to_string()));
                return report;
            }
        };
        if subscribers.is_empty() {
            info!(topic = %topic.id, "pipeline: no active subscribers, skipping");
            report.status = TopicStatus::Skipped {
                reason: "no active subscribers".to_string(),
            };
            return report;
        }

        let results = match self.search_stage(topic).await {
            Ok(results) => results,
            Err(failure) => {
                warn!(topic = %topic.id, reason = %failure, "pipeline: topic failed at search");
                report.fail(failure);
                return report;
            }
        };

        let articles = self.extract_stage(&results).await;
        report.articles_fetched = articles.len();
        for article in articles.iter().filter(|a| !a.is_ok()) {
            report.articles_failed += 1;
            report.errors.push(extraction_error(article).to_string());
        }

        let extracted: Vec<(&SearchResult, &ExtractedArticle)> = results
            .iter()
            .zip(articles.iter())
            .filter(|(_, a)| a.is_ok())
            .collect();
        info!(
            topic = %topic.id,
            fetched = report.articles_fetched,
            extracted = extracted.len(),
            "pipeline: extraction done"
        );
        if extracted.is_empty() {
            report.fail(TopicFailure::NoArticlesExtracted);
            return report;
        }

        let summary = match self.summarize_stage(topic, &articles).await {
            Ok(summary) => summary,
            Err(failure) => {
                warn!(topic = %topic.id, reason = %failure, "pipeline: topic failed at summarization");
                report.fail(failure);
                return report;
            }
        };

        let digest = Digest {
            topic_id: topic.id.clone(),
            summary,
            citations: extracted
                .iter()
                .map(|(result, article)| Citation {
                    url: result.url.clone(),
                    title: if result.title.trim().is_empty() {
                        article.title.clone()
                    } else {
                        result.title.clone()
                    },
                    source: result.source.clone(),
                    date: result.date.clone(),
                })
                .collect(),
            generated_at: Utc::now(),
        };
        report.cited_urls = digest.cited_urls().into_iter().map(String::from).collect();

        if self.options.archive_digests {
            if let Some(archive) = &self.archive {
                if let Err(e) = archive.record_digest(run_id, &digest).await {
                    warn!(topic = %topic.id, error = %e, "pipeline: failed to archive digest");
                    report.errors.push(format!("digest not archived: {}", e));
                }
            }
        }

        let message = assembler::assemble(topic, &digest, &self.options.assembler);
        debug!(topic = %topic.id, subject = %message.subject, "pipeline: digest assembled");

        for record in dispatcher.dispatch_topic(topic, &message, &subscribers).await {
            report.record_delivery(record);
        }
        info!(
            topic = %topic.id,
            sent = report.emails_sent,
            failed = report.emails_failed,
            skipped_quota = report.emails_skipped_quota,
            skipped_inactive = report.emails_skipped_inactive,
            "pipeline: topic delivered"
        );
        report
    }

    async fn search_stage(&self, topic: &Topic) -> Result<Vec<SearchResult>, TopicFailure> {
        let max_results = self.options.max_results.max(1);
        let results = match timeout(
            self.options.stage_timeout,
            self.search.search(&topic.search_query, max_results),
        )
        .await
        {
            Err(_) => {
                let e = PipelineError::Timeout {
                    stage: "search",
                    seconds: self.options.stage_timeout.as_secs(),
                };
                return Err(TopicFailure::SearchUnavailable(e.to_string()));
            }
            Ok(Err(e)) => return Err(TopicFailure::SearchUnavailable(e.to_string())),
            Ok(Ok(results)) => results,
        };

        let results: Vec<SearchResult> = results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .take(max_results)
            .collect();
        if results.is_empty() {
            return Err(TopicFailure::NoSearchResults);
        }
        debug!(topic = %topic.id, results = results.len(), "pipeline: search done");
        Ok(results)
    }

    /// Extract every result, in ranking order. One slow or broken page never affects another.
    async fn extract_stage(&self, results: &[SearchResult]) -> Vec<ExtractedArticle> {
        let limit = self.options.stage_timeout;
        stream::iter(results.iter())
            .map(|result| async move {
                match timeout(limit, self.extractor.extract(&result.url)).await {
                    Ok(article) => article,
                    Err(_) => ExtractedArticle::failed(
                        result.url.clone(),
                        PipelineError::Timeout {
                            stage: "extraction",
                            seconds: limit.as_secs(),
                        }
                        .to_string(),
                    ),
                }
            })
            .buffered(self.options.extraction_concurrency.max(1))
            .collect()
            .await
    }

    async fn summarize_stage(&self, topic: &Topic, articles: &[ExtractedArticle]) -> Result<String, TopicFailure> {
        match timeout(self.options.stage_timeout, self.summarizer.summarize(topic, articles)).await {
            Err(_) => Err(TopicFailure::TimedOut("summarization".to_string())),
            Ok(Err(e)) => Err(TopicFailure::SummarizationFailed(e.to_string())),
            Ok(Ok(summary)) => Ok(summary),
        }
    }
}

fn extraction_error(article: &ExtractedArticle) -> PipelineError {
    match &article.status {
        ExtractionStatus::Failed(reason) => PipelineError::ExtractionFailed {
            url: article.url.clone(),
            reason: reason.clone(),
        },
        _ => PipelineError::ExtractionEmpty {
            url: article.url.clone(),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
