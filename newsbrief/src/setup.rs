//! Builds the pipeline and its collaborators from configuration.
//!
//! Secrets are never read from the config file: each `*_api_key_env` setting names an
//! environment variable.

use anyhow::{Context, Result};
use common::{Config, LlmConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::assembler::AssemblerOptions;
use crate::email::brevo::BrevoClient;
use crate::email::{Dispatcher, EmailProvider, RateLimiter, RetryPolicy};
use crate::llm::remote::RemoteLlmProvider;
use crate::llm::summarizer::DigestSummarizer;
use crate::llm::LlmProvider;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::scraping::HttpExtractor;
use crate::search::{SerpApiClient, TimePeriod};
use crate::storage::{SqliteStore, SubscriberStore};

const DEFAULT_SEARCH_URL: &str = "https://serpapi.com/search";
const DEFAULT_LLM_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_EMAIL_URL: &str = "https://api.brevo.com/v3";
const DEFAULT_GLOBAL_QUOTA: usize = 100;

fn secret(env_name: &str) -> Result<String> {
    std::env::var(env_name).with_context(|| format!("API key env var '{}' not set", env_name))
}

pub fn build_search(config: &Config) -> Result<SerpApiClient> {
    let cfg = &config.search;
    let api_key = secret(cfg.api_key_env.as_deref().unwrap_or("SERPAPI_API_KEY"))?;
    let client = SerpApiClient::new(
        cfg.api_url.as_deref().unwrap_or(DEFAULT_SEARCH_URL),
        api_key,
        cfg.timeout_seconds.unwrap_or(15),
    )?
    .with_locale(
        cfg.country.as_deref().unwrap_or("us"),
        cfg.language.as_deref().unwrap_or("en"),
    )
    .with_time_period(TimePeriod::parse(cfg.time_period.as_deref().unwrap_or("week")))
    .with_retry(cfg.max_attempts.unwrap_or(3), Duration::from_secs(1));
    Ok(client)
}

pub fn build_extractor(config: &Config) -> Result<HttpExtractor> {
    let cfg = &config.extraction;
    let extractor = HttpExtractor::new(cfg.timeout_seconds.unwrap_or(10), cfg.user_agent.as_deref())?
        .with_limits(
            cfg.min_chars.unwrap_or(200),
            cfg.max_response_bytes.unwrap_or(2 * 1024 * 1024),
        );
    Ok(extractor)
}

/// Create the LLM provider used for digest summarization.
///
/// The `[llm.summarization]` endpoint wins over `[llm.remote]` when both are present.
pub fn create_llm_provider(llm_config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("remote");
    match adapter {
        "remote" => {
            let remote_config = llm_config
                .summarization
                .as_ref()
                .or(llm_config.remote.as_ref())
                .ok_or_else(|| anyhow::anyhow!("Remote adapter selected but no [llm.remote] section found"))?;

            let api_key_env = remote_config
                .api_key_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in remote config"))?;
            let api_key = secret(api_key_env)?;

            let model = remote_config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = remote_config.api_url.clone().unwrap_or_else(|| DEFAULT_LLM_URL.to_string());

            let provider = RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                remote_config.timeout_seconds.unwrap_or(120),
                remote_config.max_tokens.unwrap_or(2000),
                0.4,
            );
            info!(model = %provider.model(), "LLM provider initialized");
            Ok(Box::new(provider))
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}

pub fn build_summarizer(config: &Config) -> Result<DigestSummarizer> {
    let llm_config = config
        .llm
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("an [llm] section is required to summarize digests"))?;
    let provider: Arc<dyn LlmProvider> = Arc::from(create_llm_provider(llm_config)?);
    let max_tokens = llm_config
        .summarization
        .as_ref()
        .or(llm_config.remote.as_ref())
        .and_then(|r| r.max_tokens)
        .unwrap_or(2000);

    Ok(DigestSummarizer::new(provider).with_limits(
        llm_config.max_input_chars.unwrap_or(24_000),
        llm_config.max_article_chars.unwrap_or(6_000),
        max_tokens,
    ))
}

pub fn build_email_provider(config: &Config) -> Result<BrevoClient> {
    let cfg = &config.email;
    let api_key = secret(cfg.api_key_env.as_deref().unwrap_or("BREVO_API_KEY"))?;
    let sender_email = cfg
        .sender_email
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("email.sender_email must be set"))?;
    BrevoClient::new(
        cfg.api_url.as_deref().unwrap_or(DEFAULT_EMAIL_URL),
        api_key,
        cfg.sender_name.as_deref().unwrap_or("Newsbrief"),
        sender_email,
        cfg.timeout_seconds.unwrap_or(15),
    )
}

pub fn build_dispatcher(
    config: &Config,
    provider: Arc<dyn EmailProvider>,
    subscribers: Arc<dyn SubscriberStore>,
) -> Dispatcher {
    let email = &config.email;
    let limiter = Arc::new(RateLimiter::new(
        email.rate_per_second.unwrap_or(5.0),
        email.burst.unwrap_or(5),
    ));
    let global_quota = Some(config.quota.global.unwrap_or(DEFAULT_GLOBAL_QUOTA));
    let retry = RetryPolicy {
        max_retries: email.max_retries.unwrap_or(3),
        base_delay: Duration::from_millis(email.backoff_base_ms.unwrap_or(500)),
        max_delay: Duration::from_millis(email.backoff_max_ms.unwrap_or(30_000)),
    };

    Dispatcher::new(provider, subscribers, limiter, global_quota)
        .with_per_topic_quota(config.quota.per_topic)
        .with_retry(retry)
}

pub fn pipeline_options(config: &Config) -> PipelineOptions {
    let defaults = PipelineOptions::default();
    PipelineOptions {
        max_results: config.search.max_results.unwrap_or(defaults.max_results),
        extraction_concurrency: config
            .extraction
            .concurrency
            .unwrap_or(defaults.extraction_concurrency),
        topic_concurrency: config
            .pipeline
            .topic_concurrency
            .unwrap_or(defaults.topic_concurrency),
        stage_timeout: config
            .pipeline
            .stage_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.stage_timeout),
        archive_digests: config.pipeline.archive_digests.unwrap_or(defaults.archive_digests),
        skip_already_delivered: config
            .pipeline
            .skip_already_delivered
            .unwrap_or(defaults.skip_already_delivered),
        assembler: AssemblerOptions {
            frontend_url: config.email.frontend_url.clone(),
            newsletter_name: config
                .email
                .sender_name
                .clone()
                .unwrap_or_else(|| "Newsbrief".to_string()),
        },
    }
}

/// Wire the full pipeline against the SQLite store and the configured remote services.
pub fn build_pipeline(config: &Config, store: SqliteStore) -> Result<Pipeline> {
    let store = Arc::new(store);
    let search = Arc::new(build_search(config)?);
    let extractor = Arc::new(build_extractor(config)?);
    let summarizer = Arc::new(build_summarizer(config)?);
    let email: Arc<dyn EmailProvider> = Arc::new(build_email_provider(config)?);
    let dispatcher = build_dispatcher(config, email, store.clone());

    let pipeline = Pipeline::new(
        store.clone(),
        store.clone(),
        search,
        extractor,
        summarizer,
        dispatcher,
    )
    .with_archive(store)
    .with_options(pipeline_options(config));
    Ok(pipeline)
}
