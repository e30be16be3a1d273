/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsbrief.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file, with default/override merging
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsbrief.db")
    pub path: String,
}

/// Weekly trigger used by `--daemon` mode. Times are UTC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Three-letter weekday ("Sun", "Mon", ...)
    pub weekday: Option<String>,
    /// Wall-clock time in "HH:MM" 24h format
    pub time: Option<String>,
}

/// Web search provider (SerpApi-compatible)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub max_results: Option<usize>,
    /// "day", "week" or "month"
    pub time_period: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Article fetching / extraction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub timeout_seconds: Option<u64>,
    pub concurrency: Option<usize>,
    /// Below this many characters an extracted article counts as empty
    pub min_chars: Option<usize>,
    pub max_response_bytes: Option<u64>,
    pub user_agent: Option<String>,
}

/// Remote LLM endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote"
    // Fallback: single remote config
    pub remote: Option<RemoteLlmConfig>,
    // Task-specific override for digest summarization
    pub summarization: Option<RemoteLlmConfig>,
    /// Character budget for one model call
    pub max_input_chars: Option<usize>,
    /// Per-article truncation before packing
    pub max_article_chars: Option<usize>,
}

/// Transactional email provider (Brevo-compatible) and pacing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    /// Linked from the footer of every digest for unsubscribing
    pub frontend_url: Option<String>,
    pub rate_per_second: Option<f64>,
    pub burst: Option<u32>,
    pub max_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

/// Caps on emails attempted per run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub global: Option<usize>,
    pub per_topic: Option<usize>,
}

/// Orchestration knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub topic_concurrency: Option<usize>,
    pub stage_timeout_seconds: Option<u64>,
    pub skip_already_delivered: Option<bool>,
    pub archive_digests: Option<bool>,
}

/// Topic definition synchronized into the `topics` table at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub id: String,
    pub display_name: Option<String>,
    pub search_query: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and the DB file if missing, then returns a
/// pool in WAL mode. The pipeline is a weekly batch job, so the pool stays small.
///
/// Example:
///   let pool = init_db_pool("data/newsbrief.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Surface filesystem permission problems here rather than as an opaque connect error.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
