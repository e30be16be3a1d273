use async_trait::async_trait;
use chrono::Utc;
use common::Config;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Digest, Subscriber, SubscriberStatus, Topic};

/// Source of the topics to process. The pipeline reads one snapshot per run.
#[async_trait]
pub trait TopicRegistry: Send + Sync {
    async fn active_topics(&self) -> Result<Vec<Topic>>;
}

/// Subscriber roster, owned by the subscribe/unsubscribe handlers.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Subscribers of a topic whose status is currently `active`.
    async fn active_subscribers(&self, topic_id: &str) -> Result<Vec<Subscriber>>;

    /// Current status, re-read at dispatch time. `None` means the record is gone.
    async fn subscriber_status(&self, subscriber_id: &str) -> Result<Option<SubscriberStatus>>;
}

/// Where generated digests and successful deliveries are recorded.
#[async_trait]
pub trait DigestArchive: Send + Sync {
    async fn record_digest(&self, run_id: Uuid, digest: &Digest) -> Result<()>;

    async fn record_delivery(&self, run_id: Uuid, cycle: &str, topic_id: &str, subscriber_id: &str) -> Result<()>;

    async fn delivered_in_cycle(&self, cycle: &str, topic_id: &str, subscriber_id: &str) -> Result<bool>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS topics (
        id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        search_query TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscribers (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        topic_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_subscribers_topic ON subscribers (topic_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS digests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        topic_id TEXT NOT NULL,
        summary TEXT NOT NULL,
        generated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS digest_citations (
        digest_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        url TEXT NOT NULL,
        title TEXT,
        source TEXT,
        date TEXT,
        PRIMARY KEY (digest_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliveries (
        cycle TEXT NOT NULL,
        topic_id TEXT NOT NULL,
        subscriber_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        PRIMARY KEY (cycle, topic_id, subscriber_id)
    )
    "#,
];

/// Create the tables the pipeline reads and writes, if they do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("storage: schema ensured");
    Ok(())
}

/// Upsert the topics declared in configuration. Safe to call on every start.
pub async fn sync_topics(config: &Config, pool: &SqlitePool) -> anyhow::Result<usize> {
    for t in &config.topics {
        let display_name = t.display_name.clone().unwrap_or_else(|| t.id.clone());
        sqlx::query(
            "INSERT INTO topics (id, display_name, search_query, active, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name,
                 search_query = excluded.search_query, active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(&t.id)
        .bind(display_name)
        .bind(&t.search_query)
        .bind(t.active)
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(|e| anyhow::anyhow!("failed to upsert topic {}: {}", t.id, e))?;
    }
    info!(count = config.topics.len(), "storage: configured topics synchronized");
    Ok(config.topics.len())
}

/// SQLite-backed registry, roster and archive.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscribers (id, email, name, topic_id, status) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET email = excluded.email, name = excluded.name,
                 topic_id = excluded.topic_id, status = excluded.status",
        )
        .bind(&subscriber.id)
        .bind(&subscriber.email)
        .bind(&subscriber.name)
        .bind(&subscriber.topic_id)
        .bind(subscriber.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_subscriber_status(&self, subscriber_id: &str, status: SubscriberStatus) -> Result<()> {
        sqlx::query("UPDATE subscribers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TopicRegistry for SqliteStore {
    async fn active_topics(&self) -> Result<Vec<Topic>> {
        let rows = sqlx::query(
            "SELECT id, display_name, search_query, active FROM topics WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Topic {
                id: row.get("id"),
                display_name: row.get("display_name"),
                search_query: row.get("search_query"),
                active: row.get("active"),
            })
            .collect())
    }
}

#[async_trait]
impl SubscriberStore for SqliteStore {
    async fn active_subscribers(&self, topic_id: &str) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            "SELECT id, email, name, topic_id, status FROM subscribers
             WHERE topic_id = ? AND status = 'active' ORDER BY created_at, id",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Subscriber {
                    id: row.get("id"),
                    email: row.get("email"),
                    name: row.get("name"),
                    topic_id: row.get("topic_id"),
                    status: SubscriberStatus::parse(&status),
                }
            })
            .collect())
    }

    async fn subscriber_status(&self, subscriber_id: &str) -> Result<Option<SubscriberStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM subscribers WHERE id = ?")
            .bind(subscriber_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref().map(SubscriberStatus::parse))
    }
}

#[async_trait]
impl DigestArchive for SqliteStore {
    async fn record_digest(&self, run_id: Uuid, digest: &Digest) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let digest_id = sqlx::query(
            "INSERT INTO digests (run_id, topic_id, summary, generated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(&digest.topic_id)
        .bind(&digest.summary)
        .bind(digest.generated_at)
        .execute(&mut tx)
        .await?
        .last_insert_rowid();

        for (position, c) in digest.citations.iter().enumerate() {
            sqlx::query(
                "INSERT INTO digest_citations (digest_id, position, url, title, source, date) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(digest_id)
            .bind(position as i64)
            .bind(&c.url)
            .bind(&c.title)
            .bind(&c.source)
            .bind(&c.date)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        debug!(topic = %digest.topic_id, digest_id, "storage: digest archived");
        Ok(())
    }

    async fn record_delivery(&self, run_id: Uuid, cycle: &str, topic_id: &str, subscriber_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO deliveries (cycle, topic_id, subscriber_id, run_id, sent_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cycle)
        .bind(topic_id)
        .bind(subscriber_id)
        .bind(run_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delivered_in_cycle(&self, cycle: &str, topic_id: &str, subscriber_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deliveries WHERE cycle = ? AND topic_id = ? AND subscriber_id = ?",
        )
        .bind(cycle)
        .bind(topic_id)
        .bind(subscriber_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
