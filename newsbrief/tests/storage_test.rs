use chrono::Utc;
use common::Config;
use newsbrief::model::{Citation, Digest, Subscriber, SubscriberStatus};
use newsbrief::storage::{
    ensure_schema, sync_topics, DigestArchive, SqliteStore, SubscriberStore, TopicRegistry,
};
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

// One connection: every connection to :memory: is a separate database
async fn setup_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    ensure_schema(&pool).await.expect("ensure schema");
    SqliteStore::new(pool)
}

fn subscriber(id: &str, email: &str, topic: &str) -> Subscriber {
    Subscriber {
        id: id.to_string(),
        email: email.to_string(),
        name: id.to_uppercase(),
        topic_id: topic.to_string(),
        status: SubscriberStatus::Active,
    }
}

#[tokio::test]
async fn test_topics_are_synced_from_config() {
    let store = setup_store().await;
    let config: Config = toml::from_str(
        r#"
        [database]
        path = "unused.db"

        [[topics]]
        id = "robotics"
        display_name = "Robotics"
        search_query = "robotics"

        [[topics]]
        id = "ml"
        search_query = "machine learning"

        [[topics]]
        id = "retired"
        search_query = "old"
        active = false
        "#,
    )
    .expect("config");

    assert_eq!(sync_topics(&config, store.pool()).await.expect("sync"), 3);
    // Idempotent
    sync_topics(&config, store.pool()).await.expect("resync");

    let topics = store.active_topics().await.expect("topics");
    let ids: Vec<&str> = topics.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["ml", "robotics"]);
    assert_eq!(topics[0].display_name, "ml", "display name defaults to the id");
    assert_eq!(topics[1].display_name, "Robotics");
}

#[tokio::test]
async fn test_active_subscribers_and_status_recheck() {
    let store = setup_store().await;
    store.upsert_subscriber(&subscriber("s1", "a@example.com", "robotics")).await.expect("s1");
    store.upsert_subscriber(&subscriber("s2", "b@example.com", "robotics")).await.expect("s2");
    store.upsert_subscriber(&subscriber("s3", "c@example.com", "ml")).await.expect("s3");

    let active = store.active_subscribers("robotics").await.expect("list");
    assert_eq!(active.len(), 2);
    assert!(active.iter().all(|s| s.topic_id == "robotics" && s.is_active()));

    store
        .set_subscriber_status("s2", SubscriberStatus::Inactive)
        .await
        .expect("unsubscribe");
    let active = store.active_subscribers("robotics").await.expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "s1");

    assert_eq!(
        store.subscriber_status("s2").await.expect("status"),
        Some(SubscriberStatus::Inactive)
    );
    assert_eq!(store.subscriber_status("missing").await.expect("status"), None);
}

#[tokio::test]
async fn test_digest_archive_and_delivery_log() {
    let store = setup_store().await;
    let run_id = Uuid::new_v4();
    let digest = Digest {
        topic_id: "robotics".to_string(),
        summary: "<p>Robots</p>".to_string(),
        citations: vec![
            Citation {
                url: "https://a.example/1".to_string(),
                title: "A".to_string(),
                source: Some("Wire".to_string()),
                date: None,
            },
            Citation {
                url: "https://b.example/2".to_string(),
                title: "B".to_string(),
                source: None,
                date: Some("1 day ago".to_string()),
            },
        ],
        generated_at: Utc::now(),
    };

    store.record_digest(run_id, &digest).await.expect("archive");

    let urls: Vec<String> =
        sqlx::query_scalar("SELECT url FROM digest_citations ORDER BY position")
            .fetch_all(store.pool())
            .await
            .expect("citations");
    assert_eq!(urls, vec!["https://a.example/1", "https://b.example/2"]);

    assert!(!store.delivered_in_cycle("2026-W42", "robotics", "s1").await.expect("lookup"));
    store
        .record_delivery(run_id, "2026-W42", "robotics", "s1")
        .await
        .expect("record");
    // Recording twice is harmless
    store
        .record_delivery(run_id, "2026-W42", "robotics", "s1")
        .await
        .expect("record again");
    assert!(store.delivered_in_cycle("2026-W42", "robotics", "s1").await.expect("lookup"));
    assert!(!store.delivered_in_cycle("2026-W43", "robotics", "s1").await.expect("lookup"));
}
