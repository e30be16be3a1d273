use mockito::Matcher;
use newsbrief::error::PipelineError;
use newsbrief::search::{SearchProvider, SerpApiClient, TimePeriod};
use std::time::Duration;

fn client(server: &mockito::Server) -> SerpApiClient {
    SerpApiClient::new(format!("{}/search", server.url()), "serp-key", 5)
        .expect("client")
        .with_locale("us", "en")
        .with_time_period(TimePeriod::Week)
        .with_retry(3, Duration::from_millis(10))
}

#[tokio::test]
async fn test_news_search_keeps_ranking_and_caps_results() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("GET", "/search")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("engine".into(), "google".into()),
            Matcher::UrlEncoded("tbm".into(), "nws".into()),
            Matcher::UrlEncoded("q".into(), "robotics news".into()),
            Matcher::UrlEncoded("num".into(), "2".into()),
            Matcher::UrlEncoded("gl".into(), "us".into()),
            Matcher::UrlEncoded("hl".into(), "en".into()),
            Matcher::UrlEncoded("api_key".into(), "serp-key".into()),
            Matcher::Regex("tbs=cdr".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "news_results": [
                    {"title": "First", "link": "https://a.example/1", "snippet": "one", "source": "Wire", "date": "2 days ago"},
                    {"title": "No link", "link": "", "snippet": "skip me"},
                    {"title": "Second", "link": "https://b.example/2", "snippet": "two", "source": {"name": "Daily"}},
                    {"title": "Third", "link": "https://c.example/3", "snippet": "three"}
                ]
            }"#,
        )
        .create_async()
        .await;

    let results = client(&server).search("robotics news", 2).await.expect("results");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].url, "https://a.example/1");
    assert_eq!(results[0].source.as_deref(), Some("Wire"));
    assert_eq!(results[0].date.as_deref(), Some("2 days ago"));
    assert_eq!(results[1].url, "https://b.example/2");
    assert_eq!(results[1].source.as_deref(), Some("Daily"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_no_results_message_is_an_empty_list() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"error": "Google hasn't returned any results for this query."}"#)
        .create_async()
        .await;

    let results = client(&server).search("obscure", 10).await.expect("ok");
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_server_errors_are_retried_then_reported() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let err = client(&server).search("ml", 10).await.unwrap_err();
    assert!(matches!(err, PipelineError::SearchUnavailable(_)));
    assert!(err.to_string().contains("503"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_bad_key_is_not_retried() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"error": "Invalid API key."}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server).search("ml", 10).await.unwrap_err();
    assert!(matches!(err, PipelineError::SearchUnavailable(_)));

    mock.assert_async().await;
}
