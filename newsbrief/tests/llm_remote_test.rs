use newsbrief::llm::remote::RemoteLlmProvider;
use newsbrief::llm::summarizer::DigestSummarizer;
use newsbrief::llm::{LlmProvider, LlmRequest};
use newsbrief::model::{ExtractedArticle, Topic};
use std::sync::Arc;

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    // Mock successful OpenAI response
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "This is a test response"
                    },
                    "finish_reason": "stop"
                }],
                "usage": {
                    "prompt_tokens": 10,
                    "completion_tokens": 5,
                    "total_tokens": 15
                }
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        system: Some("You are terse.".to_string()),
        prompt: "Test prompt".to_string(),
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
    };

    let result = provider.generate(request).await;

    assert!(result.is_ok());
    let response = result.unwrap();
    assert_eq!(response.content, "This is a test response");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "gpt-4o-mini");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_digest_summary_through_remote_provider() {
    let mut server = mockito::Server::new_async().await;

    // The model wraps its HTML in a code fence, which must not reach the email
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .match_body(mockito::Matcher::Regex("Topic: Robotics".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "```html\n<h2>Robots</h2><p>Two stories [1] [2].</p>\n```"
                    },
                    "finish_reason": "stop"
                }]
            }"#,
        )
        .expect(1)
        .create_async()
        .await;

    let provider = Arc::new(RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini"));
    let summarizer = DigestSummarizer::new(provider);
    let topic = Topic {
        id: "robotics".to_string(),
        display_name: "Robotics".to_string(),
        search_query: "robotics".to_string(),
        active: true,
    };
    let articles = vec![
        ExtractedArticle::ok("https://a.example/1", "Arm", "A new robotic arm ships."),
        ExtractedArticle::failed("https://b.example/2", "timed out"),
        ExtractedArticle::ok("https://c.example/3", "Legs", "A walking robot sets a record."),
    ];

    let summary = summarizer.summarize(&topic, &articles).await.expect("summary");

    assert_eq!(summary, "<h2>Robots</h2><p>Two stories [1] [2].</p>");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    // Mock API error
    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("429"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    // Mock slow response
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        timeout_seconds: Some(1), // 1 second timeout
        ..Default::default()
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("timed out"));
}
