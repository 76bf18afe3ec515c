use std::sync::Arc;

use keyrelay_core::clock::ManualClock;
use keyrelay_core::config::{Config, ProviderKind, ProviderSettings};
use keyrelay_core::error::FallbackError;
use keyrelay_core::fallback::FallbackOrchestrator;
use keyrelay_core::types::{CompletionOptions, Message};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_provider(name: &str, priority: u32, base: &str, key: &str) -> ProviderSettings {
    let mut settings = ProviderSettings::new(name, ProviderKind::OpenAiCompat, "gpt-4o-mini", priority);
    settings.api_base = Some(base.to_string());
    settings.api_keys = vec![key.to_string()];
    settings.timeout_ms = 5_000;
    settings
}

fn config_with(providers: Vec<ProviderSettings>) -> Config {
    Config {
        providers,
        image_providers: Vec::new(),
        ..Config::default()
    }
}

fn completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
}

fn orchestrator(config: &Config) -> FallbackOrchestrator {
    FallbackOrchestrator::from_config_with_clock(config, Arc::new(ManualClock::default())).unwrap()
}

#[tokio::test]
async fn test_quota_error_falls_back_to_next_provider() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer key-one-000001"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
        .expect(1)
        .mount(&first)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer key-two-000002"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello")))
        .expect(1)
        .mount(&second)
        .await;

    let config = config_with(vec![
        chat_provider("provider1", 1, &first.uri(), "key-one-000001"),
        chat_provider("provider2", 2, &second.uri(), "key-two-000002"),
    ]);
    let orchestrator = orchestrator(&config);

    let resp = orchestrator
        .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(resp.content, "hello");
    assert_eq!(resp.provider, "provider2");
    assert!(orchestrator.keys().is_exhausted("provider1", "key-one-000001"));
    let status = orchestrator
        .keys()
        .status("provider1", "key-one-000001")
        .unwrap();
    assert_eq!(status.error_count, 1);
    assert!(status.exhausted_until.is_some());
}

#[tokio::test]
async fn test_success_short_circuits_remaining_providers() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from b")))
        .expect(1)
        .mount(&b)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from c")))
        .expect(0)
        .mount(&c)
        .await;

    let config = config_with(vec![
        chat_provider("c", 3, &c.uri(), "key-c-00000001"),
        chat_provider("a", 1, &a.uri(), "key-a-00000001"),
        chat_provider("b", 2, &b.uri(), "key-b-00000001"),
    ]);
    let orchestrator = orchestrator(&config);

    let resp = orchestrator
        .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "from b");
    assert_eq!(resp.provider, "b");
    // A 503 is transient: the key stays usable.
    assert!(!orchestrator.keys().is_exhausted("a", "key-a-00000001"));
}

#[tokio::test]
async fn test_all_providers_failing_is_terminal() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
        .mount(&b)
        .await;

    let config = config_with(vec![
        chat_provider("a", 1, &a.uri(), "key-a-00000001"),
        chat_provider("b", 2, &b.uri(), "key-b-00000001"),
    ]);
    let orchestrator = orchestrator(&config);

    let err = orchestrator
        .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
        .await
        .unwrap_err();
    match err {
        FallbackError::AllProvidersFailed { last_error } => {
            assert!(last_error.starts_with("b: "), "{last_error}");
            assert!(last_error.contains("No choices"), "{last_error}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_rotates_to_second_key_on_same_provider() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("authorization", "Bearer key-first-0001"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer key-second-002"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("rotated")))
        .expect(2)
        .mount(&server)
        .await;

    let mut settings = chat_provider("llm7", 1, &server.uri(), "key-first-0001");
    settings.api_keys.push("key-second-002".to_string());
    let orchestrator = orchestrator(&config_with(vec![settings]));

    for _ in 0..2 {
        let resp = orchestrator
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "rotated");
    }
    assert_eq!(orchestrator.keys().current("llm7").as_deref(), Some("key-second-002"));
}

#[tokio::test]
async fn test_without_keys_no_provider_is_available() {
    let config = config_with(vec![ProviderSettings::new(
        "llm7",
        ProviderKind::OpenAiCompat,
        "gpt-4o-mini",
        1,
    )]);
    let orchestrator = orchestrator(&config);

    let err = orchestrator
        .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FallbackError::NoProvidersAvailable));
}

#[tokio::test]
async fn test_unreachable_gemini_does_not_leak_key() {
    let mut gemini = ProviderSettings::new("gemini", ProviderKind::Gemini, "gemini-2.0-flash", 1);
    gemini.api_base = Some("http://127.0.0.1:9".to_string());
    gemini.api_keys = vec!["AIzaHIDDENKEY1234567890".to_string()];
    let orchestrator = orchestrator(&config_with(vec![gemini]));

    let err = orchestrator
        .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
        .await
        .unwrap_err();
    match err {
        FallbackError::AllProvidersFailed { last_error } => {
            assert!(last_error.starts_with("gemini: HTTP error"), "{last_error}");
            assert!(!last_error.contains("HIDDENKEY"), "{last_error}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
