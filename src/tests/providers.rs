//! Provider adapters against a local HTTP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    http::{header, HeaderMap, StatusCode, Uri},
    Router,
};
use serde_json::json;

use crate::config::ProviderConfig;
use crate::providers::anthropic::ClaudeClassifier;
use crate::providers::gemini::GeminiClassifier;
use crate::providers::openai::ChatCompletions;
use crate::providers::{mistral, Classifier, ClassifyRequest, ProviderError, ProviderKind};

type Seen = Arc<Mutex<Vec<(String, HeaderMap)>>>;

/// Answer every request with `status` and `body`, recording path and headers.
fn serve(status: StatusCode, body: String) -> (String, Seen) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let record = seen.clone();
    let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
        let record = record.clone();
        let body = body.clone();
        async move {
            record.lock().unwrap().push((uri.path().to_string(), headers));
            (status, [(header::CONTENT_TYPE, "application/json")], body)
        }
    });

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });

    (format!("http://{addr}"), seen)
}

fn settings(model: &str, base_url: &str) -> ProviderConfig {
    ProviderConfig {
        model: model.into(),
        max_batch_keywords: 10,
        max_tokens: 256,
        base_url: Some(base_url.into()),
    }
}

fn request() -> ClassifyRequest {
    ClassifyRequest {
        keywords: vec!["buy tomato seeds".into()],
        language: "en".into(),
        prompt: "classify: buy tomato seeds".into(),
    }
}

/// What a model writes inside the provider envelope.
fn answer() -> String {
    json!({"results": [{
        "keyword": "buy tomato seeds",
        "main_cat": "Gardening",
        "sub_cat_1": "Buying",
        "sub_cat_2": "Buying Seeds",
        "semantic_theme": "Purchasing seeds"
    }]})
    .to_string()
}

fn timeout() -> Duration {
    Duration::from_secs(5)
}

fn assert_seeds(classifier: &dyn Classifier) {
    let out = classifier.classify(&request()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].keyword, "buy tomato seeds");
    assert_eq!(out[0].sub_cat_2, "Buying Seeds");
    assert_eq!(out[0].theme, "Purchasing seeds");
}

fn chat_envelope() -> String {
    json!({"id": "x", "choices": [{"index": 0, "message": {"role": "assistant", "content": answer()}}]}).to_string()
}

#[test]
fn openai_success() {
    let (url, seen) = serve(StatusCode::OK, chat_envelope());
    let classifier = ChatCompletions::openai("test-key".into(), &settings("gpt-4o-mini", &url), timeout()).unwrap();

    assert_seeds(&classifier);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "/chat/completions");
    assert_eq!(seen[0].1[header::AUTHORIZATION], "Bearer test-key");
}

#[test]
fn openai_status_codes() {
    let cases: [(StatusCode, fn(&ProviderError) -> bool); 3] = [
        (StatusCode::UNAUTHORIZED, |e| matches!(e, ProviderError::Auth(_))),
        (StatusCode::TOO_MANY_REQUESTS, |e| matches!(e, ProviderError::RateLimit(_))),
        (StatusCode::SERVICE_UNAVAILABLE, |e| matches!(e, ProviderError::Network(_))),
    ];
    for (status, expected) in cases {
        let (url, _) = serve(status, json!({"error": {"message": "nope"}}).to_string());
        let classifier =
            ChatCompletions::openai("test-key".into(), &settings("gpt-4o-mini", &url), timeout()).unwrap();

        let err = classifier.classify(&request()).unwrap_err();
        assert!(expected(&err), "{status}: {err:?}");
        assert_eq!(err.is_transient(), status != StatusCode::UNAUTHORIZED);
    }
}

#[test]
fn unexpected_envelope_is_malformed() {
    let (url, _) = serve(StatusCode::OK, json!({"unexpected": true}).to_string());
    let classifier = ChatCompletions::openai("test-key".into(), &settings("gpt-4o-mini", &url), timeout()).unwrap();
    assert!(matches!(
        classifier.classify(&request()),
        Err(ProviderError::Malformed(_))
    ));

    let empty = json!({"choices": [{"message": {"content": "  "}}]}).to_string();
    let (url, _) = serve(StatusCode::OK, empty);
    let classifier = ChatCompletions::openai("test-key".into(), &settings("gpt-4o-mini", &url), timeout()).unwrap();
    assert!(matches!(
        classifier.classify(&request()),
        Err(ProviderError::Malformed(_))
    ));
}

#[test]
fn mistral_uses_chat_completions() {
    if std::env::var(mistral::BASE_URL_ENV).is_ok() {
        return;
    }
    let (url, seen) = serve(StatusCode::OK, chat_envelope());
    let classifier = mistral::build("test-key".into(), &settings("mistral-large-latest", &url), timeout()).unwrap();

    assert_eq!(classifier.kind(), ProviderKind::Mistral);
    assert_seeds(&classifier);
    assert_eq!(seen.lock().unwrap()[0].0, "/chat/completions");
}

#[test]
fn gemini_success_and_auth() {
    let envelope = json!({"candidates": [{"content": {"role": "model", "parts": [{"text": answer()}]}}]});
    let (url, seen) = serve(StatusCode::OK, envelope.to_string());
    let classifier = GeminiClassifier::new("test-key".into(), &settings("gemini-1.5-flash", &url), timeout()).unwrap();

    assert_seeds(&classifier);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/models/gemini-1.5-flash:generateContent");
        assert_eq!(seen[0].1["x-goog-api-key"], "test-key");
    }

    let (url, _) = serve(StatusCode::FORBIDDEN, "{}".into());
    let classifier = GeminiClassifier::new("test-key".into(), &settings("gemini-1.5-flash", &url), timeout()).unwrap();
    assert!(matches!(classifier.classify(&request()), Err(ProviderError::Auth(_))));
}

#[test]
fn claude_success_and_overload() {
    let envelope = json!({
        "content": [{"type": "text", "text": answer()}],
        "stop_reason": "end_turn"
    });
    let (url, seen) = serve(StatusCode::OK, envelope.to_string());
    let classifier = ClaudeClassifier::new("test-key".into(), &settings("claude-3-5-haiku-latest", &url), timeout()).unwrap();

    assert_seeds(&classifier);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/messages");
        assert_eq!(seen[0].1["x-api-key"], "test-key");
        assert!(seen[0].1.contains_key("anthropic-version"));
    }

    // 529 overloaded
    let status = StatusCode::from_u16(529).unwrap();
    let (url, _) = serve(status, "{}".into());
    let classifier = ClaudeClassifier::new("test-key".into(), &settings("claude-3-5-haiku-latest", &url), timeout()).unwrap();
    let err = classifier.classify(&request()).unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}
