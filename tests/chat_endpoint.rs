#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{body_json, chat_request, shared, test_config, MockBackend};
use folio_chat::completion::{CompletionBackend, CompletionRequest, UpstreamError, DEFAULT_MODELS};
use folio_chat::limiter::ManualClock;
use folio_chat::{app, AppState};
use serde_json::json;
use tower::ServiceExt; // for oneshot

fn not_available(model: &str) -> UpstreamError {
    UpstreamError::Status {
        status: 400,
        code: Some("model_decommissioned".into()),
        body: format!(r#"{{"error":{{"message":"The model `{model}` has been decommissioned","code":"model_decommissioned"}}}}"#),
    }
}

#[tokio::test]
async fn preflight_returns_allow_headers_without_calling_upstream() {
    let backend = shared(MockBackend::answering("unused"));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/api/chat")
        .header("origin", "https://folio.example.dev")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let h = resp.headers();
    assert_eq!(h[header::ACCESS_CONTROL_ALLOW_METHODS], "POST, OPTIONS");
    assert_eq!(h[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type, Authorization");
    assert_eq!(h[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://folio.example.dev");
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn other_methods_are_rejected_with_cors() {
    let backend = shared(MockBackend::answering("unused"));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let req = Request::builder()
        .method("GET")
        .uri("/api/chat")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://folio.example.dev"
    );
    assert_eq!(body_json(resp).await, json!({"error": "Method not allowed"}));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn answers_with_assembled_prompt() {
    let backend = shared(MockBackend::answering("  Alex mostly writes Rust.  "));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let body = json!({
        "message": "  What does Alex build?  ",
        "history": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "Hello!"},
            {"bogus": true}
        ]
    })
    .to_string();
    let resp = router.oneshot(chat_request("POST", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({"answer": "Alex mostly writes Rust.", "assistant": "Folio"})
    );

    assert_eq!(backend.models_called(), vec![DEFAULT_MODELS[0].to_string()]);
    let sent = &backend.requests()[0];
    assert!(sent.system.starts_with("You are Folio,"));
    assert!(sent.prompt.contains("Recent context:\nUSER: hi\nASSISTANT: Hello!"));
    assert!(sent.prompt.ends_with("USER: What does Alex build?\nASSISTANT:"));
    assert_eq!(sent.max_tokens, 500);
}

#[tokio::test]
async fn guard_rejections_map_to_client_errors() {
    let backend = shared(MockBackend::answering("unused"));
    let router = app(AppState::new(&test_config(), backend.clone()));

    let cases = [
        (json!({"history": []}), StatusCode::BAD_REQUEST, "Missing message"),
        (json!({"message": 42}), StatusCode::BAD_REQUEST, "Missing message"),
        (json!({"message": "   "}), StatusCode::BAD_REQUEST, "Message cannot be empty"),
        (
            json!({"message": "a".repeat(801)}),
            StatusCode::PAYLOAD_TOO_LARGE,
            "Message too long (max 800 characters)",
        ),
        (
            json!({"message": "claim your FREE MONEY today"}),
            StatusCode::BAD_REQUEST,
            "Message was rejected by the content filter",
        ),
    ];
    for (body, status, error) in cases {
        let resp = router
            .clone()
            .oneshot(chat_request("POST", &body.to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), status, "body {body}");
        assert_eq!(body_json(resp).await["error"], error);
    }
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let backend = shared(MockBackend::answering("unused"));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let resp = router
        .oneshot(chat_request("POST", "{\"message\": \"hi\""))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert_eq!(body_json(resp).await, json!({"error": "Invalid JSON body"}));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut cfg = test_config();
    cfg.max_request_bytes = 64;
    let backend = shared(MockBackend::answering("unused"));
    let router = app(AppState::new(&cfg, backend.clone()));
    let body = json!({"message": "x".repeat(200)}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("content-length", body.len().to_string())
        .body(Body::from(body))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn burst_is_limited_per_client_and_refills() {
    let backend = shared(MockBackend::answering("ok"));
    let clock = Arc::new(ManualClock::new());
    let router = app(AppState::with_clock(&test_config(), backend.clone(), clock.clone()));
    let body = json!({"message": "hello"}).to_string();

    let send = |ip: &'static str| {
        let router = router.clone();
        let body = body.clone();
        async move {
            let mut req = chat_request("POST", &body);
            req.headers_mut()
                .insert("x-forwarded-for", ip.parse().unwrap());
            router.oneshot(req).await.unwrap()
        }
    };

    for _ in 0..16 {
        assert_eq!(send("198.51.100.1").await.status(), StatusCode::OK);
    }
    let denied = send("198.51.100.1").await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denied.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert_eq!(backend.call_count(), 16);

    // A different client has its own bucket.
    assert_eq!(send("198.51.100.2").await.status(), StatusCode::OK);

    // 8 tokens per minute: one token back after 7.5 seconds.
    clock.advance(Duration::from_millis(7_500));
    assert_eq!(send("198.51.100.1").await.status(), StatusCode::OK);
    assert_eq!(
        send("198.51.100.1").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn rate_limit_runs_before_validation() {
    let backend = shared(MockBackend::answering("ok"));
    let clock = Arc::new(ManualClock::new());
    let router = app(AppState::with_clock(&test_config(), backend.clone(), clock));
    for _ in 0..16 {
        let resp = router
            .clone()
            .oneshot(chat_request("POST", "not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
    let resp = router
        .oneshot(chat_request("POST", "not json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn falls_back_across_unavailable_models() {
    let backend = shared(
        MockBackend::answering("from the last model")
            .with(DEFAULT_MODELS[0], Err(not_available(DEFAULT_MODELS[0])))
            .with(DEFAULT_MODELS[1], Ok(None)),
    );
    let router = app(AppState::new(&test_config(), backend.clone()));
    let resp = router
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["answer"], "from the last model");
    assert_eq!(backend.models_called(), DEFAULT_MODELS.to_vec());
}

#[tokio::test]
async fn exhausted_candidates_report_last_error() {
    let backend = shared(
        MockBackend::answering("unused")
            .with(DEFAULT_MODELS[0], Err(not_available(DEFAULT_MODELS[0])))
            .with(DEFAULT_MODELS[1], Err(not_available(DEFAULT_MODELS[1])))
            .with(DEFAULT_MODELS[2], Ok(Some("   ".into()))),
    );
    let router = app(AppState::new(&test_config(), backend.clone()));
    let resp = router
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "All models failed");
    assert_eq!(json["detail"], format!("{}: empty response", DEFAULT_MODELS[2]));
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test]
async fn fatal_upstream_error_stops_fallback() {
    let backend = shared(MockBackend::answering("unused").with(
        DEFAULT_MODELS[0],
        Err(UpstreamError::Status {
            status: 401,
            code: Some("invalid_api_key".into()),
            body: r#"{"error":{"message":"Invalid API Key","code":"invalid_api_key"}}"#.into(),
        }),
    ));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let resp = router
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(resp).await;
    assert_eq!(json["error"], "Upstream request failed");
    assert!(json["detail"].as_str().unwrap().contains("401"));
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn model_override_is_tried_first() {
    let mut cfg = test_config();
    cfg.model_override = Some("my-fine-tune".into());
    let backend = shared(
        MockBackend::answering("fallback answer").with("my-fine-tune", Ok(None)),
    );
    let router = app(AppState::new(&cfg, backend.clone()));
    let resp = router
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        backend.models_called(),
        vec!["my-fine-tune".to_string(), DEFAULT_MODELS[0].to_string()]
    );
}

#[tokio::test]
async fn allowed_origin_is_echoed_and_others_get_default() {
    let mut cfg = test_config();
    cfg.allowed_origin_prefix = "http://localhost".into();
    let backend = shared(MockBackend::answering("ok"));
    let router = app(AppState::new(&cfg, backend));

    for (origin, expected) in [
        ("http://localhost:5173", "http://localhost:5173"),
        ("https://attacker.example", "https://folio.example.dev"),
    ] {
        let mut req = chat_request("POST", r#"{"message":"hi"}"#);
        req.headers_mut().insert("origin", origin.parse().unwrap());
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], expected);
        assert_eq!(resp.headers()[header::VARY], "origin");
    }
}

#[tokio::test]
async fn flavored_answers_keep_the_model_text() {
    let mut cfg = test_config();
    cfg.flavor_enabled = true;
    cfg.flavor_seed = Some(7);
    let backend = shared(MockBackend::answering("Alex enjoys performance work."));
    let router = app(AppState::new(&cfg, backend));
    let resp = router
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let answer = body_json(resp).await["answer"].as_str().unwrap().to_string();
    assert!(answer.contains("Alex enjoys performance work."));
}

#[tokio::test]
async fn long_history_is_accepted_and_windowed() {
    let backend = shared(MockBackend::answering("ok"));
    let router = app(AppState::new(&test_config(), backend.clone()));
    let history: Vec<_> = (0..20)
        .map(|i| {
            json!({
                "role": if i % 2 == 0 { "user" } else { "assistant" },
                "content": format!("turn-{i:02} {}", "x".repeat(2000)),
            })
        })
        .collect();
    let body = json!({"message": "hi", "history": history}).to_string();
    assert!(body.len() > 40_000);

    let resp = router.oneshot(chat_request("POST", &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let prompt = &backend.requests()[0].prompt;
    assert!(!prompt.contains("turn-13 "));
    for i in 14..20 {
        assert!(prompt.contains(&format!("turn-{i:02} ")), "turn {i} missing");
    }
}

#[tokio::test]
async fn denied_client_gets_429_before_body_is_read() {
    let mut cfg = test_config();
    cfg.rate_limit.capacity = 1.0;
    cfg.max_request_bytes = 64;
    let backend = shared(MockBackend::answering("ok"));
    let clock = Arc::new(ManualClock::new());
    let router = app(AppState::with_clock(&cfg, backend.clone(), clock));

    let resp = router
        .clone()
        .oneshot(chat_request("POST", r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let oversized = json!({"message": "x".repeat(500)}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("content-length", oversized.len().to_string())
        .body(Body::from(oversized))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(backend.call_count(), 1);
}

struct Exploding;

#[async_trait]
impl CompletionBackend for Exploding {
    async fn complete(
        &self,
        _model: &str,
        _request: &CompletionRequest,
    ) -> Result<Option<String>, UpstreamError> {
        panic!("backend exploded");
    }
}

#[tokio::test]
async fn unexpected_panic_becomes_500_with_cors() {
    let router = app(AppState::new(&test_config(), Arc::new(Exploding)));
    let mut req = chat_request("POST", r#"{"message":"hi"}"#);
    req.headers_mut()
        .insert("origin", "https://folio.example.dev".parse().unwrap());
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://folio.example.dev"
    );
    assert_eq!(
        body_json(resp).await,
        json!({"error": "Internal error", "detail": "backend exploded"})
    );
}
