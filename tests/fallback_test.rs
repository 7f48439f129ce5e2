use arena_bridge::browser::memory::{MemoryBrowser, MemoryEvaluation};
use arena_bridge::config::{ApiKeyConfig, BridgeConfig};
use arena_bridge::constants::AUTH_COOKIE_NAME;
use arena_bridge::direct::BrowserFetcher;
use arena_bridge::{AppState, Args, FetchPath, Result};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const STRICT_MODEL: &str = "gemini-3-pro-grounding";

fn test_config() -> BridgeConfig {
    BridgeConfig {
        auth_tokens: vec!["auth-token-1".into()],
        api_keys: vec![ApiKeyConfig {
            name: "Test".into(),
            key: "test-key".into(),
            rpm: 999,
        }],
        strict_relay_models: vec![STRICT_MODEL.into()],
        relay_status_timeout_seconds: 5,
        relay_pickup_timeout_seconds: 10,
        relay_active_window_seconds: 3,
        ..BridgeConfig::default()
    }
}

async fn backend_says_hello(ev: MemoryEvaluation) -> Result<Value> {
    assert_eq!(ev.arg["body"]["modelAId"], STRICT_MODEL);
    let binding = ev.arg["binding"].as_str().unwrap_or_default().to_string();
    ev.call_binding(&binding, r#"{"__type":"meta","status":200,"headers":{}}"#)?;
    ev.call_binding(&binding, r#"a0:"Hello""#)?;
    ev.call_binding(&binding, r#"ad:{"finishReason":"stop"}"#)?;
    Ok(json!({"ok": true}))
}

async fn page_gone(_ev: MemoryEvaluation) -> Result<Value> {
    Err(arena_bridge::BridgeError::PageClosed("gone".into()).into())
}

fn chat_request(stream: bool) -> Request<Body> {
    let body = json!({
        "model": STRICT_MODEL,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    Request::builder()
        .method("POST")
        .uri("/api/v1/chat/completions")
        .header("authorization", "Bearer test-key")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_stalled_relay_falls_back_to_browser() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| backend_says_hello(ev).boxed());
    let fetcher = Arc::new(BrowserFetcher::new(
        Arc::new(browser.clone()),
        Arc::new(browser.clone()),
    ));
    let state = Arc::new(AppState::new(test_config(), Args::default(), Some(fetcher)));
    state.arbiter.health().touch();

    // A relay agent that claims the job and then never reports a status.
    let jobs = state.arbiter.jobs().clone();
    let agent = tokio::spawn(async move {
        loop {
            if let Some(job) = jobs.claim_next("stalled-agent") {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let app = arena_bridge::server::router(state.clone());
    let response = app.oneshot(chat_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("Hello"), "body: {}", text);
    assert!(text.contains("[DONE]"), "body: {}", text);

    let claimed = agent.await.unwrap();
    assert_eq!(claimed.auth_token, "auth-token-1");
    assert!(state.arbiter.jobs().is_empty());
    assert!(!state.arbiter.health().is_active());

    let cookies = browser.cookies();
    assert!(cookies
        .iter()
        .any(|c| c.name == AUTH_COOKIE_NAME && c.value == "auth-token-1"));
}

#[tokio::test(start_paused = true)]
async fn test_non_strict_model_goes_straight_to_browser() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| backend_says_hello(ev).boxed());
    let fetcher = Arc::new(BrowserFetcher::new(
        Arc::new(browser.clone()),
        Arc::new(browser.clone()),
    ));
    let config = BridgeConfig {
        strict_relay_models: vec![],
        ..test_config()
    };
    let state = Arc::new(AppState::new(config, Args::default(), Some(fetcher)));
    state.arbiter.health().touch();

    let app = arena_bridge::server::router(state.clone());
    let response = app.oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let completion: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["choices"][0]["message"]["content"], "Hello");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    assert!(state.arbiter.jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_both_paths_failing_is_single_error() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| page_gone(ev).boxed());
    let fetcher = Arc::new(BrowserFetcher::new(
        Arc::new(browser.clone()),
        Arc::new(browser.clone()),
    ));
    let state = Arc::new(AppState::new(test_config(), Args::default(), Some(fetcher)));
    state.arbiter.health().touch();

    let app = arena_bridge::server::router(state.clone());
    let response = app.oneshot(chat_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["error"]["code"], "ALL_PATHS_FAILED");
    // Nobody picked the relay job up.
    assert!(!state.arbiter.health().is_active());
}

#[tokio::test(start_paused = true)]
async fn test_polling_agent_that_stalls_is_not_routed_to_again() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| backend_says_hello(ev).boxed());
    let fetcher = Arc::new(BrowserFetcher::new(
        Arc::new(browser.clone()),
        Arc::new(browser.clone()),
    ));
    let config = BridgeConfig {
        auth_tokens: vec!["auth-token-1".into()],
        api_keys: vec![ApiKeyConfig {
            name: "Test".into(),
            key: "test-key".into(),
            rpm: 999,
        }],
        strict_relay_models: vec![STRICT_MODEL.into()],
        ..BridgeConfig::default()
    };
    let state = Arc::new(AppState::new(config, Args::default(), Some(fetcher)));
    state.arbiter.health().touch();

    // Keeps polling and claiming, but never reports a status for anything it takes.
    let jobs = state.arbiter.jobs().clone();
    let agent = tokio::spawn(async move {
        let mut claimed = 0usize;
        loop {
            if jobs.claim_next("stalled-agent").is_some() {
                claimed += 1;
            }
            if claimed > 1 {
                return claimed;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });

    let app = arena_bridge::server::router(state.clone());
    let response = app.clone().oneshot(chat_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("Hello"), "body: {}", text);
    assert!(text.contains("[DONE]"), "body: {}", text);

    // Give the agent a few more polls.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!state.arbiter.health().is_active());
    assert_eq!(state.arbiter.first_path(STRICT_MODEL), FetchPath::Direct);

    let started = tokio::time::Instant::now();
    let response = app.oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(state.arbiter.jobs().is_empty());

    assert!(!agent.is_finished());
    agent.abort();
}
