use arena_bridge::browser::memory::{MemoryBrowser, MemoryEvaluation};
use arena_bridge::constants::BACKGROUND_TASK_REAP_SECS;
use arena_bridge::direct::BrowserFetcher;
use arena_bridge::stream_response::Terminal;
use arena_bridge::{BridgeError, FetchPath, Result, StreamRequest};
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const META: &str = r#"{"__type":"meta","status":200,"headers":{}}"#;

fn request() -> StreamRequest {
    let mut payload = serde_json::Map::new();
    payload.insert("recaptchaV3Token".into(), "payload-token".into());
    StreamRequest::new(
        "POST",
        "https://lmarena.ai/api",
        payload,
        "token",
        Duration::from_secs(2),
    )
}

fn binding_of(ev: &MemoryEvaluation) -> String {
    ev.arg["binding"].as_str().unwrap_or_default().to_string()
}

fn fetcher(browser: &MemoryBrowser) -> BrowserFetcher {
    BrowserFetcher::new(Arc::new(browser.clone()), Arc::new(browser.clone()))
}

async fn status_chunk_then_close(ev: MemoryEvaluation, gate: Arc<Notify>) -> Result<Value> {
    assert!(ev
        .script
        .trim_start()
        .starts_with("async ({url, method, body, extraHeaders"));
    assert_eq!(ev.arg["body"]["recaptchaV3Token"], "payload-token");
    let binding = binding_of(&ev);
    ev.call_binding(&binding, META)?;
    ev.call_binding(&binding, "data: hi")?;
    gate.notified().await;
    Err(BridgeError::PageClosed("Target page, context or browser has been closed".into()).into())
}

async fn close_immediately(_ev: MemoryEvaluation) -> Result<Value> {
    Err(BridgeError::PageClosed("context closed".into()).into())
}

async fn three_lines(ev: MemoryEvaluation) -> Result<Value> {
    let binding = binding_of(&ev);
    ev.call_binding(&binding, r#"{"__type":"meta","status":201,"headers":{"x-a":"1"}}"#)?;
    for line in ["one", "two", "three"] {
        ev.call_binding(&binding, line)?;
    }
    Ok(serde_json::json!({"ok": true}))
}

async fn never_reports(_ev: MemoryEvaluation) -> Result<Value> {
    futures_util::future::pending::<()>().await;
    Ok(Value::Null)
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn status_then_hang(ev: MemoryEvaluation, dropped: Arc<AtomicBool>) -> Result<Value> {
    let _flag = SetOnDrop(dropped);
    let binding = binding_of(&ev);
    ev.call_binding(&binding, META)?;
    ev.call_binding(&binding, "data: partial")?;
    futures_util::future::pending::<()>().await;
    Ok(Value::Null)
}

fn past_reap() -> Duration {
    Duration::from_secs(BACKGROUND_TASK_REAP_SECS + 5)
}

#[tokio::test]
async fn test_page_closing_after_status_is_recorded_on_body() {
    let browser = MemoryBrowser::new();
    let allow_finish = Arc::new(Notify::new());
    let gate = allow_finish.clone();
    browser.on_evaluate(move |ev| status_chunk_then_close(ev, gate.clone()).boxed());

    let mut response = fetcher(&browser)
        .fetch(&request(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.path(), FetchPath::Direct);
    assert!(response.terminal().is_none());

    allow_finish.notify_one();
    let data = response.read_all().await;
    assert!(String::from_utf8_lossy(&data).contains("data: hi"));

    match response.terminal() {
        Some(Terminal::Failed(reason)) => assert!(reason.contains("has been closed")),
        other => panic!("expected failed body, got {:?}", other),
    }
    assert!(response.failure().is_some());
    assert!(browser.exposed_bindings().is_empty());
}

#[tokio::test]
async fn test_failure_before_status_is_hard_error() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| close_immediately(ev).boxed());

    let err = fetcher(&browser)
        .fetch(&request(), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err.inner, BridgeError::PageClosed(_)));
    assert!(browser.exposed_bindings().is_empty());
}

#[tokio::test]
async fn test_lines_are_delivered_in_order_and_complete() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| three_lines(ev).boxed());

    let mut response = fetcher(&browser)
        .fetch(&request(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.header("x-a"), Some("1"));
    assert_eq!(&response.read_all().await[..], b"one\ntwo\nthree\n");
    assert_eq!(response.terminal(), Some(&Terminal::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_no_status_times_out() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| never_reports(ev).boxed());

    let err = fetcher(&browser)
        .fetch(&request(), Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err.inner, BridgeError::StatusTimeout(_)));
    assert!(browser.exposed_bindings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_caller_giving_up_before_status_still_removes_binding() {
    let browser = MemoryBrowser::new();
    browser.on_evaluate(|ev| never_reports(ev).boxed());
    let fetcher = fetcher(&browser);

    let waited = tokio::time::timeout(
        Duration::from_secs(1),
        fetcher.fetch(&request(), Duration::from_secs(60)),
    )
    .await;
    assert!(waited.is_err());
    assert_eq!(browser.exposed_bindings().len(), 1);

    tokio::time::sleep(past_reap()).await;
    assert!(browser.exposed_bindings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_response_driver_is_reaped() {
    let browser = MemoryBrowser::new();
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    browser.on_evaluate(move |ev| status_then_hang(ev, flag.clone()).boxed());

    let response = fetcher(&browser)
        .fetch(&request(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    drop(response);

    tokio::task::yield_now().await;
    assert!(!dropped.load(Ordering::SeqCst));

    tokio::time::sleep(past_reap()).await;
    assert!(dropped.load(Ordering::SeqCst));
    assert!(browser.exposed_bindings().is_empty());
}
