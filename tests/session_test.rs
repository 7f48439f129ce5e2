use arena_bridge::browser::memory::MemoryBrowser;
use arena_bridge::constants::*;
use arena_bridge::direct::BrowserFetcher;
use arena_bridge::session::*;
use arena_bridge::StreamRequest;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_injects_auth_cookie_from_local_storage_session() {
    let browser = MemoryBrowser::new();
    browser.seed_local_storage(
        "sb-test-auth-token",
        r#"{"access_token":"a","refresh_token":"b","expires_at":9999999999}"#,
    );

    let injected = maybe_inject_auth_cookie_from_local_storage(&browser, &browser)
        .await
        .expect("session should be recovered");

    assert!(injected.starts_with(AUTH_COOKIE_ENCODING_PREFIX));
    let cookies = browser.cookies();
    assert_eq!(cookies.len(), 2);
    assert_eq!(browser.cookie_batches(), 1);
    let urls: Vec<&str> = cookies.iter().filter_map(|c| c.url()).collect();
    assert!(urls.contains(&CANONICAL_ORIGIN));
    assert!(urls.contains(&ALTERNATE_ORIGIN));
    for cookie in &cookies {
        assert_eq!(cookie.name, AUTH_COOKIE_NAME);
        assert_eq!(cookie.value, injected);
    }
}

#[tokio::test]
async fn test_malformed_or_missing_records_are_not_fatal() {
    let browser = MemoryBrowser::new();
    assert!(maybe_inject_auth_cookie_from_local_storage(&browser, &browser)
        .await
        .is_none());

    browser.seed_local_storage("sb-test-auth-token", "{not json");
    browser.seed_local_storage("sb-other-auth-token", r#"{"access_token":"only"}"#);
    browser.seed_local_storage("unrelated", r#"{"access_token":"a","refresh_token":"b","expires_in":1}"#);
    assert!(maybe_inject_auth_cookie_from_local_storage(&browser, &browser)
        .await
        .is_none());
    assert!(browser.cookies().is_empty());
}

#[tokio::test]
async fn test_sets_provisional_user_id_cookie_and_storage() {
    let browser = MemoryBrowser::with_url("https://lmarena.ai/?mode=direct");

    set_provisional_user_id(&browser, &browser, "prov-1").await.unwrap();

    let cookies = browser.cookies();
    assert_eq!(cookies.len(), 4);
    assert!(cookies
        .iter()
        .all(|c| c.value == "prov-1" && c.name == PROVISIONAL_USER_ID_COOKIE_NAME));
    let domains: Vec<&str> = cookies.iter().filter_map(|c| c.domain()).collect();
    assert!(domains.contains(&".lmarena.ai"));
    assert!(domains.contains(&".arena.ai"));

    assert_eq!(
        browser.storage_writes(),
        vec![(PROVISIONAL_USER_ID_STORAGE_KEY.to_string(), "prov-1".to_string())]
    );
}

#[tokio::test]
async fn test_prepare_session_prefers_request_token() {
    let browser = MemoryBrowser::new();
    browser.seed_local_storage(
        "sb-test-auth-token",
        r#"{"access_token":"a","refresh_token":"b","expires_at":9999999999}"#,
    );
    let fetcher = BrowserFetcher::new(Arc::new(browser.clone()), Arc::new(browser.clone()))
        .with_provisional_user_id(Some("prov-9".into()));

    let request = StreamRequest::new(
        "POST",
        "https://lmarena.ai/x",
        serde_json::Map::new(),
        "auth-token-1",
        Duration::from_secs(5),
    );
    fetcher.prepare_session(&request).await;

    let cookies = browser.cookies();
    let auth: Vec<_> = cookies.iter().filter(|c| c.name == AUTH_COOKIE_NAME).collect();
    assert_eq!(auth.len(), 2);
    assert!(auth.iter().all(|c| c.value == "auth-token-1"));
    assert_eq!(
        cookies
            .iter()
            .filter(|c| c.name == PROVISIONAL_USER_ID_COOKIE_NAME)
            .count(),
        4
    );
}
