//! Browser-side session state: auth cookie recovery from localStorage and provisional user
//! id synchronisation.

use crate::browser::{CookieJar, Page};
use crate::constants::{
    AUTH_COOKIE_ENCODING_PREFIX, PROVISIONAL_USER_ID_STORAGE_KEY, SESSION_STORAGE_KEY_PATTERN,
};
use crate::origin::{auth_cookie_specs, provisional_user_id_cookie_specs};
use crate::types::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

lazy_static! {
    static ref SESSION_KEY_REGEX: Regex =
        Regex::new(SESSION_STORAGE_KEY_PATTERN).expect("Invalid session key regex");
}

/// Normalised session envelope, in the field order the backend's client library writes.
#[derive(Debug, Serialize)]
struct SessionEnvelope {
    access_token: String,
    token_type: String,
    expires_in: i64,
    expires_at: i64,
    refresh_token: String,
    user: Value,
}

/// Records may be stored bare or wrapped (`{"currentSession": {...}}`).
fn unwrap_session(record: &Value) -> Option<&Value> {
    if record.get("access_token").is_some() {
        return Some(record);
    }
    ["currentSession", "session"]
        .iter()
        .find_map(|k| record.get(*k))
        .filter(|v| v.get("access_token").is_some())
}

fn normalize_session(raw: &str) -> Option<SessionEnvelope> {
    let record: Value = serde_json::from_str(raw).ok()?;
    let session = unwrap_session(&record)?;

    let access_token = session
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    let refresh_token = session
        .get("refresh_token")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();

    let now = chrono::Utc::now().timestamp();
    let expires_at = session.get("expires_at").and_then(Value::as_i64);
    let expires_in = session.get("expires_in").and_then(Value::as_i64);
    let (expires_at, expires_in) = match (expires_at, expires_in) {
        (Some(at), Some(inn)) => (at, inn),
        (Some(at), None) => (at, (at - now).max(0)),
        (None, Some(inn)) => (now + inn, inn),
        (None, None) => return None,
    };

    Some(SessionEnvelope {
        access_token,
        token_type: session
            .get("token_type")
            .and_then(Value::as_str)
            .unwrap_or("bearer")
            .to_string(),
        expires_in,
        expires_at,
        refresh_token,
        user: session.get("user").cloned().unwrap_or(Value::Null),
    })
}

/// Encodes a normalised session the way the backend expects its auth cookie.
fn encode_session(envelope: &SessionEnvelope) -> Option<String> {
    let json = serde_json::to_string(envelope).ok()?;
    Some(format!(
        "{}{}",
        AUTH_COOKIE_ENCODING_PREFIX,
        URL_SAFE_NO_PAD.encode(json.as_bytes())
    ))
}

/// Installs `token` as the auth cookie on both known origins.
pub async fn install_auth_cookie(page: &dyn Page, jar: &dyn CookieJar, token: &str) -> Result<()> {
    let page_url = page.url().await;
    let specs = auth_cookie_specs(token, page_url.as_deref());
    jar.add_cookies(&specs).await
}

/// Rebuilds the auth cookie from a session record left in localStorage.
///
/// Returns the encoded cookie value, or `None` when no usable record exists. Malformed
/// records and browser errors count as "nothing found"; they never fail the caller.
pub async fn maybe_inject_auth_cookie_from_local_storage(
    page: &dyn Page,
    jar: &dyn CookieJar,
) -> Option<String> {
    let storage = match page.local_storage().await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("[session] localStorage unreadable: {}", e);
            return None;
        }
    };

    let mut keys: Vec<&String> = storage
        .keys()
        .filter(|k| SESSION_KEY_REGEX.is_match(k))
        .collect();
    keys.sort();

    let encoded = keys
        .into_iter()
        .filter_map(|k| storage.get(k))
        .filter_map(|raw| normalize_session(raw))
        .find_map(|envelope| encode_session(&envelope))?;

    if let Err(e) = install_auth_cookie(page, jar, &encoded).await {
        tracing::warn!("[session] Recovered session but cookie install failed: {}", e);
        return None;
    }

    tracing::info!("[session] Recovered auth cookie from localStorage session");
    Some(encoded)
}

/// Installs the provisional user id as cookies (host-exact and domain-wide on both origins)
/// and as a localStorage entry. Both writes complete before this returns.
pub async fn set_provisional_user_id(
    page: &dyn Page,
    jar: &dyn CookieJar,
    value: &str,
) -> Result<()> {
    let page_url = page.url().await;
    let specs = provisional_user_id_cookie_specs(value, page_url.as_deref());
    tokio::try_join!(
        jar.add_cookies(&specs),
        page.set_local_storage(PROVISIONAL_USER_ID_STORAGE_KEY, value),
    )?;
    tracing::debug!("[session] Provisional user id synchronised");
    Ok(())
}
