//! Origin detection and origin-scoped cookie descriptors.
//!
//! The backend serves the same application from two origins and trusts session cookies on
//! either. Every credential is therefore installed once per known origin so it is visible
//! no matter which origin the automated page currently sits on.

use crate::constants::{
    ALTERNATE_ORIGIN, AUTH_COOKIE_NAME, CANONICAL_ORIGIN, KNOWN_ORIGINS,
    PROVISIONAL_USER_ID_COOKIE_NAME,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Where a cookie applies. Exactly one of `url` or `domain` is ever serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieScope {
    /// Host-exact: only the origin's own host sees the cookie.
    Url(String),
    /// Domain-wide (leading dot): every subdomain sees the cookie.
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    pub path: String,
    #[serde(flatten)]
    pub scope: CookieScope,
}

impl CookieSpec {
    pub fn for_url(name: &str, value: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            path: "/".to_string(),
            scope: CookieScope::Url(url.to_string()),
        }
    }

    pub fn for_domain(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            path: "/".to_string(),
            scope: CookieScope::Domain(domain.to_string()),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.scope {
            CookieScope::Url(u) => Some(u),
            CookieScope::Domain(_) => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match &self.scope {
            CookieScope::Domain(d) => Some(d),
            CookieScope::Url(_) => None,
        }
    }
}

/// Canonical origin for blank/non-web URLs, otherwise `scheme://host[:port]` with `www.` stripped.
pub fn detect_origin(page_url: Option<&str>) -> String {
    let raw = match page_url.map(str::trim) {
        Some(u) if !u.is_empty() => u,
        _ => return CANONICAL_ORIGIN.to_string(),
    };

    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return CANONICAL_ORIGIN.to_string(),
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return CANONICAL_ORIGIN.to_string();
    }

    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
        _ => return CANONICAL_ORIGIN.to_string(),
    };
    let host = host.strip_prefix("www.").unwrap_or(&host);

    match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    }
}

/// The detected origin first, then the other known origin(s), without duplicates.
pub fn origin_candidates(url: Option<&str>) -> Vec<String> {
    let detected = detect_origin(url);
    let mut out = vec![detected];
    for origin in KNOWN_ORIGINS {
        if !out.iter().any(|o| o == origin) {
            out.push(origin.to_string());
        }
    }
    out
}

/// Origins to scope cookies to: the detected one first when it is a known origin, otherwise
/// the fixed canonical/alternate order. Cookies are never scoped to foreign origins.
fn cookie_origins(page_url: Option<&str>) -> Vec<String> {
    let detected = detect_origin(page_url);
    if detected == ALTERNATE_ORIGIN {
        vec![ALTERNATE_ORIGIN.to_string(), CANONICAL_ORIGIN.to_string()]
    } else {
        vec![CANONICAL_ORIGIN.to_string(), ALTERNATE_ORIGIN.to_string()]
    }
}

fn origin_host(origin: &str) -> Option<String> {
    Url::parse(origin)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// One host-exact descriptor per known origin. The auth cookie is never domain-wide.
pub fn auth_cookie_specs(token_value: &str, page_url: Option<&str>) -> Vec<CookieSpec> {
    cookie_origins(page_url)
        .iter()
        .map(|origin| CookieSpec::for_url(AUTH_COOKIE_NAME, token_value, origin))
        .collect()
}

/// Host-exact plus domain-wide descriptors per known origin, so the id survives
/// subdomain navigation.
pub fn provisional_user_id_cookie_specs(value: &str, page_url: Option<&str>) -> Vec<CookieSpec> {
    let mut specs = Vec::with_capacity(KNOWN_ORIGINS.len() * 2);
    for origin in cookie_origins(page_url) {
        specs.push(CookieSpec::for_url(
            PROVISIONAL_USER_ID_COOKIE_NAME,
            value,
            &origin,
        ));
        if let Some(host) = origin_host(&origin) {
            specs.push(CookieSpec::for_domain(
                PROVISIONAL_USER_ID_COOKIE_NAME,
                value,
                &format!(".{}", host),
            ));
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_spec_serializes_single_scope_field() {
        let spec = CookieSpec::for_domain("n", "v", ".arena.ai");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["domain"], ".arena.ai");
        assert!(json.get("url").is_none());
        assert_eq!(json["path"], "/");

        let spec = CookieSpec::for_url("n", "v", "https://arena.ai");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["url"], "https://arena.ai");
        assert!(json.get("domain").is_none());
    }

    #[test]
    fn test_detect_origin_keeps_explicit_port() {
        assert_eq!(
            detect_origin(Some("http://localhost:3000/x")),
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_origin_candidates_for_foreign_origin() {
        assert_eq!(
            origin_candidates(Some("https://example.com/")),
            vec![
                "https://example.com".to_string(),
                CANONICAL_ORIGIN.to_string(),
                ALTERNATE_ORIGIN.to_string()
            ]
        );
    }
}
