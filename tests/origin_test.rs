use arena_bridge::constants::*;
use arena_bridge::origin::*;

#[test]
fn test_non_web_urls_resolve_to_canonical() {
    for url in [None, Some(""), Some("   "), Some("about:blank"), Some("chrome://newtab"), Some("not a url")] {
        assert_eq!(detect_origin(url), CANONICAL_ORIGIN, "url {:?}", url);
    }
}

#[test]
fn test_detect_origin_strips_www_and_path() {
    assert_eq!(detect_origin(Some("https://lmarena.ai/?mode=direct")), "https://lmarena.ai");
    assert_eq!(detect_origin(Some("https://arena.ai/?mode=direct")), "https://arena.ai");
    assert_eq!(detect_origin(Some("https://www.arena.ai/foo")), "https://arena.ai");
}

#[test]
fn test_origin_candidates_prefer_detected_origin() {
    assert_eq!(
        origin_candidates(Some("https://arena.ai/nextjs-api/sign-up")),
        vec!["https://arena.ai", "https://lmarena.ai"]
    );
    assert_eq!(
        origin_candidates(Some("https://www.arena.ai/")),
        vec!["https://arena.ai", "https://lmarena.ai"]
    );
    assert_eq!(
        origin_candidates(Some("https://lmarena.ai/nextjs-api/stream/create-evaluation")),
        vec!["https://lmarena.ai", "https://arena.ai"]
    );
    assert_eq!(origin_candidates(None), vec!["https://lmarena.ai", "https://arena.ai"]);
}

#[test]
fn test_auth_cookie_specs_are_url_scoped_on_both_origins() {
    let specs = auth_cookie_specs("base64-token-1", Some("https://arena.ai/?mode=direct"));
    assert_eq!(specs.len(), 2);
    let urls: Vec<&str> = specs.iter().filter_map(|c| c.url()).collect();
    assert_eq!(urls, vec!["https://arena.ai", "https://lmarena.ai"]);
    for cookie in &specs {
        assert_eq!(cookie.name, AUTH_COOKIE_NAME);
        assert_eq!(cookie.value, "base64-token-1");
        assert_eq!(cookie.path, "/");
        assert!(cookie.domain().is_none());
    }

    for page in [None, Some("about:blank"), Some("https://lmarena.ai/")] {
        assert_eq!(auth_cookie_specs("t", page).len(), 2);
    }
}

#[test]
fn test_provisional_user_id_specs_cover_host_and_domain() {
    let specs = provisional_user_id_cookie_specs("prov-1", Some("https://lmarena.ai/?mode=direct"));
    assert_eq!(specs.len(), 4);

    let mut urls: Vec<&str> = specs.iter().filter_map(|c| c.url()).collect();
    let mut domains: Vec<&str> = specs.iter().filter_map(|c| c.domain()).collect();
    urls.sort();
    domains.sort();
    assert_eq!(urls, vec!["https://arena.ai", "https://lmarena.ai"]);
    assert_eq!(domains, vec![".arena.ai", ".lmarena.ai"]);
    assert!(specs.iter().all(|c| c.value == "prov-1" && c.path == "/"));
}
