use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How aggressively payloads are scrubbed before they reach a log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    /// Credentials and every user message.
    Strict,
    /// Credentials and oversized message bodies.
    Normal,
    /// Credentials only.
    Minimal,
}

impl RedactionLevel {
    fn from_env_value(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Self::Strict,
            "minimal" => Self::Minimal,
            _ => Self::Normal,
        }
    }
}

impl Default for RedactionLevel {
    fn default() -> Self {
        std::env::var("REDACTION_LEVEL")
            .map(|raw| Self::from_env_value(&raw))
            .unwrap_or(Self::Normal)
    }
}

const SECRET_KEY_PARTS: &[&str] = &[
    "key",
    "auth",
    "token",
    "secret",
    "password",
    "cookie",
    "recaptcha",
    "provisional",
];

const LARGE_CONTENT_CHARS: usize = 2000;

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_PARTS.iter().any(|part| key.contains(part))
}

fn scrub_content(val: &Value, level: RedactionLevel) -> Option<&'static str> {
    match level {
        RedactionLevel::Strict => Some("[REDACTED-STRICT]"),
        RedactionLevel::Normal
            if val.as_str().is_some_and(|s| s.len() > LARGE_CONTENT_CHARS) =>
        {
            Some("[REDACTED-LARGE-CONTENT]")
        }
        _ => None,
    }
}

/// Replaces secrets in a JSON payload before it is logged.
pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_key(k) {
                    *val = Value::String("[REDACTED]".into());
                } else if k.eq_ignore_ascii_case("content") {
                    match scrub_content(val, level) {
                        Some(marker) => *val = Value::String(marker.into()),
                        None => redact_value(val, level),
                    }
                } else {
                    redact_value(val, level);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| redact_value(item, level)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_tokens_and_cookies() {
        let mut v = json!({
            "auth_token": "base64-abc",
            "payload": {"recaptchaV3Token": "x", "userMessage": {"content": "hi"}},
            "cookies": [{"name": "a"}],
            "provisional_user_id": "p",
        });
        redact_value(&mut v, RedactionLevel::Normal);
        assert_eq!(v["auth_token"], "[REDACTED]");
        assert_eq!(v["payload"]["recaptchaV3Token"], "[REDACTED]");
        assert_eq!(v["cookies"], "[REDACTED]");
        assert_eq!(v["provisional_user_id"], "[REDACTED]");
        assert_eq!(v["payload"]["userMessage"]["content"], "hi");
    }

    #[test]
    fn test_strict_hides_prompt() {
        let mut v = json!({"userMessage": {"content": "secret plan"}});
        redact_value(&mut v, RedactionLevel::Strict);
        assert_eq!(v["userMessage"]["content"], "[REDACTED-STRICT]");
    }
}
