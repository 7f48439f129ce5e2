//! reCAPTCHA v3 tokens for the create-evaluation payload, minted inside the attached page.

use crate::browser::Page;
use crate::types::{BridgeError, Result};
use serde_json::{json, Value};
use std::sync::Arc;

pub const RECAPTCHA_SCRIPT: &str = r#"async ({siteKey, action}) => {
  const g = window.grecaptcha;
  const api = g && (g.enterprise || g);
  if (!api || typeof api.execute !== "function") return {error: "grecaptcha is not loaded"};
  await new Promise((resolve) => (typeof api.ready === "function" ? api.ready(resolve) : resolve()));
  try {
    return {token: await api.execute(siteKey, {action})};
  } catch (e) {
    return {error: String(e)};
  }
}"#;

pub struct RecaptchaMinter {
    page: Arc<dyn Page>,
    site_key: String,
    action: String,
}

impl RecaptchaMinter {
    pub fn new(page: Arc<dyn Page>, site_key: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            page,
            site_key: site_key.into(),
            action: action.into(),
        }
    }

    /// Runs `grecaptcha.execute` in-page. Errors when the page has no usable grecaptcha.
    pub async fn mint(&self) -> Result<String> {
        let result = self
            .page
            .evaluate(
                RECAPTCHA_SCRIPT,
                json!({"siteKey": self.site_key, "action": self.action}),
            )
            .await?;
        if let Some(err) = result.get("error").and_then(Value::as_str) {
            return Err(BridgeError::Browser(format!("recaptcha: {}", err)).into());
        }
        match result.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(BridgeError::Browser("recaptcha returned no token".into()).into()),
        }
    }
}
