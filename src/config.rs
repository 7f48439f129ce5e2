use crate::constants::*;
use crate::types::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    pub rpm: u32,
}

fn default_pickup_timeout() -> u64 {
    DEFAULT_RELAY_PICKUP_TIMEOUT_SECS
}
fn default_status_timeout() -> u64 {
    DEFAULT_RELAY_STATUS_TIMEOUT_SECS
}
fn default_active_window() -> u64 {
    DEFAULT_RELAY_ACTIVE_WINDOW_SECS
}
fn default_grace() -> u64 {
    DEFAULT_RELAY_JOB_GRACE_SECS
}
fn default_direct_timeout() -> u64 {
    DEFAULT_DIRECT_STATUS_TIMEOUT_SECS
}
fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_recaptcha_action() -> String {
    DEFAULT_RECAPTCHA_ACTION.to_string()
}
fn default_true() -> bool {
    true
}

/// Bridge settings read from the JSON config file. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Models that go through the relay first whenever it is active.
    #[serde(default)]
    pub strict_relay_models: Vec<String>,
    #[serde(default = "default_true")]
    pub relay_enabled: bool,
    #[serde(default = "default_pickup_timeout")]
    pub relay_pickup_timeout_seconds: u64,
    #[serde(default = "default_status_timeout")]
    pub relay_status_timeout_seconds: u64,
    #[serde(default = "default_active_window")]
    pub relay_active_window_seconds: u64,
    #[serde(default = "default_grace")]
    pub relay_job_grace_seconds: u64,
    #[serde(default = "default_direct_timeout")]
    pub direct_status_timeout_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub provisional_user_id: Option<String>,
    /// When set, each request gets a reCAPTCHA v3 token minted in the attached page.
    #[serde(default)]
    pub recaptcha_site_key: Option<String>,
    #[serde(default = "default_recaptcha_action")]
    pub recaptcha_action: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            auth_tokens: Vec::new(),
            api_keys: Vec::new(),
            strict_relay_models: Vec::new(),
            relay_enabled: true,
            relay_pickup_timeout_seconds: DEFAULT_RELAY_PICKUP_TIMEOUT_SECS,
            relay_status_timeout_seconds: DEFAULT_RELAY_STATUS_TIMEOUT_SECS,
            relay_active_window_seconds: DEFAULT_RELAY_ACTIVE_WINDOW_SECS,
            relay_job_grace_seconds: DEFAULT_RELAY_JOB_GRACE_SECS,
            direct_status_timeout_seconds: DEFAULT_DIRECT_STATUS_TIMEOUT_SECS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
            provisional_user_id: None,
            recaptcha_site_key: None,
            recaptcha_action: DEFAULT_RECAPTCHA_ACTION.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Reads the config file. A missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("relay_pickup_timeout_seconds", self.relay_pickup_timeout_seconds),
            ("relay_status_timeout_seconds", self.relay_status_timeout_seconds),
            ("relay_active_window_seconds", self.relay_active_window_seconds),
            ("direct_status_timeout_seconds", self.direct_status_timeout_seconds),
            ("request_timeout_seconds", self.request_timeout_seconds),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(BridgeError::Config(format!("{} must be positive", name)).into());
        }
        if let Some(key) = self.api_keys.iter().find(|k| k.rpm == 0) {
            return Err(BridgeError::Config(format!("api key '{}' has rpm 0", key.name)).into());
        }
        Ok(())
    }

    pub fn pickup_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_pickup_timeout_seconds)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_status_timeout_seconds)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.relay_active_window_seconds)
    }

    pub fn job_grace(&self) -> Duration {
        Duration::from_secs(self.relay_job_grace_seconds)
    }

    pub fn direct_status_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_status_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"auth_tokens":["t1"],"api_keys":[{{"name":"Test","key":"k","rpm":5}}],"relay_status_timeout_seconds":5}}"#
        )
        .unwrap();
        let config = BridgeConfig::load(file.path()).await.unwrap();
        assert_eq!(config.auth_tokens, vec!["t1".to_string()]);
        assert_eq!(config.status_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.relay_pickup_timeout_seconds,
            DEFAULT_RELAY_PICKUP_TIMEOUT_SECS
        );
        assert!(config.relay_enabled);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_rpm() {
        let config = BridgeConfig {
            api_keys: vec![ApiKeyConfig {
                name: "x".into(),
                key: "k".into(),
                rpm: 0,
            }],
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
