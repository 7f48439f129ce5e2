use crate::config::ApiKeyConfig;
use crate::constants::RATE_LIMIT_WINDOW_SECS;
use crate::types::{BridgeError, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Upstream auth tokens, handed out round-robin.
pub struct CredentialPool {
    tokens: Vec<String>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            tokens,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Current token, then advance; wraps at the pool length.
    pub fn next_token(&self) -> Option<String> {
        if self.tokens.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
        self.tokens.get(idx).cloned()
    }

    pub fn current_index(&self) -> usize {
        match self.tokens.len() {
            0 => 0,
            n => self.cursor.load(Ordering::Relaxed) % n,
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Test/reset hook.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}

/// Short, non-reversible identifier for logging a secret.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Caller API keys with a rolling one-minute request ceiling per key.
pub struct ApiKeyRegistry {
    keys: HashMap<String, ApiKeyConfig>,
    usage: Mutex<HashMap<String, VecDeque<Instant>>>,
    window: Duration,
}

impl ApiKeyRegistry {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.key.clone(), k)).collect(),
            usage: Mutex::new(HashMap::new()),
            window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Validates `key` and records one request against its ceiling.
    pub fn check(&self, key: &str) -> Result<ApiKeyConfig> {
        let entry = self.keys.get(key).ok_or_else(|| {
            BridgeError::Unauthorized(format!("unknown API key {}", fingerprint(key)))
        })?;

        let now = Instant::now();
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let hits = usage.entry(entry.name.clone()).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() as u32 >= entry.rpm {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            tracing::warn!(
                "[client -> bridge] Rate limit hit for key '{}' ({} rpm)",
                entry.name,
                entry.rpm
            );
            return Err(BridgeError::RateLimited {
                key: entry.name.clone(),
                retry_after_secs: retry_after.as_secs().max(1),
            }
            .into());
        }

        hits.push_back(now);
        Ok(entry.clone())
    }

    pub fn usage_count(&self, name: &str) -> usize {
        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// Test/reset hook.
    pub fn reset(&self) {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, key: &str, rpm: u32) -> ApiKeyConfig {
        ApiKeyConfig {
            name: name.to_string(),
            key: key.to_string(),
            rpm,
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let pool = CredentialPool::new(vec!["a".into(), " ".into(), "b".into()]);
        assert_eq!(pool.token_count(), 2);
        assert_eq!(pool.next_token().as_deref(), Some("a"));
        assert_eq!(pool.next_token().as_deref(), Some("b"));
        assert_eq!(pool.next_token().as_deref(), Some("a"));
        assert_eq!(pool.current_index(), 1);
        pool.reset();
        assert_eq!(pool.next_token().as_deref(), Some("a"));
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        assert!(CredentialPool::new(vec![]).next_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_ceiling_and_window_roll() {
        let registry = ApiKeyRegistry::new(vec![key("Test", "k1", 2)]);
        assert!(registry.check("k1").is_ok());
        assert!(registry.check("k1").is_ok());
        let err = registry.check("k1").unwrap_err();
        match err.inner {
            BridgeError::RateLimited { key, .. } => assert_eq!(key, "Test"),
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.check("k1").is_ok());
        assert_eq!(registry.usage_count("Test"), 1);
    }

    #[test]
    fn test_unknown_key_is_unauthorized() {
        let registry = ApiKeyRegistry::new(vec![key("Test", "k1", 5)]);
        let err = registry.check("nope").unwrap_err();
        assert!(matches!(err.inner, BridgeError::Unauthorized(_)));
        assert!(!err.to_string().contains("nope"));
    }
}
