//! Fetch arbiter: picks the relay or the direct browser path for each request and falls back
//! to the other one at most once.

use crate::config::BridgeConfig;
use crate::direct::BrowserFetcher;
use crate::health::PathHealth;
use crate::relay::{RelayJobs, RelayTimeouts};
use crate::stream_response::StreamResponse;
use crate::types::{BridgeError, FetchPath, Result, StreamRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// A model's routing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRoute {
    /// Relay first whenever it is active.
    StrictRelay,
    Default,
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub strict_relay_models: HashSet<String>,
    pub relay_enabled: bool,
    pub relay: RelayTimeouts,
    pub direct_status_timeout: Duration,
    pub request_timeout: Duration,
}

impl ArbiterConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            strict_relay_models: config.strict_relay_models.iter().cloned().collect(),
            relay_enabled: config.relay_enabled,
            relay: RelayTimeouts {
                pickup: config.pickup_timeout(),
                status: config.status_timeout(),
                grace: config.job_grace(),
            },
            direct_status_timeout: config.direct_status_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn route_for(&self, model: &str) -> ModelRoute {
        if self.strict_relay_models.contains(model) {
            ModelRoute::StrictRelay
        } else {
            ModelRoute::Default
        }
    }
}

pub struct FetchArbiter {
    config: ArbiterConfig,
    health: Arc<PathHealth>,
    jobs: Arc<RelayJobs>,
    direct: Option<Arc<BrowserFetcher>>,
}

impl FetchArbiter {
    pub fn new(
        config: ArbiterConfig,
        health: Arc<PathHealth>,
        direct: Option<Arc<BrowserFetcher>>,
    ) -> Self {
        let jobs = Arc::new(RelayJobs::new(health.clone(), config.relay));
        Self {
            config,
            health,
            jobs,
            direct,
        }
    }

    /// Builds the arbiter and its own health flag from the bridge config.
    pub fn from_config(config: &BridgeConfig, direct: Option<Arc<BrowserFetcher>>) -> Self {
        let health = Arc::new(PathHealth::new(config.active_window()));
        Self::new(ArbiterConfig::from_config(config), health, direct)
    }

    pub fn health(&self) -> &Arc<PathHealth> {
        &self.health
    }

    pub fn jobs(&self) -> &Arc<RelayJobs> {
        &self.jobs
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn has_direct_path(&self) -> bool {
        self.direct.is_some()
    }

    fn relay_usable(&self) -> bool {
        self.config.relay_enabled && self.health.is_active()
    }

    /// The path a request for `model` tries first.
    pub fn first_path(&self, model: &str) -> FetchPath {
        if self.direct.is_none() {
            return FetchPath::Relay;
        }
        match self.config.route_for(model) {
            ModelRoute::StrictRelay if self.relay_usable() => FetchPath::Relay,
            _ => FetchPath::Direct,
        }
    }

    fn can_fall_back_to(&self, path: FetchPath) -> bool {
        match path {
            FetchPath::Relay => self.relay_usable(),
            FetchPath::Direct => self.direct.is_some(),
        }
    }

    /// Resolves `request` to a response that has a status. Everything after that is in-band.
    pub async fn fetch(&self, request: &StreamRequest, model: &str) -> Result<StreamResponse> {
        let budget = if request.timeout.is_zero() {
            self.config.request_timeout
        } else {
            request.timeout.min(self.config.request_timeout)
        };
        match tokio::time::timeout(budget, self.fetch_with_fallback(request, model)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("[arbiter] No path produced a status within {:?}", budget);
                Err(BridgeError::RequestTimeout(budget).into())
            }
        }
    }

    async fn fetch_with_fallback(
        &self,
        request: &StreamRequest,
        model: &str,
    ) -> Result<StreamResponse> {
        let first = self.first_path(model);
        tracing::debug!("[arbiter] {} -> {} first", model, first);

        let first_err = match self.fetch_via(first, request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let second = first.other();
        if !self.can_fall_back_to(second) {
            tracing::warn!("[arbiter] {} path failed, {} unavailable: {}", first, second, first_err);
            return Err(first_err);
        }

        tracing::warn!(
            "[arbiter] {} path failed ({}), falling back to {}",
            first,
            first_err,
            second
        );
        match self.fetch_via(second, request).await {
            Ok(response) => Ok(response),
            Err(second_err) => Err(BridgeError::AllPathsFailed {
                first: format!("{}: {}", first, first_err),
                second: format!("{}: {}", second, second_err),
            }
            .into()),
        }
    }

    async fn fetch_via(&self, path: FetchPath, request: &StreamRequest) -> Result<StreamResponse> {
        match path {
            FetchPath::Relay => self.fetch_via_relay(request).await,
            FetchPath::Direct => match &self.direct {
                Some(fetcher) => fetcher.fetch(request, self.config.direct_status_timeout).await,
                None => Err(BridgeError::Browser("no browser page attached".into()).into()),
            },
        }
    }

    async fn fetch_via_relay(&self, request: &StreamRequest) -> Result<StreamResponse> {
        let timeouts = self.jobs.timeouts();
        let mut handle = self.jobs.create(request.clone());

        if let Err(e) = handle.wait_pickup(timeouts.pickup).await {
            if matches!(e.inner, BridgeError::PickupTimeout(_)) {
                tracing::warn!("[arbiter] Job {} never picked up, relay inactive", handle.id());
                self.health.clear();
            }
            return Err(e);
        }

        match handle.wait_status(timeouts.status).await {
            Ok(response) => {
                self.health.touch();
                Ok(response)
            }
            Err(e) => {
                // The claim proved the agent alive; only the stall keeps it out of routing.
                if matches!(e.inner, BridgeError::StatusTimeout(_)) {
                    tracing::warn!("[arbiter] Relay claimed a job but sent no status, marking stalled");
                    self.health.mark_stalled();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::MemoryBrowser;

    fn config(strict: &[&str]) -> ArbiterConfig {
        ArbiterConfig {
            strict_relay_models: strict.iter().map(|s| s.to_string()).collect(),
            relay_enabled: true,
            relay: RelayTimeouts {
                pickup: Duration::from_secs(1),
                status: Duration::from_secs(1),
                grace: Duration::from_secs(1),
            },
            direct_status_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn fetcher() -> Arc<BrowserFetcher> {
        let browser = MemoryBrowser::new();
        Arc::new(BrowserFetcher::new(
            Arc::new(browser.clone()),
            Arc::new(browser),
        ))
    }

    #[tokio::test]
    async fn test_strict_model_prefers_active_relay() {
        let health = Arc::new(PathHealth::new(Duration::from_secs(30)));
        let arbiter = FetchArbiter::new(config(&["strict"]), health.clone(), Some(fetcher()));

        assert_eq!(arbiter.first_path("strict"), FetchPath::Direct);
        health.touch();
        assert_eq!(arbiter.first_path("strict"), FetchPath::Relay);
        assert_eq!(arbiter.first_path("other"), FetchPath::Direct);
    }

    #[tokio::test]
    async fn test_stalled_relay_is_skipped_despite_polls() {
        let health = Arc::new(PathHealth::new(Duration::from_secs(30)));
        let arbiter = FetchArbiter::new(config(&["strict"]), health.clone(), Some(fetcher()));
        health.touch();
        health.mark_stalled();
        health.record_poll();
        assert_eq!(arbiter.first_path("strict"), FetchPath::Direct);
    }

    #[tokio::test]
    async fn test_no_browser_means_relay_first() {
        let health = Arc::new(PathHealth::new(Duration::from_secs(30)));
        let arbiter = FetchArbiter::new(config(&[]), health, None);
        assert_eq!(arbiter.first_path("any"), FetchPath::Relay);
        assert!(!arbiter.has_direct_path());
    }
}
