use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::AppState;

/// Routing hint: has the relay path proven reachable recently?
///
/// Stores instants as milliseconds past a fixed epoch (0 means unset), so every read and
/// write is a single atomic operation. A touch counts for `active_window`; a relay agent
/// that stops polling goes stale on its own.
///
/// A stall (an agent claimed a job and then sent no status) suppresses the flag until a
/// later job is claimed, or until `active_window` has passed since the stall. Agent polls
/// alone do not lift it, so a polling but stalled agent is not routed to again at once.
pub struct PathHealth {
    epoch: Instant,
    last_touch_ms: AtomicU64,
    stalled_at_ms: AtomicU64,
    active_window: Duration,
}

impl PathHealth {
    pub fn new(active_window: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_touch_ms: AtomicU64::new(0),
            stalled_at_ms: AtomicU64::new(0),
            active_window,
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a touch at the epoch distinguishable from "unset"
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn within_window(&self, at_ms: u64) -> bool {
        at_ms != 0 && self.now_ms().saturating_sub(at_ms) <= self.active_window.as_millis() as u64
    }

    /// A relay agent polled for work.
    pub fn record_poll(&self) {
        self.last_touch_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// A job was claimed or served: the relay is live and any earlier stall is forgotten.
    pub fn touch(&self) {
        self.stalled_at_ms.store(0, Ordering::SeqCst);
        self.last_touch_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// A claimed job never produced a status.
    pub fn mark_stalled(&self) {
        self.stalled_at_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// Marks the relay path inactive.
    pub fn clear(&self) {
        self.last_touch_ms.store(0, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        self.within_window(self.stalled_at_ms.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.within_window(self.last_touch_ms.load(Ordering::SeqCst)) && !self.is_stalled()
    }

    /// Time since the last touch or poll, if the flag is set.
    pub fn since_last_touch(&self) -> Option<Duration> {
        let last = self.last_touch_ms.load(Ordering::SeqCst);
        (last != 0).then(|| Duration::from_millis(self.now_ms().saturating_sub(last)))
    }
}

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub relay: String,
    pub browser: String,
    pub pending_jobs: usize,
    pub upstream_tokens: usize,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when at least one path can serve a request.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let relay_ok = state.arbiter.health().is_active();
    let browser_ok = state.arbiter.has_direct_path();

    if !relay_ok && !browser_ok {
        tracing::error!("Readiness check: no fetch path available");
    }

    let status_code = if relay_ok || browser_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if relay_ok || browser_ok { "ready" } else { "unready" }.to_string(),
            relay: if relay_ok { "active" } else { "inactive" }.to_string(),
            browser: if browser_ok { "attached" } else { "detached" }.to_string(),
            pending_jobs: state.arbiter.jobs().pending_count(),
            upstream_tokens: state.credentials.token_count(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_expires_after_window() {
        let health = PathHealth::new(Duration::from_secs(3));
        assert!(!health.is_active());
        health.touch();
        assert!(health.is_active());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(health.is_active());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!health.is_active());
    }

    #[tokio::test]
    async fn test_clear_deactivates() {
        let health = PathHealth::new(Duration::from_secs(30));
        health.touch();
        health.clear();
        assert!(!health.is_active());
        assert!(health.since_last_touch().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_outlasts_polls_until_next_claim() {
        let health = PathHealth::new(Duration::from_secs(30));
        health.touch();
        health.mark_stalled();
        assert!(!health.is_active());

        tokio::time::advance(Duration::from_secs(5)).await;
        health.record_poll();
        assert!(!health.is_active());

        health.touch();
        assert!(health.is_active());
        assert!(!health.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_lapses_after_window() {
        let health = PathHealth::new(Duration::from_secs(10));
        health.touch();
        health.mark_stalled();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!health.is_active());
        health.record_poll();
        assert!(health.is_active());
    }
}
