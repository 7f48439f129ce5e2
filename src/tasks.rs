//! Owned background work.
//!
//! Every task spawned by the bridge is wrapped in a `BackgroundTask`, and every
//! `BackgroundTask` is joined exactly once: by its owner through `join`, or, when the owner
//! drops it early, by a reaper that waits a bounded time, aborts if needed and records the
//! outcome. A task's panic or cancellation therefore always has an observer.

use crate::constants::BACKGROUND_TASK_REAP_SECS;
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

pub struct BackgroundTask {
    label: String,
    handle: Option<JoinHandle<()>>,
}

fn describe(label: &str, err: &JoinError) -> String {
    if err.is_panic() {
        format!("{} panicked", label)
    } else {
        format!("{} was cancelled", label)
    }
}

impl BackgroundTask {
    pub fn spawn<F>(label: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            label: label.into(),
            handle: Some(tokio::spawn(fut)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(h) => h.is_finished(),
            None => true,
        }
    }

    /// Waits for the task. Returns a description of the failure if it panicked or was cancelled.
    pub async fn join(mut self) -> Option<String> {
        let handle = self.handle.take()?;
        match handle.await {
            Ok(()) => None,
            Err(e) => {
                let msg = describe(&self.label, &e);
                tracing::warn!("[task] {}", msg);
                Some(msg)
            }
        }
    }

    /// Cancels the task and still observes how it ended.
    pub async fn abort_and_join(mut self) -> Option<String> {
        let handle = self.handle.take()?;
        handle.abort();
        match handle.await {
            Ok(()) => None,
            Err(e) if e.is_cancelled() => {
                tracing::debug!("[task] {} aborted", self.label);
                None
            }
            Err(e) => {
                let msg = describe(&self.label, &e);
                tracing::warn!("[task] {}", msg);
                Some(msg)
            }
        }
    }
}

async fn reap(label: String, mut handle: JoinHandle<()>, grace: Duration) {
    let outcome = match tokio::time::timeout(grace, &mut handle).await {
        Ok(result) => result,
        Err(_) => {
            handle.abort();
            handle.await
        }
    };
    match outcome {
        Ok(()) => tracing::debug!("[task] {} finished after owner released it", label),
        Err(e) if e.is_cancelled() => {
            tracing::debug!("[task] {} aborted after {:?} without an owner", label, grace)
        }
        Err(e) => tracing::warn!("[task] {}", describe(&label, &e)),
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let grace = if handle.is_finished() {
            Duration::ZERO
        } else {
            Duration::from_secs(BACKGROUND_TASK_REAP_SECS)
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(reap(std::mem::take(&mut self.label), handle, grace));
            }
            Err(_) => handle.abort(),
        }
    }
}
