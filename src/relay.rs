//! Relay job channel.
//!
//! A request routed through the relay is published as a job. An external agent claims it,
//! performs the backend call itself and reports back: a status envelope first, then raw
//! body lines, then a terminal report. Per job: `pending -> picked_up -> completed | failed`.
//!
//! The table owns every job. Waiters only hold a `RelayJobHandle`; when a waiter gives up
//! (timeout or drop) the job is evicted at once, so it can neither be claimed again nor
//! deliver late reports to anyone.

use crate::constants::{REPORT_TYPE_DONE, REPORT_TYPE_ERROR, REPORT_TYPE_META};
use crate::health::PathHealth;
use crate::stream_response::{body_channel, headers_from_json, BodyReceiver, BodySender, StreamResponse};
use crate::tasks::BackgroundTask;
use crate::types::{BridgeError, FetchPath, JobId, Result, StreamRequest};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    PickedUp,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    pub pickup: Duration,
    pub status: Duration,
    /// Extra time a job may linger past its timeouts (or stay idle while streaming).
    pub grace: Duration,
}

/// One report from a relay agent.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayReport {
    Meta { status: u16, headers: HeaderMap },
    /// A `meta` envelope without a usable HTTP status.
    MalformedMeta(String),
    Line(String),
    Done,
    Error(String),
}

fn http_status(obj: &serde_json::Map<String, Value>) -> Option<u16> {
    obj.get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (100..=599).contains(s))
}

impl RelayReport {
    /// Envelopes are JSON objects tagged with `__type`; anything else is a raw body line.
    pub fn parse(raw: &str) -> Self {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) else {
            return RelayReport::Line(raw.to_string());
        };
        match obj.get("__type").and_then(Value::as_str) {
            Some(REPORT_TYPE_META) => match http_status(&obj) {
                Some(status) => RelayReport::Meta {
                    status,
                    headers: obj.get("headers").map(headers_from_json).unwrap_or_default(),
                },
                None => RelayReport::MalformedMeta(format!(
                    "status envelope without a valid status: {}",
                    obj.get("status").unwrap_or(&Value::Null)
                )),
            },
            Some(REPORT_TYPE_DONE) => RelayReport::Done,
            Some(REPORT_TYPE_ERROR) => RelayReport::Error(
                obj.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("relay agent reported an error")
                    .to_string(),
            ),
            _ => RelayReport::Line(raw.to_string()),
        }
    }
}

/// What an agent receives when it claims a job.
#[derive(Debug, Clone, Serialize)]
pub struct RelayJobDescriptor {
    pub job_id: JobId,
    pub method: String,
    pub url: String,
    pub payload: serde_json::Map<String, Value>,
    pub auth_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(RelayJobDescriptor),
    AlreadyClaimed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Accepted,
    /// Job unknown, evicted, or its consumer is gone. Not an error for the agent.
    Dropped,
    Rejected(String),
}

struct StatusEnvelope {
    status: u16,
    headers: HeaderMap,
}

type StatusResult = std::result::Result<StatusEnvelope, String>;

struct RelayJob {
    request: StreamRequest,
    state: JobState,
    created_at: DateTime<Utc>,
    created: Instant,
    last_activity: Instant,
    claimed_by: Option<String>,
    picked_up_tx: Option<oneshot::Sender<()>>,
    status_tx: Option<oneshot::Sender<StatusResult>>,
    body_tx: Option<BodySender>,
    first_status_received: bool,
    lines_received: usize,
}

impl RelayJob {
    fn descriptor(&self, id: &JobId) -> RelayJobDescriptor {
        RelayJobDescriptor {
            job_id: id.clone(),
            method: self.request.method.clone(),
            url: self.request.url.clone(),
            payload: self.request.payload.clone(),
            auth_token: self.request.auth_token.clone(),
            created_at: self.created_at,
        }
    }

    fn fail(&mut self, reason: &str) {
        self.state = JobState::Failed;
        if let Some(tx) = self.status_tx.take() {
            let _ = tx.send(Err(reason.to_string()));
        }
        if let Some(body) = self.body_tx.take() {
            body.fail(reason);
        }
    }
}

pub struct RelayJobs {
    jobs: Mutex<HashMap<JobId, RelayJob>>,
    health: Arc<PathHealth>,
    timeouts: RelayTimeouts,
}

impl RelayJobs {
    pub fn new(health: Arc<PathHealth>, timeouts: RelayTimeouts) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            health,
            timeouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, RelayJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn timeouts(&self) -> RelayTimeouts {
        self.timeouts
    }

    /// Publishes a pending job and returns the waiter's handle immediately.
    pub fn create(self: &Arc<Self>, request: StreamRequest) -> RelayJobHandle {
        let id = JobId::new();
        let (picked_up_tx, picked_up_rx) = oneshot::channel();
        let (status_tx, status_rx) = oneshot::channel();
        let (body_tx, body_rx) = body_channel();
        let now = Instant::now();

        self.lock().insert(
            id.clone(),
            RelayJob {
                request,
                state: JobState::Pending,
                created_at: Utc::now(),
                created: now,
                last_activity: now,
                claimed_by: None,
                picked_up_tx: Some(picked_up_tx),
                status_tx: Some(status_tx),
                body_tx: Some(body_tx),
                first_status_received: false,
                lines_received: 0,
            },
        );
        tracing::debug!("[bridge -> relay] Published job {}", id);

        RelayJobHandle {
            id,
            jobs: self.clone(),
            picked_up_rx: Some(picked_up_rx),
            status_rx: Some(status_rx),
            body_rx: Some(body_rx),
            delivered: false,
        }
    }

    fn claim_locked(
        &self,
        jobs: &mut HashMap<JobId, RelayJob>,
        id: &JobId,
        agent: &str,
    ) -> ClaimOutcome {
        let Some(job) = jobs.get_mut(id) else {
            return ClaimOutcome::Unknown;
        };
        // The picked-up signal fires once; later claims are no-ops.
        let Some(signal) = job.picked_up_tx.take() else {
            return ClaimOutcome::AlreadyClaimed;
        };
        job.state = JobState::PickedUp;
        job.claimed_by = Some(agent.to_string());
        job.last_activity = Instant::now();
        let _ = signal.send(());
        self.health.touch();
        tracing::info!("[relay -> bridge] Job {} claimed by {}", id, agent);
        ClaimOutcome::Claimed(job.descriptor(id))
    }

    /// Claims a specific job. Only the first claim wins.
    pub fn claim(&self, id: &JobId, agent: &str) -> ClaimOutcome {
        let mut jobs = self.lock();
        self.claim_locked(&mut jobs, id, agent)
    }

    /// Records the agent's poll and claims the oldest pending job, if any.
    pub fn claim_next(&self, agent: &str) -> Option<RelayJobDescriptor> {
        self.health.record_poll();
        let mut jobs = self.lock();
        let oldest = jobs
            .iter()
            .filter(|(_, j)| j.state == JobState::Pending)
            .min_by_key(|(_, j)| j.created)
            .map(|(id, _)| id.clone())?;
        match self.claim_locked(&mut jobs, &oldest, agent) {
            ClaimOutcome::Claimed(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Applies one agent report, in arrival order.
    pub fn report(&self, id: &JobId, report: RelayReport) -> ReportOutcome {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(id) else {
            tracing::debug!("[relay -> bridge] Dropping report for unknown job {}", id);
            return ReportOutcome::Dropped;
        };
        if job.state == JobState::Pending {
            return ReportOutcome::Rejected("job has not been claimed".to_string());
        }
        job.last_activity = Instant::now();

        let (outcome, evict) = match report {
            RelayReport::Meta { status, headers } => {
                if job.first_status_received {
                    (ReportOutcome::Rejected("duplicate status envelope".into()), false)
                } else {
                    job.first_status_received = true;
                    let delivered = match job.status_tx.take() {
                        Some(tx) => tx.send(Ok(StatusEnvelope { status, headers })).is_ok(),
                        None => false,
                    };
                    if delivered {
                        tracing::info!("[relay -> bridge] Job {} status {}", id, status);
                        (ReportOutcome::Accepted, false)
                    } else {
                        (ReportOutcome::Dropped, true)
                    }
                }
            }
            RelayReport::MalformedMeta(reason) => {
                if job.first_status_received {
                    (ReportOutcome::Rejected(reason), false)
                } else {
                    tracing::warn!("[relay -> bridge] Job {}: {}", id, reason);
                    job.fail(&reason);
                    (ReportOutcome::Rejected(reason), true)
                }
            }
            RelayReport::Line(line) => {
                if !job.first_status_received {
                    job.fail("body line before status envelope");
                    (
                        ReportOutcome::Rejected("body line before status envelope".into()),
                        true,
                    )
                } else {
                    job.lines_received += 1;
                    let pushed = job
                        .body_tx
                        .as_ref()
                        .map(|body| body.push_line(line))
                        .unwrap_or(false);
                    if pushed {
                        (ReportOutcome::Accepted, false)
                    } else {
                        (ReportOutcome::Dropped, true)
                    }
                }
            }
            RelayReport::Done => {
                if !job.first_status_received {
                    job.fail("relay completed without a status");
                    (ReportOutcome::Rejected("completed without status".into()), true)
                } else {
                    job.state = JobState::Completed;
                    if let Some(body) = job.body_tx.take() {
                        body.finish();
                    }
                    tracing::info!(
                        "[relay -> bridge] Job {} completed ({} lines)",
                        id,
                        job.lines_received
                    );
                    (ReportOutcome::Accepted, true)
                }
            }
            RelayReport::Error(message) => {
                tracing::warn!("[relay -> bridge] Job {} failed: {}", id, message);
                job.fail(&message);
                (ReportOutcome::Accepted, true)
            }
        };

        if evict {
            jobs.remove(id);
        }
        outcome
    }

    /// Evicts a job its waiter no longer wants. Late reports for it are dropped.
    pub fn abandon(&self, id: &JobId, reason: &str) {
        if let Some(mut job) = self.lock().remove(id) {
            if job.state == JobState::Pending || job.state == JobState::PickedUp {
                job.fail(reason);
            }
            tracing::info!("[bridge -> relay] Abandoned job {}: {}", id, reason);
        }
    }

    /// Evicts jobs that outlived their timeouts plus grace, or went idle while streaming.
    pub fn sweep(&self) -> usize {
        let t = self.timeouts;
        let waiting_limit = t.pickup + t.status + t.grace;
        let idle_limit = t.status + t.grace;
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|id, job| {
            let expired = if job.first_status_received {
                job.last_activity.elapsed() > idle_limit
            } else {
                job.created.elapsed() > waiting_limit
            };
            if expired {
                tracing::warn!("[relay] Sweeping stale job {} ({:?})", id, job.state);
                job.fail("relay job expired");
            }
            !expired
        });
        before - jobs.len()
    }

    pub fn state(&self, id: &JobId) -> Option<JobState> {
        self.lock().get(id).map(|j| j.state)
    }

    pub fn claimed_by(&self, id: &JobId) -> Option<String> {
        self.lock().get(id).and_then(|j| j.claimed_by.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|j| j.state == JobState::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_job_ids(&self) -> Vec<JobId> {
        self.lock()
            .iter()
            .filter(|(_, j)| j.state == JobState::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Runs `RelayJobs::sweep` every `every` until `cancel` fires.
pub fn spawn_sweeper(
    jobs: Arc<RelayJobs>,
    every: Duration,
    cancel: CancellationToken,
) -> BackgroundTask {
    BackgroundTask::spawn("relay-sweeper", async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(every));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    let evicted = jobs.sweep();
                    if evicted > 0 {
                        tracing::info!("[relay] Swept {} stale jobs, {} left", evicted, jobs.len());
                    }
                }
            }
        }
        tracing::debug!("[relay] Sweeper stopped");
    })
}

/// The waiter's side of a relay job.
pub struct RelayJobHandle {
    id: JobId,
    jobs: Arc<RelayJobs>,
    picked_up_rx: Option<oneshot::Receiver<()>>,
    status_rx: Option<oneshot::Receiver<StatusResult>>,
    body_rx: Option<BodyReceiver>,
    delivered: bool,
}

impl RelayJobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Waits for an agent to claim the job. On timeout the job is abandoned.
    pub async fn wait_pickup(&mut self, timeout: Duration) -> Result<()> {
        let Some(rx) = self.picked_up_rx.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::RelayFailed("job evicted before pickup".into()).into()),
            Err(_) => {
                self.jobs.abandon(&self.id, "pickup timeout");
                Err(BridgeError::PickupTimeout(timeout).into())
            }
        }
    }

    /// Waits for the status envelope and turns the job into a streaming response.
    /// On timeout the job is abandoned and late reports for it are dropped.
    pub async fn wait_status(mut self, timeout: Duration) -> Result<StreamResponse> {
        let rx = self
            .status_rx
            .take()
            .ok_or_else(|| BridgeError::internal("status already awaited"))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(envelope))) => {
                let body = self
                    .body_rx
                    .take()
                    .ok_or_else(|| BridgeError::internal("relay body already taken"))?;
                self.delivered = true;
                Ok(StreamResponse::streaming(
                    envelope.status,
                    envelope.headers,
                    body,
                    FetchPath::Relay,
                )
                .with_job(self.id.clone()))
            }
            Ok(Ok(Err(reason))) => Err(BridgeError::RelayFailed(reason).into()),
            Ok(Err(_)) => Err(BridgeError::RelayFailed("job closed without a status".into()).into()),
            Err(_) => {
                self.jobs.abandon(&self.id, "status timeout");
                Err(BridgeError::StatusTimeout(timeout).into())
            }
        }
    }
}

impl Drop for RelayJobHandle {
    fn drop(&mut self) {
        if !self.delivered {
            self.jobs.abandon(&self.id, "waiter released the job");
        }
    }
}
