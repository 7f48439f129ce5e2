use crate::health;
use crate::logging::request_id_middleware;
use crate::main_helper::AppState;
use crate::redaction::{redact_value, RedactionLevel};
use crate::relay::{ClaimOutcome, RelayReport, ReportOutcome};
use crate::specs::arena::{create_evaluation_payload, create_evaluation_url, CallerFrame, ChunkTranslator};
use crate::specs::openai::ChatCompletionRequest;
use crate::stream_response::StreamResponse;
use crate::types::{BridgeError, JobId, Result, StreamRequest};

use axum::response::sse::{Event, KeepAlive};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<AppState>) -> Router {
    // The relay agent runs as a userscript inside the backend's own origin.
    let relay_routes = Router::new()
        .route("/v1/relay/jobs/next", get(next_relay_job))
        .route("/v1/relay/jobs/:id/claim", post(claim_relay_job))
        .route("/v1/relay/jobs/:id/reports", post(report_relay_job))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/v1/chat/completions", post(chat_completions))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .merge(relay_routes)
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

// --- CHAT COMPLETIONS ---

fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rejects unknown or over-limit callers before any fetch path runs.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<()> {
    if state.api_keys.is_empty() {
        return Ok(());
    }
    let key = bearer_key(headers)
        .ok_or_else(|| BridgeError::Unauthorized("missing bearer API key".into()))?;
    let entry = state.api_keys.check(key)?;
    tracing::debug!("[client -> bridge] Key '{}' accepted", entry.name);
    Ok(())
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match serve_chat(state, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("[bridge -> client] {}", e);
            e.into_response()
        }
    }
}

async fn serve_chat(state: Arc<AppState>, headers: &HeaderMap, body: &[u8]) -> Result<Response> {
    authorize(&state, headers)?;

    let request: ChatCompletionRequest = serde_json::from_slice(body)?;
    let prompt = request.flattened_prompt();
    if prompt.trim().is_empty() {
        return Err(BridgeError::Protocol("request has no message content".into()).into());
    }

    let recaptcha_token = match &state.recaptcha {
        Some(minter) => match minter.mint().await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!("[bridge -> page] Sending without a reCAPTCHA token: {}", e);
                None
            }
        },
        None => None,
    };

    let token = state.credentials.next_token().unwrap_or_default();
    let stream_request = StreamRequest::new(
        "POST",
        create_evaluation_url(),
        create_evaluation_payload(&request.model, &prompt, recaptcha_token.as_deref()),
        token,
        state.config.request_timeout(),
    );

    let mut logged = serde_json::to_value(&stream_request)?;
    redact_value(&mut logged, RedactionLevel::default());
    tracing::debug!("[bridge -> backend] {} stream={} {}", request.model, request.stream, logged);

    let mut response = state.arbiter.fetch(&stream_request, &request.model).await?;
    tracing::info!(
        "[backend -> bridge] {} via {} status {}",
        request.model,
        response.path(),
        response.status()
    );

    if response.status() >= 400 {
        let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::BAD_GATEWAY);
        let text = String::from_utf8_lossy(&response.read_all().await).into_owned();
        return Err(BridgeError::Upstream(status, text).into());
    }

    if request.stream {
        Ok(sse_response(response, &request.model))
    } else {
        completion_response(response, &request.model).await
    }
}

fn frame_to_event(frame: CallerFrame) -> Option<Event> {
    let data = match frame {
        CallerFrame::Chunk(chunk) => serde_json::to_string(&chunk).ok()?,
        CallerFrame::Error(err) => err.to_string(),
        CallerFrame::Done => crate::constants::SSE_DONE_MARKER.to_string(),
    };
    Some(Event::default().data(data))
}

/// Backend lines as SSE chunk events. The status is already sent, so a body failure becomes
/// an in-band error chunk followed by `[DONE]`.
fn caller_events(
    response: StreamResponse,
    model: &str,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> + Send {
    let translator = ChunkTranslator::new(model);
    stream::unfold(Some((response, translator)), |state| async move {
        let (mut response, mut translator) = state?;
        match response.next_line().await {
            Some(Ok(line)) => Some((translator.on_line(&line), Some((response, translator)))),
            Some(Err(failure)) => {
                tracing::warn!("[bridge -> client] Stream failed after status: {}", failure);
                Some((translator.on_failure(&failure.0), None))
            }
            None => Some((translator.on_end(), None)),
        }
    })
    .flat_map(stream::iter)
    .filter_map(|frame| async move { frame_to_event(frame).map(Ok) })
}

fn sse_response(response: StreamResponse, model: &str) -> Response {
    Sse::new(caller_events(response, model))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}

async fn completion_response(mut response: StreamResponse, model: &str) -> Result<Response> {
    let mut translator = ChunkTranslator::new(model);
    while let Some(item) = response.next_line().await {
        match item {
            Ok(line) => {
                translator.on_line(&line);
            }
            Err(failure) => {
                return Err(BridgeError::RelayFailed(failure.0).into());
            }
        }
    }
    let completion = translator.completion();
    if completion.choices[0].message.content.is_empty() {
        if let Some(err) = translator.first_error() {
            return Err(BridgeError::Upstream(StatusCode::BAD_GATEWAY, err.to_string()).into());
        }
    }
    Ok(Json(completion).into_response())
}

// --- RELAY AGENT ENDPOINTS ---

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub agent: Option<String>,
}

impl AgentQuery {
    fn name(&self) -> &str {
        self.agent.as_deref().unwrap_or("anonymous")
    }
}

async fn next_relay_job(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
) -> Response {
    match state.arbiter.jobs().claim_next(query.name()) {
        Some(descriptor) => Json(descriptor).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn claim_relay_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> Response {
    match state.arbiter.jobs().claim(&JobId::from(id), query.name()) {
        ClaimOutcome::Claimed(descriptor) => Json(descriptor).into_response(),
        ClaimOutcome::AlreadyClaimed => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": {"message": "job already claimed", "code": "ALREADY_CLAIMED"}})),
        )
            .into_response(),
        ClaimOutcome::Unknown => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": {"message": "unknown job", "code": "UNKNOWN_JOB"}})),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportBatch {
    #[serde(default)]
    pub reports: Vec<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportAck {
    pub accepted: usize,
    pub dropped: usize,
    pub rejected: Vec<String>,
}

impl ReportAck {
    fn record(&mut self, outcome: ReportOutcome) {
        match outcome {
            ReportOutcome::Accepted => self.accepted += 1,
            ReportOutcome::Dropped => self.dropped += 1,
            ReportOutcome::Rejected(reason) => self.rejected.push(reason),
        }
    }
}

async fn report_relay_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(batch): Json<ReportBatch>,
) -> Json<ReportAck> {
    let id = JobId::from(id);
    let jobs = state.arbiter.jobs();
    let mut ack = ReportAck::default();

    for raw in batch.reports {
        ack.record(jobs.report(&id, RelayReport::parse(&raw)));
    }
    if let Some(message) = batch.error {
        ack.record(jobs.report(&id, RelayReport::Error(message)));
    } else if batch.done {
        ack.record(jobs.report(&id, RelayReport::Done));
    }

    if !ack.rejected.is_empty() {
        tracing::warn!("[relay -> bridge] Job {} rejected reports: {:?}", id, ack.rejected);
    }
    Json(ack)
}
