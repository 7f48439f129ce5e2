//! Direct browser fetch: the backend call runs inside the automated page.
//!
//! The in-page script reports through an exposed binding: the first call carries the status
//! envelope, later calls carry raw body lines. The response is handed back as soon as the
//! status arrives; a driver task keeps filling the body. Whatever ends the page call (normal
//! return, an exception, the page or its context closing) is recorded as the body's
//! terminal state, and the driver task itself is owned by the response and joined when the
//! body ends.

use crate::browser::{CookieJar, Page};
use crate::constants::REPORT_CHUNK_BINDING;
use crate::relay::RelayReport;
use crate::session::{install_auth_cookie, maybe_inject_auth_cookie_from_local_storage, set_provisional_user_id};
use crate::stream_response::{body_channel, BodySender, StreamResponse};
use crate::tasks::BackgroundTask;
use crate::types::{BridgeError, FetchPath, Result, StreamRequest};
use axum::http::HeaderMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const FETCH_SCRIPT: &str = r#"async ({url, method, body, extraHeaders, binding}) => {
  const report = window[binding];
  const res = await fetch(url, {
    method,
    headers: Object.assign({"content-type": "text/plain;charset=UTF-8"}, extraHeaders || {}),
    body: body == null ? undefined : JSON.stringify(body),
    credentials: "include",
  });
  const headers = {};
  res.headers.forEach((v, k) => { headers[k] = v; });
  await report(JSON.stringify({__type: "meta", status: res.status, headers}));
  if (!res.body) return {ok: true};
  const reader = res.body.getReader();
  const decoder = new TextDecoder();
  let buf = "";
  for (;;) {
    const {done, value} = await reader.read();
    if (done) break;
    buf += decoder.decode(value, {stream: true});
    let idx;
    while ((idx = buf.indexOf("\n")) >= 0) {
      await report(buf.slice(0, idx));
      buf = buf.slice(idx + 1);
    }
  }
  buf += decoder.decode();
  if (buf) await report(buf);
  return {ok: true};
}"#;

type StatusResult = std::result::Result<(u16, HeaderMap), BridgeError>;

/// Removes an exposed binding when the driver is done with it, including when the driver is
/// aborted mid-call and never reaches its own cleanup.
struct ExposedBinding {
    page: Arc<dyn Page>,
    name: String,
    removed: bool,
}

impl ExposedBinding {
    fn new(page: Arc<dyn Page>, name: String) -> Self {
        Self {
            page,
            name,
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        self.page.remove_binding(&self.name).await;
    }
}

impl Drop for ExposedBinding {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let page = self.page.clone();
        let name = std::mem::take(&mut self.name);
        let label = format!("remove-binding {}", name);
        let _enter = rt.enter();
        // Released at once: the reaper joins it.
        drop(BackgroundTask::spawn(label, async move {
            page.remove_binding(&name).await;
            tracing::debug!("[bridge -> page] Removed orphaned binding {}", name);
        }));
    }
}

pub struct BrowserFetcher {
    page: Arc<dyn Page>,
    jar: Arc<dyn CookieJar>,
    provisional_user_id: Option<String>,
}

impl BrowserFetcher {
    pub fn new(page: Arc<dyn Page>, jar: Arc<dyn CookieJar>) -> Self {
        Self {
            page,
            jar,
            provisional_user_id: None,
        }
    }

    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    pub fn with_provisional_user_id(mut self, id: Option<String>) -> Self {
        self.provisional_user_id = id.filter(|s| !s.trim().is_empty());
        self
    }

    /// Makes sure the page presents a session: the request's token if it has one, otherwise
    /// whatever can be recovered from localStorage. Failures here are logged, not fatal.
    pub async fn prepare_session(&self, request: &StreamRequest) {
        if request.has_auth_token() {
            if let Err(e) =
                install_auth_cookie(self.page.as_ref(), self.jar.as_ref(), &request.auth_token).await
            {
                tracing::warn!("[bridge -> page] Auth cookie install failed: {}", e);
            }
        } else if maybe_inject_auth_cookie_from_local_storage(self.page.as_ref(), self.jar.as_ref())
            .await
            .is_none()
        {
            tracing::debug!("[bridge -> page] No upstream token and no recoverable session");
        }

        if let Some(id) = &self.provisional_user_id {
            if let Err(e) = set_provisional_user_id(self.page.as_ref(), self.jar.as_ref(), id).await {
                tracing::warn!("[bridge -> page] Provisional user id sync failed: {}", e);
            }
        }
    }

    /// Runs the request in-page and returns once the status envelope arrives.
    pub async fn fetch(
        &self,
        request: &StreamRequest,
        status_timeout: Duration,
    ) -> Result<StreamResponse> {
        self.prepare_session(request).await;

        let binding = format!("{}_{}", REPORT_CHUNK_BINDING, Uuid::new_v4().simple());
        let (sink, reports) = mpsc::unbounded_channel::<String>();
        self.page.expose_binding(&binding, sink).await?;
        let exposed = ExposedBinding::new(self.page.clone(), binding.clone());

        let arg = json!({
            "url": request.url,
            "method": request.method,
            "body": Value::Object(request.payload.clone()),
            "extraHeaders": {},
            "binding": binding,
        });

        let (status_tx, status_rx) = oneshot::channel::<StatusResult>();
        let (body_tx, body_rx) = body_channel();
        let page = self.page.clone();
        let label = format!("direct-fetch {}", binding);
        let driver = BackgroundTask::spawn(
            label,
            drive_page_fetch(page, exposed, arg, reports, status_tx, body_tx),
        );

        match tokio::time::timeout(status_timeout, status_rx).await {
            Ok(Ok(Ok((status, headers)))) => {
                tracing::info!("[page -> bridge] Status {}", status);
                Ok(StreamResponse::streaming(status, headers, body_rx, FetchPath::Direct)
                    .with_driver(driver))
            }
            Ok(Ok(Err(e))) => {
                driver.join().await;
                Err(e.into())
            }
            Ok(Err(_)) => {
                let failure = driver.join().await;
                Err(BridgeError::Browser(
                    failure.unwrap_or_else(|| "page fetch ended without a status".to_string()),
                )
                .into())
            }
            Err(_) => {
                driver.abort_and_join().await;
                self.page.remove_binding(&binding).await;
                tracing::warn!("[page -> bridge] No status within {:?}", status_timeout);
                Err(BridgeError::StatusTimeout(status_timeout).into())
            }
        }
    }
}

/// Routes one binding invocation: the first must be the status envelope, the rest are lines.
fn route_report(report: String, status_tx: &mut Option<oneshot::Sender<StatusResult>>, body: &BodySender) {
    let Some(tx) = status_tx.take() else {
        body.push_line(report);
        return;
    };
    let outcome = match RelayReport::parse(&report) {
        RelayReport::Meta { status, headers } => Ok((status, headers)),
        RelayReport::MalformedMeta(reason) => Err(BridgeError::Protocol(reason)),
        _ => Err(BridgeError::Protocol(
            "first page report was not a status envelope".to_string(),
        )),
    };
    let _ = tx.send(outcome);
}

async fn drive_page_fetch(
    page: Arc<dyn Page>,
    exposed: ExposedBinding,
    arg: Value,
    mut reports: mpsc::UnboundedReceiver<String>,
    status_tx: oneshot::Sender<StatusResult>,
    body: BodySender,
) {
    let mut status_tx = Some(status_tx);

    let outcome = {
        let eval = page.evaluate(FETCH_SCRIPT, arg);
        tokio::pin!(eval);
        loop {
            tokio::select! {
                biased;
                Some(report) = reports.recv() => route_report(report, &mut status_tx, &body),
                result = &mut eval => break result,
            }
        }
    };

    // Reports queued before the call returned still belong to this response.
    while let Ok(report) = reports.try_recv() {
        route_report(report, &mut status_tx, &body);
    }
    exposed.remove().await;

    let failure = match outcome {
        Ok(value) => value
            .get("error")
            .and_then(Value::as_str)
            .map(|e| BridgeError::Browser(e.to_string())),
        Err(e) => Some(e.inner),
    };

    match (failure, status_tx.take()) {
        (Some(err), Some(tx)) => {
            tracing::warn!("[page -> bridge] Fetch failed before status: {}", err);
            let _ = tx.send(Err(err));
        }
        (Some(err), None) => {
            tracing::warn!("[page -> bridge] Fetch failed mid-stream: {}", err);
            body.fail(err.to_string());
        }
        (None, Some(tx)) => {
            let _ = tx.send(Err(BridgeError::Protocol(
                "page fetch finished without a status envelope".to_string(),
            )));
        }
        (None, None) => body.finish(),
    }
}
