use super::{BindingSink, CookieJar, Page};
use crate::origin::CookieSpec;
use crate::tasks::BackgroundTask;
use crate::types::{BridgeError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

const LOCAL_STORAGE_DUMP_SCRIPT: &str = r#"() => {
  const out = {};
  for (let i = 0; i < localStorage.length; i++) {
    const k = localStorage.key(i);
    if (k !== null) out[k] = localStorage.getItem(k);
  }
  return out;
}"#;

const LOCAL_STORAGE_SET_SCRIPT: &str =
    r#"([k, v]) => { localStorage.setItem(k, v); return true; }"#;

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    web_socket_debugger_url: Option<String>,
}

struct Shared {
    pending: Mutex<PendingMap>,
    bindings: Mutex<HashMap<String, BindingSink>>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, BindingSink>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail_all_pending(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, tx) in self.pending().drain() {
            let _ = tx.send(Err(format!("closed: {}", reason)));
        }
        self.bindings().clear();
    }

    fn dispatch(&self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[cdp -> bridge] Unparseable message: {}", e);
                return;
            }
        };

        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let Some(tx) = self.pending().remove(&id) else {
                return;
            };
            let outcome = match msg.get("error") {
                Some(err) => Err(err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("CDP error")
                    .to_string()),
                None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
            return;
        }

        match msg.get("method").and_then(Value::as_str) {
            Some("Runtime.bindingCalled") => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let payload = params
                    .get("payload")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if let Some(sink) = self.bindings().get(name) {
                    let _ = sink.send(payload);
                }
            }
            Some("Inspector.detached") | Some("Target.targetDestroyed") => {
                self.fail_all_pending("target detached");
            }
            _ => {}
        }
    }
}

/// A single page target driven over the Chrome DevTools Protocol.
pub struct CdpBrowser {
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    io_task: Mutex<Option<BackgroundTask>>,
}

impl CdpBrowser {
    /// Attaches to the first page target listed by the DevTools HTTP endpoint.
    pub async fn attach(client: &reqwest::Client, cdp_http_url: &str) -> Result<Self> {
        let list_url = format!("{}/json/list", cdp_http_url.trim_end_matches('/'));
        let targets: Vec<TargetInfo> = client.get(&list_url).send().await?.json().await?;
        let target = targets
            .into_iter()
            .find(|t| t.kind == "page" && t.web_socket_debugger_url.is_some())
            .ok_or_else(|| BridgeError::Browser(format!("no page target at {}", list_url)))?;
        let ws_url = target
            .web_socket_debugger_url
            .ok_or_else(|| BridgeError::Browser("page target has no debugger url".into()))?;

        tracing::info!("[bridge -> cdp] Attaching to page {}", target.url);
        Self::connect(&ws_url).await
    }

    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (outgoing, mut rx_out) = mpsc::unbounded_channel::<Message>();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let io_shared = shared.clone();
        let io_task = BackgroundTask::spawn("cdp-io", async move {
            loop {
                tokio::select! {
                    out = rx_out.recv() => {
                        let Some(msg) = out else { break };
                        let is_close = matches!(msg, Message::Close(_));
                        if let Err(e) = ws_sink.send(msg).await {
                            tracing::warn!("[bridge -> cdp] Send failed: {}", e);
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    incoming = ws_source.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => io_shared.dispatch(text.as_str()),
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws_sink.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("[cdp -> bridge] Socket error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            io_shared.fail_all_pending("devtools socket ended");
            tracing::info!("[cdp -> bridge] DevTools connection closed");
        });

        let browser = Self {
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
            io_task: Mutex::new(Some(io_task)),
        };
        browser.command("Runtime.enable", json!({})).await?;
        browser.command("Network.enable", json!({})).await?;
        Ok(browser)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(BridgeError::PageClosed(format!("{}: devtools socket closed", method)).into());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        if self.outgoing.send(Message::Text(frame.to_string().into())).is_err() {
            self.shared.pending().remove(&id);
            return Err(BridgeError::PageClosed(format!("{}: writer gone", method)).into());
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(msg)) if msg.starts_with("closed:") => {
                Err(BridgeError::PageClosed(format!("{}: {}", method, msg)).into())
            }
            Ok(Err(msg)) => Err(BridgeError::Browser(format!("{}: {}", method, msg)).into()),
            Err(_) => Err(BridgeError::PageClosed(format!("{}: no response", method)).into()),
        }
    }

    /// Closes the socket and joins the IO task.
    pub async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
        let task = self
            .io_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.join().await;
        }
    }
}

#[async_trait]
impl Page for CdpBrowser {
    async fn url(&self) -> Option<String> {
        match self.evaluate("() => location.href", Value::Null).await {
            Ok(Value::String(url)) => Some(url),
            _ => None,
        }
    }

    async fn evaluate(&self, script: &str, arg: Value) -> Result<Value> {
        let expression = format!("({})({})", script, serde_json::to_string(&arg)?);
        let result = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("script exception")
                .to_string();
            if text.contains("closed") || text.contains("destroyed") {
                return Err(BridgeError::PageClosed(text).into());
            }
            return Err(BridgeError::Browser(text).into());
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn expose_binding(&self, name: &str, sink: BindingSink) -> Result<()> {
        self.shared.bindings().insert(name.to_string(), sink);
        if let Err(e) = self
            .command("Runtime.addBinding", json!({ "name": name }))
            .await
        {
            self.shared.bindings().remove(name);
            return Err(e);
        }
        Ok(())
    }

    async fn remove_binding(&self, name: &str) {
        self.shared.bindings().remove(name);
        if let Err(e) = self
            .command("Runtime.removeBinding", json!({ "name": name }))
            .await
        {
            tracing::debug!("[bridge -> cdp] removeBinding({}) failed: {}", name, e);
        }
    }

    async fn local_storage(&self) -> Result<HashMap<String, String>> {
        let value = self.evaluate(LOCAL_STORAGE_DUMP_SCRIPT, Value::Null).await?;
        let mut out = HashMap::new();
        if let Value::Object(map) = value {
            for (k, v) in map {
                if let Value::String(s) = v {
                    out.insert(k, s);
                }
            }
        }
        Ok(out)
    }

    async fn set_local_storage(&self, key: &str, value: &str) -> Result<()> {
        self.evaluate(LOCAL_STORAGE_SET_SCRIPT, json!([key, value]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CookieJar for CdpBrowser {
    async fn add_cookies(&self, cookies: &[CookieSpec]) -> Result<()> {
        self.command(
            "Network.setCookies",
            json!({ "cookies": serde_json::to_value(cookies)? }),
        )
        .await?;
        Ok(())
    }
}
