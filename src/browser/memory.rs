use super::{BindingSink, CookieJar, Page};
use crate::origin::CookieSpec;
use crate::types::{BridgeError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What an evaluate handler sees: the script, its argument and the bindings exposed so far.
pub struct MemoryEvaluation {
    pub script: String,
    pub arg: serde_json::Value,
    pub bindings: HashMap<String, BindingSink>,
}

impl MemoryEvaluation {
    /// Invokes an exposed binding as in-page script would. Errors once the binding is gone.
    pub fn call_binding(&self, name: &str, payload: impl Into<String>) -> Result<()> {
        let sink = self
            .bindings
            .get(name)
            .ok_or_else(|| BridgeError::Browser(format!("binding '{}' is not exposed", name)))?;
        sink.send(payload.into())
            .map_err(|_| BridgeError::PageClosed(format!("binding '{}' receiver dropped", name)).into())
    }
}

pub type EvaluateHandler =
    Arc<dyn Fn(MemoryEvaluation) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    url: Option<String>,
    local_storage: HashMap<String, String>,
    storage_writes: Vec<(String, String)>,
    cookies: Vec<CookieSpec>,
    cookie_batches: usize,
    bindings: HashMap<String, BindingSink>,
    scripts: Vec<String>,
}

/// In-process page and cookie jar. Records every mutation so callers can assert on them.
#[derive(Clone, Default)]
pub struct MemoryBrowser {
    state: Arc<Mutex<MemoryState>>,
    handler: Arc<Mutex<Option<EvaluateHandler>>>,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(url: &str) -> Self {
        let browser = Self::default();
        browser.lock().url = Some(url.to_string());
        browser
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed_local_storage(&self, key: &str, value: &str) {
        self.lock()
            .local_storage
            .insert(key.to_string(), value.to_string());
    }

    pub fn on_evaluate<F>(&self, handler: F)
    where
        F: Fn(MemoryEvaluation) -> BoxFuture<'static, Result<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    pub fn cookies(&self) -> Vec<CookieSpec> {
        self.lock().cookies.clone()
    }

    /// Number of `add_cookies` calls.
    pub fn cookie_batches(&self) -> usize {
        self.lock().cookie_batches
    }

    pub fn storage_writes(&self) -> Vec<(String, String)> {
        self.lock().storage_writes.clone()
    }

    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.lock().scripts.clone()
    }

    pub fn exposed_bindings(&self) -> Vec<String> {
        self.lock().bindings.keys().cloned().collect()
    }
}

#[async_trait]
impl Page for MemoryBrowser {
    async fn url(&self) -> Option<String> {
        self.lock().url.clone()
    }

    async fn evaluate(&self, script: &str, arg: serde_json::Value) -> Result<serde_json::Value> {
        let bindings = {
            let mut state = self.lock();
            state.scripts.push(script.to_string());
            state.bindings.clone()
        };
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                handler(MemoryEvaluation {
                    script: script.to_string(),
                    arg,
                    bindings,
                })
                .await
            }
            None => Ok(serde_json::Value::Null),
        }
    }

    async fn expose_binding(&self, name: &str, sink: BindingSink) -> Result<()> {
        self.lock().bindings.insert(name.to_string(), sink);
        Ok(())
    }

    async fn remove_binding(&self, name: &str) {
        self.lock().bindings.remove(name);
    }

    async fn local_storage(&self) -> Result<HashMap<String, String>> {
        Ok(self.lock().local_storage.clone())
    }

    async fn set_local_storage(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .storage_writes
            .push((key.to_string(), value.to_string()));
        state
            .local_storage
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl CookieJar for MemoryBrowser {
    async fn add_cookies(&self, cookies: &[CookieSpec]) -> Result<()> {
        let mut state = self.lock();
        state.cookie_batches += 1;
        state.cookies.extend_from_slice(cookies);
        Ok(())
    }
}
