//! Capability interface over an automated browser page.
//!
//! The bridge never talks to a browser engine directly: it evaluates scripts, registers
//! callbacks, mutates the cookie jar and reads/writes localStorage through these traits.
//! `cdp` implements them over the Chrome DevTools Protocol, `memory` in-process for tests.

pub mod cdp;
pub mod memory;

use crate::origin::CookieSpec;
use crate::types::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Receives every payload the page passes to an exposed binding, in call order.
pub type BindingSink = mpsc::UnboundedSender<String>;

#[async_trait]
pub trait Page: Send + Sync {
    /// Current page URL, if known.
    async fn url(&self) -> Option<String>;

    /// Runs `script` (a JS function expression) in-page with `arg` and returns its JSON result.
    /// Fails with `BridgeError::PageClosed` when the page or its context goes away.
    async fn evaluate(&self, script: &str, arg: serde_json::Value) -> Result<serde_json::Value>;

    /// Makes `window[name](payload)` available in-page; each call is forwarded to `sink`.
    async fn expose_binding(&self, name: &str, sink: BindingSink) -> Result<()>;

    /// Stops forwarding calls for `name`.
    async fn remove_binding(&self, name: &str);

    async fn local_storage(&self) -> Result<HashMap<String, String>>;

    async fn set_local_storage(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait CookieJar: Send + Sync {
    async fn add_cookies(&self, cookies: &[CookieSpec]) -> Result<()>;
}
