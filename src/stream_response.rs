//! The response shape both fetch paths produce.
//!
//! A `StreamResponse` carries a status and headers that are fixed at construction, plus a
//! body that is either already materialised or still filling through an ordered channel.
//! The producer closes the channel to signal completion, or sends a `BodyFailure` first to
//! signal terminal failure. Lines received before a failure are always delivered.

use crate::tasks::BackgroundTask;
use crate::types::{FetchPath, JobId};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyFailure(pub String);

impl fmt::Display for BodyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BodyFailure {}

type BodyItem = std::result::Result<String, BodyFailure>;
pub type BodyReceiver = mpsc::UnboundedReceiver<BodyItem>;

/// Producer half of a streaming body.
pub struct BodySender {
    tx: mpsc::UnboundedSender<BodyItem>,
}

impl BodySender {
    /// Appends one line. Returns `false` once the consumer has gone away.
    pub fn push_line(&self, line: impl Into<String>) -> bool {
        self.tx.send(Ok(line.into())).is_ok()
    }

    /// Closes the body successfully.
    pub fn finish(self) {}

    /// Closes the body with a terminal failure.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(BodyFailure(reason.into())));
    }

    pub fn consumer_gone(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn body_channel() -> (BodySender, BodyReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BodySender { tx }, rx)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed(String),
}

enum Body {
    Buffered(VecDeque<String>),
    Streaming(BodyReceiver),
}

pub struct StreamResponse {
    status: u16,
    headers: HeaderMap,
    path: FetchPath,
    job_id: Option<JobId>,
    body: Body,
    driver: Option<BackgroundTask>,
    terminal: Option<Terminal>,
}

/// Converts a JSON header object into a case-insensitive map, skipping invalid entries.
pub fn headers_from_json(value: &serde_json::Value) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(map) = value.as_object() {
        for (k, v) in map {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&text),
            ) {
                headers.append(name, val);
            }
        }
    }
    headers
}

impl StreamResponse {
    /// A response whose body is already fully known.
    pub fn from_text(status: u16, headers: HeaderMap, text: &str, path: FetchPath) -> Self {
        Self {
            status,
            headers,
            path,
            job_id: None,
            body: Body::Buffered(text.lines().map(str::to_string).collect()),
            driver: None,
            terminal: None,
        }
    }

    /// A response whose body keeps filling from `rx`.
    pub fn streaming(status: u16, headers: HeaderMap, rx: BodyReceiver, path: FetchPath) -> Self {
        Self {
            status,
            headers,
            path,
            job_id: None,
            body: Body::Streaming(rx),
            driver: None,
            terminal: None,
        }
    }

    /// Hands ownership of the task filling this body to the response; it is joined when
    /// the body ends.
    pub fn with_driver(mut self, driver: BackgroundTask) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn path(&self) -> FetchPath {
        self.path
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.terminal {
            Some(Terminal::Failed(reason)) => Some(reason),
            _ => None,
        }
    }

    async fn settle(&mut self, failure: Option<String>) -> Option<BodyFailure> {
        let driver_failure = match self.driver.take() {
            Some(driver) => driver.join().await,
            None => None,
        };
        let failure = failure.or(driver_failure);
        self.terminal = Some(match &failure {
            Some(reason) => Terminal::Failed(reason.clone()),
            None => Terminal::Completed,
        });
        failure.map(BodyFailure)
    }

    /// Next body line. A failure is yielded once, after every line delivered before it;
    /// afterwards (and after completion) this returns `None`.
    pub async fn next_line(&mut self) -> Option<BodyItem> {
        if self.terminal.is_some() {
            return None;
        }
        let next = match &mut self.body {
            Body::Buffered(lines) => lines.pop_front().map(Ok),
            Body::Streaming(rx) => rx.recv().await,
        };
        match next {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(failure)) => self.settle(Some(failure.0)).await.map(Err),
            None => self.settle(None).await.map(Err),
        }
    }

    /// Reads until the body is terminal and returns every line received, newline-joined.
    /// A failure ends the read early; it is available through `failure()` afterwards.
    pub async fn read_all(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(item) = self.next_line().await {
            match item {
                Ok(line) => {
                    buf.put_slice(line.as_bytes());
                    buf.put_u8(b'\n');
                }
                Err(_) => break,
            }
        }
        buf.freeze()
    }

    /// Lazy line sequence. Consumes the response; iterate a fresh response to restart.
    pub fn into_lines(self) -> impl Stream<Item = BodyItem> + Send {
        futures_util::stream::unfold(self, |mut resp| async move {
            resp.next_line().await.map(|item| (item, resp))
        })
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("path", &self.path)
            .field("job_id", &self.job_id)
            .field("terminal", &self.terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_buffered_body_reads_lines() {
        let mut resp =
            StreamResponse::from_text(200, HeaderMap::new(), "a\nb\n", FetchPath::Direct);
        assert_eq!(resp.read_all().await, Bytes::from_static(b"a\nb\n"));
        assert_eq!(resp.terminal(), Some(&Terminal::Completed));
    }

    #[tokio::test]
    async fn test_failure_after_lines_keeps_lines() {
        let (tx, rx) = body_channel();
        tx.push_line("one");
        tx.push_line("two");
        tx.fail("page closed");
        let mut resp = StreamResponse::streaming(200, HeaderMap::new(), rx, FetchPath::Direct);
        assert_eq!(resp.read_all().await, Bytes::from_static(b"one\ntwo\n"));
        assert_eq!(resp.failure(), Some("page closed"));
        assert!(resp.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_into_lines_yields_failure_last() {
        let (tx, rx) = body_channel();
        tx.push_line("x");
        tx.fail("boom");
        let resp = StreamResponse::streaming(200, HeaderMap::new(), rx, FetchPath::Relay);
        let items: Vec<_> = resp.into_lines().collect().await;
        assert_eq!(
            items,
            vec![Ok("x".to_string()), Err(BodyFailure("boom".to_string()))]
        );
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let headers = headers_from_json(&serde_json::json!({"Content-Type": "text/plain", "X-N": 3}));
        let resp = StreamResponse::from_text(200, headers, "", FetchPath::Direct);
        assert_eq!(resp.header("content-type"), Some("text/plain"));
        assert_eq!(resp.header("x-n"), Some("3"));
    }
}
