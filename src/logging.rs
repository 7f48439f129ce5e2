use crate::constants::REQUEST_ID_HEADER;
use crate::main_helper::Args;
use crate::types::RequestId;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::error;
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// Keeps the non-blocking log writers flushing; drop at shutdown.
pub struct LogGuards {
    _file: WorkerGuard,
}

/// Installs the global subscriber: stdout, a daily redacted log file, and span traces.
pub fn init_tracing(args: &Args) -> LogGuards {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "arena_bridge=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "arena-bridge.log");
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(crate::redaction_layer::RedactingWriter::new(file_appender));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    LogGuards { _file: file_guard }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Panics land in the log (and the redacted log file) before the default hook prints them.
pub fn setup_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(
            target: "panic",
            location = %location,
            thread = std::thread::current().name().unwrap_or("unnamed"),
            backtrace = %std::backtrace::Backtrace::capture(),
            "[bridge] Panic: {}",
            panic_message(info.payload())
        );
        previous(info);
    }));
}

/// Tags the request (and its response) with a fresh request id and runs it inside a span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = RequestId::new();
    if let Ok(val) = request_id.0.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", rid = %request_id.short());
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.0.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}
