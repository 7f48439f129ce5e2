use arena_bridge::browser::cdp::CdpBrowser;
use arena_bridge::config::BridgeConfig;
use arena_bridge::direct::BrowserFetcher;
use arena_bridge::hardening::RetryPolicy;
use arena_bridge::relay::spawn_sweeper;
use arena_bridge::*;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn attach_browser(args: &Args) -> Option<Arc<CdpBrowser>> {
    let cdp_url = args.cdp_url.as_deref()?;
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            return None;
        }
    };

    let policy = RetryPolicy::new(args.browser_attach_retries, 500);
    match policy
        .execute_with_retry("browser attach", || CdpBrowser::attach(&client, cdp_url))
        .await
    {
        Ok(browser) => Some(Arc::new(browser)),
        Err(e) => {
            tracing::error!("Could not attach to browser at {}: {}", cdp_url, e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _log_guards = arena_bridge::logging::init_tracing(&args);
    arena_bridge::logging::setup_panic_hook();

    let config = match BridgeConfig::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    if config.api_keys.is_empty() {
        tracing::warn!("No API keys configured, chat endpoints are open");
    }
    if config.auth_tokens.is_empty() {
        tracing::warn!("No upstream auth tokens configured, relying on browser session recovery");
    }

    let browser = attach_browser(&args).await;
    let direct = browser.clone().map(|b| {
        Arc::new(
            BrowserFetcher::new(b.clone(), b)
                .with_provisional_user_id(config.provisional_user_id.clone()),
        )
    });
    if direct.is_none() {
        tracing::warn!("No browser attached, only the relay path is available");
    }

    let sweep_every = config.job_grace().max(Duration::from_secs(1));
    let state = Arc::new(AppState::new(config, args.clone(), direct));

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(state.arbiter.jobs().clone(), sweep_every, cancel.clone());

    let app = arena_bridge::server::router(state.clone());
    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("arena-bridge listening on {}", addr);

    let shutdown = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        })
        .await;
    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
    }

    cancel.cancel();
    sweeper.join().await;
    if let Some(browser) = browser {
        browser.close().await;
    }
}
