use crate::arbiter::FetchArbiter;
use crate::config::BridgeConfig;
use crate::constants::{
    DEFAULT_BROWSER_ATTACH_RETRIES, DEFAULT_CONFIG_PATH, DEFAULT_HOST, DEFAULT_LOG_DIR,
    DEFAULT_MAX_BODY_SIZE, DEFAULT_PORT,
};
use crate::credentials::{ApiKeyRegistry, CredentialPool};
use crate::direct::BrowserFetcher;
use crate::recaptcha::RecaptchaMinter;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// DevTools HTTP endpoint of the browser to drive (e.g. http://127.0.0.1:9222).
    #[arg(long, env = "BRIDGE_CDP_URL")]
    pub cdp_url: Option<String>,
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_SIZE)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = DEFAULT_BROWSER_ATTACH_RETRIES)]
    pub browser_attach_retries: u32,
}

/// The command-line defaults, without consulting argv or the environment.
impl Default for Args {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            cdp_url: None,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            browser_attach_retries: DEFAULT_BROWSER_ATTACH_RETRIES,
        }
    }
}

/// Everything a request handler needs. Constructed once at startup; tests build their own.
#[derive(Clone)]
pub struct AppState {
    pub arbiter: Arc<FetchArbiter>,
    pub credentials: Arc<CredentialPool>,
    pub api_keys: Arc<ApiKeyRegistry>,
    /// Present when a site key is configured and a browser page is attached.
    pub recaptcha: Option<Arc<RecaptchaMinter>>,
    pub config: Arc<BridgeConfig>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(config: BridgeConfig, args: Args, direct: Option<Arc<BrowserFetcher>>) -> Self {
        let recaptcha = match (&config.recaptcha_site_key, &direct) {
            (Some(site_key), Some(fetcher)) if !site_key.trim().is_empty() => Some(Arc::new(
                RecaptchaMinter::new(fetcher.page().clone(), site_key.trim(), &config.recaptcha_action),
            )),
            _ => None,
        };
        let arbiter = Arc::new(FetchArbiter::from_config(&config, direct));
        Self {
            arbiter,
            recaptcha,
            credentials: Arc::new(CredentialPool::new(config.auth_tokens.clone())),
            api_keys: Arc::new(ApiKeyRegistry::new(config.api_keys.clone())),
            config: Arc::new(config),
            args: Arc::new(args),
        }
    }
}
