pub mod arbiter;
pub mod browser;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod direct;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod origin;
pub mod recaptcha;
pub mod redaction;
pub mod redaction_layer;
pub mod relay;
pub mod server;
pub mod session;
pub mod specs;
pub mod stream_response;
pub mod tasks;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
