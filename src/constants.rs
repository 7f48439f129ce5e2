/// Web origins the backend accepts session cookies from
pub const CANONICAL_ORIGIN: &str = "https://lmarena.ai";
pub const ALTERNATE_ORIGIN: &str = "https://arena.ai";
pub const KNOWN_ORIGINS: &[&str] = &[CANONICAL_ORIGIN, ALTERNATE_ORIGIN];

/// Cookie names the backend trusts
pub const AUTH_COOKIE_NAME: &str = "arena-auth-prod-v1";
pub const PROVISIONAL_USER_ID_COOKIE_NAME: &str = "provisional_user_id";

/// localStorage key the in-page client reads the provisional user id from
pub const PROVISIONAL_USER_ID_STORAGE_KEY: &str = "provisional_user_id";

/// Supabase-style session record keys look like `sb-<project>-auth-token`
pub const SESSION_STORAGE_KEY_PATTERN: &str = r"^sb-.+-auth-token$";

/// Prefix the backend expects on an encoded auth cookie value
pub const AUTH_COOKIE_ENCODING_PREFIX: &str = "base64-";

/// Page binding used by the in-page fetch to report status and body lines
pub const REPORT_CHUNK_BINDING: &str = "reportChunk";

/// Backend streaming endpoint, relative to an origin
pub const STREAM_CREATE_EVALUATION_PATH: &str = "/nextjs-api/stream/create-evaluation";

/// Payload field carrying the reCAPTCHA v3 token, and the action it is minted for
pub const RECAPTCHA_PAYLOAD_KEY: &str = "recaptchaV3Token";
pub const DEFAULT_RECAPTCHA_ACTION: &str = "chat_submit";

/// Relay report envelope types
pub const REPORT_TYPE_META: &str = "meta";
pub const REPORT_TYPE_DONE: &str = "done";
pub const REPORT_TYPE_ERROR: &str = "error";

/// Timeout defaults (seconds)
pub const DEFAULT_RELAY_PICKUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RELAY_STATUS_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_RELAY_ACTIVE_WINDOW_SECS: u64 = 30;
pub const DEFAULT_RELAY_JOB_GRACE_SECS: u64 = 30;
pub const DEFAULT_DIRECT_STATUS_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// How long a dropped background task may keep running before the reaper aborts it
pub const BACKGROUND_TASK_REAP_SECS: u64 = 30;

/// Rate limiting window for API keys
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Command-line defaults
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONFIG_PATH: &str = "bridge.json";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_BROWSER_ATTACH_RETRIES: u32 = 5;

pub const REQUEST_ID_HEADER: &str = "x-bridge-request-id";
pub const SSE_DONE_MARKER: &str = "[DONE]";
