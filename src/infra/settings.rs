//! Usage: Persisted login settings (schema + read/write helpers).

use crate::shared::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_CALLBACK_PORT: u16 = 8080;
pub const DEFAULT_STATIC_SERVER_PORT: u16 = 8081;
const DEFAULT_CLIENT_ID: &str =
    "1091899419008-lc4d3dejgmb4udr61iglgbcca1h9c03g.apps.googleusercontent.com";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo";
const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];
const DEFAULT_CALLBACK_TIMEOUT_SECONDS: u32 = 300;
const DEFAULT_CLOSE_PING_TIMEOUT_SECONDS: u32 = 120;
const DEFAULT_PAGE_IDENTITY_WAIT_MS: u32 = 5_000;
const DEFAULT_HTTP_CONNECT_TIMEOUT_SECONDS: u32 = 10;
const DEFAULT_LOCAL_LOGIN_EMAIL_DOMAIN: &str = "gmail.com";
const DEFAULT_LOG_LEVEL: &str = "info";
const MAX_TIMEOUT_SECONDS: u32 = 24 * 60 * 60;
const MAX_PAGE_IDENTITY_WAIT_MS: u32 = 60_000;
const MAX_HTTP_CONNECT_TIMEOUT_SECONDS: u32 = 120;

pub const ENV_CLIENT_ID: &str = "CRM_LOGIN_CLIENT_ID";
pub const ENV_CALLBACK_PORT: &str = "CRM_LOGIN_CALLBACK_PORT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Enables the daily rolling file layer when set.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginSettings {
    pub schema_version: u32,
    pub preferred_callback_port: u16,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    // 0 disables the deadline (the flow then waits for the browser indefinitely).
    pub callback_timeout_seconds: u32,
    // 0 waits for the success page's close ping indefinitely.
    pub close_ping_timeout_seconds: u32,
    pub page_identity_wait_ms: u32,
    pub http_connect_timeout_seconds: u32,
    pub local_login_email_domain: String,
    pub static_server_port: u16,
    pub static_root: Option<PathBuf>,
    pub logging: LoggingSettings,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            preferred_callback_port: DEFAULT_CALLBACK_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            userinfo_url: DEFAULT_USERINFO_URL.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            callback_timeout_seconds: DEFAULT_CALLBACK_TIMEOUT_SECONDS,
            close_ping_timeout_seconds: DEFAULT_CLOSE_PING_TIMEOUT_SECONDS,
            page_identity_wait_ms: DEFAULT_PAGE_IDENTITY_WAIT_MS,
            http_connect_timeout_seconds: DEFAULT_HTTP_CONNECT_TIMEOUT_SECONDS,
            local_login_email_domain: DEFAULT_LOCAL_LOGIN_EMAIL_DOMAIN.to_string(),
            static_server_port: DEFAULT_STATIC_SERVER_PORT,
            static_root: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl LoginSettings {
    pub fn callback_timeout(&self) -> Option<Duration> {
        seconds_or_disabled(self.callback_timeout_seconds)
    }

    pub fn close_ping_timeout(&self) -> Option<Duration> {
        seconds_or_disabled(self.close_ping_timeout_seconds)
    }

    pub fn page_identity_wait(&self) -> Duration {
        Duration::from_millis(u64::from(self.page_identity_wait_ms))
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.http_connect_timeout_seconds))
    }
}

fn seconds_or_disabled(value: u32) -> Option<Duration> {
    if value == 0 {
        None
    } else {
        Some(Duration::from_secs(u64::from(value)))
    }
}

fn reset_blank(value: &mut String, fallback: &str) -> bool {
    if value.trim().is_empty() {
        *value = fallback.to_string();
        return true;
    }
    false
}

fn clamp_max(value: &mut u32, max: u32) -> bool {
    if *value > max {
        *value = max;
        return true;
    }
    false
}

fn sanitize_provider_settings(settings: &mut LoginSettings) -> bool {
    let mut changed = false;
    changed |= reset_blank(&mut settings.client_id, DEFAULT_CLIENT_ID);
    changed |= reset_blank(&mut settings.auth_url, DEFAULT_AUTH_URL);
    changed |= reset_blank(&mut settings.token_url, DEFAULT_TOKEN_URL);
    changed |= reset_blank(&mut settings.userinfo_url, DEFAULT_USERINFO_URL);

    let before = settings.scopes.len();
    settings.scopes.retain(|s| !s.trim().is_empty());
    if settings.scopes.len() != before {
        changed = true;
    }
    if settings.scopes.is_empty() {
        settings.scopes = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
        changed = true;
    }

    if settings
        .client_secret
        .as_deref()
        .is_some_and(|v| v.trim().is_empty())
    {
        settings.client_secret = None;
        changed = true;
    }
    changed
}

fn sanitize_timeouts(settings: &mut LoginSettings) -> bool {
    let mut changed = false;
    changed |= clamp_max(&mut settings.callback_timeout_seconds, MAX_TIMEOUT_SECONDS);
    changed |= clamp_max(&mut settings.close_ping_timeout_seconds, MAX_TIMEOUT_SECONDS);
    changed |= clamp_max(&mut settings.page_identity_wait_ms, MAX_PAGE_IDENTITY_WAIT_MS);

    if settings.http_connect_timeout_seconds == 0 {
        settings.http_connect_timeout_seconds = DEFAULT_HTTP_CONNECT_TIMEOUT_SECONDS;
        changed = true;
    }
    changed |= clamp_max(
        &mut settings.http_connect_timeout_seconds,
        MAX_HTTP_CONNECT_TIMEOUT_SECONDS,
    );
    changed
}

fn sanitize_misc(settings: &mut LoginSettings) -> bool {
    let mut changed = false;
    let domain = settings
        .local_login_email_domain
        .trim()
        .trim_start_matches('@')
        .to_string();
    if domain != settings.local_login_email_domain {
        settings.local_login_email_domain = domain;
        changed = true;
    }
    changed |= reset_blank(
        &mut settings.local_login_email_domain,
        DEFAULT_LOCAL_LOGIN_EMAIL_DOMAIN,
    );
    changed |= reset_blank(&mut settings.logging.level, DEFAULT_LOG_LEVEL);
    changed
}

/// Repairs out-of-range values in place; returns `true` when anything changed.
pub fn sanitize(settings: &mut LoginSettings) -> bool {
    let mut changed = false;
    changed |= sanitize_provider_settings(settings);
    changed |= sanitize_timeouts(settings);
    changed |= sanitize_misc(settings);
    if settings.schema_version < SCHEMA_VERSION {
        settings.schema_version = SCHEMA_VERSION;
        changed = true;
    }
    changed
}

fn apply_env_overrides(
    settings: &mut LoginSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> AppResult<()> {
    if let Some(client_id) = lookup(ENV_CLIENT_ID)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        settings.client_id = client_id;
    }
    if let Some(raw) = lookup(ENV_CALLBACK_PORT) {
        let port: u16 = raw.trim().parse().map_err(|_| {
            format!("SEC_INVALID_INPUT: {ENV_CALLBACK_PORT} must be a port number, got {raw:?}")
        })?;
        settings.preferred_callback_port = port;
    }
    Ok(())
}

pub(crate) fn parse_settings_json(content: &str) -> AppResult<LoginSettings> {
    let settings: LoginSettings = serde_json::from_str(content)
        .map_err(|e| format!("SYSTEM_ERROR: failed to parse settings.json: {e}"))?;
    Ok(settings)
}

/// Reads settings from `path`; a missing file yields defaults. Environment overrides apply last.
pub fn read(path: &Path) -> AppResult<LoginSettings> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("SYSTEM_ERROR: failed to read settings: {e}"))?;
        let mut settings = parse_settings_json(&content)?;
        if sanitize(&mut settings) {
            tracing::info!(path = %path.display(), "settings repaired during read");
            // Best-effort: persist repaired values while keeping read semantics.
            if let Err(err) = write(path, &settings) {
                tracing::warn!(path = %path.display(), "failed to persist repaired settings: {err}");
            }
        }
        settings
    } else {
        tracing::debug!(path = %path.display(), "settings file absent, using defaults");
        LoginSettings::default()
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

pub fn write(path: &Path, settings: &LoginSettings) -> AppResult<LoginSettings> {
    let mut settings = settings.clone();
    sanitize(&mut settings);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("SYSTEM_ERROR: failed to create settings dir: {e}"))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(&settings)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize settings: {e}"))?;
    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("SYSTEM_ERROR: failed to write temp settings file: {e}"))?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(format!("SYSTEM_ERROR: failed to finalize settings: {e}").into());
    }

    Ok(settings)
}
