mod app;
mod gateway;
mod infra;
mod oauth;
mod shared;
pub mod test_support;

pub(crate) use infra::settings;

pub use app::logging;
pub use app::login::{LoginFacade, LoginState, LoginSubmission};
pub use gateway::static_files::{executable_dir, StaticFileServer};
pub use infra::settings::{LoggingSettings, LoginSettings};
pub use oauth::browser::{BrowserOpener, SystemBrowser};
pub use oauth::flow::{AuthorizationFlow, FlowObserver, LoginStarted};
pub use oauth::userinfo::UserIdentity;
pub use shared::error::{AppError, AppResult};

use std::path::PathBuf;

/// Environment variable naming the settings file used by the binary.
pub const ENV_SETTINGS_PATH: &str = "CRM_LOGIN_SETTINGS";
const DEFAULT_SETTINGS_FILE: &str = "settings.json";

pub fn settings_path() -> PathBuf {
    std::env::var_os(ENV_SETTINGS_PATH)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings() -> AppResult<LoginSettings> {
    settings::read(&settings_path())
}

/// Runs one browser login to completion and returns the signed-in identity.
pub async fn run_browser_login(settings: &LoginSettings) -> AppResult<UserIdentity> {
    let mut facade = LoginFacade::new(settings, std::sync::Arc::new(SystemBrowser))?;
    let started = facade.start_login().await?;
    tracing::info!(
        port = started.port,
        "waiting for the browser; if it did not open, visit: {}",
        started.auth_url
    );
    facade.wait_for_outcome().await
}

/// Serves `root` (or the executable directory) until Ctrl-C.
pub async fn run_static_server(settings: &LoginSettings, root: Option<PathBuf>) -> AppResult<()> {
    let root = match root.or_else(|| settings.static_root.clone()) {
        Some(root) => root,
        None => executable_dir()?,
    };
    let server = StaticFileServer::start(root, settings.static_server_port).await?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("SYSTEM_ERROR: failed to listen for ctrl-c: {e}"))?;
    server.stop().await;
    Ok(())
}
