//! Usage: Public test helpers for integration tests.

use crate::shared::error::AppResult;
use crate::LoginSettings;

pub use crate::oauth::callback_server::CallbackParams;

pub fn derive_pkce_challenge(verifier: &str) -> String {
    crate::oauth::pkce::derive_challenge(verifier)
}

pub fn generate_pkce_verifier() -> String {
    crate::oauth::pkce::generate_verifier()
}

pub fn parse_callback_target(target: &str) -> AppResult<CallbackParams> {
    crate::oauth::callback_server::parse_request_target(target).map(|parsed| parsed.params)
}

pub fn build_authorize_url(
    settings: &LoginSettings,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
) -> AppResult<String> {
    let cfg = crate::oauth::providers::OAuthProviderConfig::from_settings(settings);
    crate::oauth::providers::build_authorize_url(&cfg, redirect_uri, state, code_challenge)
}

pub fn mime_type_for(path: &str) -> &'static str {
    crate::gateway::static_files::mime_type_for(path)
}

/// Returns the sanitized settings and whether anything was repaired.
pub fn sanitize_settings(mut settings: LoginSettings) -> (LoginSettings, bool) {
    let changed = crate::infra::settings::sanitize(&mut settings);
    (settings, changed)
}

pub fn read_settings(path: &std::path::Path) -> AppResult<LoginSettings> {
    crate::infra::settings::read(path)
}

pub fn write_settings(path: &std::path::Path, settings: &LoginSettings) -> AppResult<LoginSettings> {
    crate::infra::settings::write(path, settings)
}
