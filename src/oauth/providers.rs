//! Usage: Provider endpoint/scope definitions and authorization URL construction.

use crate::infra::settings::LoginSettings;
use crate::shared::error::AppResult;
use reqwest::Url;

use super::pkce::CHALLENGE_METHOD;

pub(crate) const REDIRECT_HOST: &str = "localhost";
pub(crate) const CALLBACK_PATH: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OAuthProviderConfig {
    pub(crate) auth_url: String,
    pub(crate) token_url: String,
    pub(crate) userinfo_url: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: Option<String>,
    pub(crate) scopes: Vec<String>,
    pub(crate) default_callback_port: u16,
}

impl OAuthProviderConfig {
    pub(crate) fn from_settings(settings: &LoginSettings) -> Self {
        Self {
            auth_url: settings.auth_url.trim().to_string(),
            token_url: settings.token_url.trim().to_string(),
            userinfo_url: settings.userinfo_url.trim().to_string(),
            client_id: settings.client_id.trim().to_string(),
            client_secret: settings.client_secret.clone(),
            scopes: settings.scopes.clone(),
            default_callback_port: settings.preferred_callback_port,
        }
    }
}

/// `http://localhost:<port>/`; must name the port the listener actually serves.
pub(crate) fn make_redirect_uri(port: u16) -> String {
    format!("http://{REDIRECT_HOST}:{port}{CALLBACK_PATH}")
}

pub(crate) fn build_authorize_url(
    cfg: &OAuthProviderConfig,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
) -> AppResult<String> {
    let mut url = Url::parse(&cfg.auth_url)
        .map_err(|e| format!("SYSTEM_ERROR: invalid oauth auth url: {e}"))?;
    {
        let scope = cfg.scopes.join(" ");
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &cfg.client_id);
        query.append_pair("redirect_uri", redirect_uri);
        query.append_pair("response_type", "code");
        query.append_pair("scope", &scope);
        query.append_pair("state", state);
        query.append_pair("code_challenge", code_challenge);
        query.append_pair("code_challenge_method", CHALLENGE_METHOD);
    }
    Ok(url.to_string())
}
