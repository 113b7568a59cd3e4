//! Usage: Authenticated profile fetch that turns an access token into a [`UserIdentity`].

use crate::shared::error::{AppError, AppResult, AUTH_MISSING_EMAIL, AUTH_PROVIDER_ERROR, SYSTEM_ERROR};
use serde::Serialize;
use serde_json::Value;

use super::token_exchange::{join_error, parse_oauth_error_details};

pub(crate) const DEFAULT_DISPLAY_NAME: &str = "User";

/// The artifact a successful login hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub email: String,
    pub display_name: String,
}

pub(crate) async fn fetch_user_identity(
    client: &reqwest::Client,
    userinfo_url: &str,
    access_token: &str,
) -> AppResult<UserIdentity> {
    let response = client
        .get(userinfo_url.trim())
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::with_source(SYSTEM_ERROR, format!("User info error: {e}"), e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::with_source(SYSTEM_ERROR, format!("User info error: {e}"), e))?;

    tracing::debug!(status = status.as_u16(), "oauth userinfo response received");
    parse_userinfo_body(status, &body)
}

pub(crate) fn parse_userinfo_body(
    status: reqwest::StatusCode,
    body: &str,
) -> AppResult<UserIdentity> {
    let parsed: Option<Value> = serde_json::from_str(body).ok().filter(Value::is_object);

    if !status.is_success() {
        let detail = parsed
            .as_ref()
            .map(parse_oauth_error_details)
            .filter(|(code, detail)| code.is_some() || detail.is_some())
            .map(|(code, detail)| join_error(code, detail))
            .unwrap_or_else(|| format!("status {}", status.as_u16()));
        return Err(AppError::new(
            AUTH_PROVIDER_ERROR,
            format!("User info error: {detail}"),
        ));
    }

    let value = parsed
        .ok_or_else(|| AppError::new(SYSTEM_ERROR, "Invalid user info response format"))?;

    let email = value
        .get("email")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if email.is_empty() {
        return Err(AppError::new(
            AUTH_MISSING_EMAIL,
            "No email address in user info",
        ));
    }

    let display_name = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME);

    Ok(UserIdentity {
        email: email.to_string(),
        display_name: display_name.to_string(),
    })
}
