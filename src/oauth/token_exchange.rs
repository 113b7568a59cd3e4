//! Usage: Token endpoint call for the authorization_code + PKCE grant.

use crate::shared::error::{AppError, AppResult, AUTH_MISSING_TOKEN, AUTH_PROVIDER_ERROR, SYSTEM_ERROR};
use crate::shared::security::mask_token;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct TokenExchangeRequest {
    pub(crate) token_uri: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: Option<String>,
    pub(crate) code: String,
    pub(crate) redirect_uri: String,
    pub(crate) code_verifier: String,
}

#[derive(Clone, PartialEq, Eq)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) token_type: Option<String>,
    pub(crate) expires_in: Option<i64>,
    pub(crate) refresh_token: Option<String>,
    pub(crate) id_token: Option<String>,
    pub(crate) scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &mask_token(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

pub(crate) async fn exchange_authorization_code(
    client: &reqwest::Client,
    req: &TokenExchangeRequest,
) -> AppResult<TokenResponse> {
    let mut form: HashMap<&str, String> = HashMap::new();
    form.insert("client_id", req.client_id.trim().to_string());
    form.insert("code", req.code.trim().to_string());
    form.insert("redirect_uri", req.redirect_uri.trim().to_string());
    form.insert("grant_type", "authorization_code".to_string());
    form.insert("code_verifier", req.code_verifier.trim().to_string());
    if let Some(secret) = req.client_secret.as_deref().map(str::trim) {
        if !secret.is_empty() {
            form.insert("client_secret", secret.to_string());
        }
    }

    let response = client
        .post(req.token_uri.trim())
        .form(&form)
        .send()
        .await
        .map_err(|e| {
            AppError::with_source(SYSTEM_ERROR, format!("Token exchange error: {e}"), e)
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::with_source(SYSTEM_ERROR, format!("Token exchange error: {e}"), e))?;

    let token = parse_token_body(&body)?;
    tracing::info!(
        status = status.as_u16(),
        access_token = %mask_token(&token.access_token),
        expires_in = token.expires_in,
        "oauth token exchange succeeded"
    );
    Ok(token)
}

/// Providers report failures in the JSON body (usually with a 4xx status), so the body decides.
pub(crate) fn parse_token_body(body: &str) -> AppResult<TokenResponse> {
    let value: Value = serde_json::from_str(body).map_err(|_| {
        tracing::warn!(
            body = %sanitize_oauth_error_body_snippet(body),
            "oauth token endpoint returned non-JSON body"
        );
        AppError::new(SYSTEM_ERROR, "Invalid response format from token endpoint")
    })?;
    if !value.is_object() {
        return Err(AppError::new(
            SYSTEM_ERROR,
            "Invalid response format from token endpoint",
        ));
    }

    if value.get("error").is_some() {
        let (code, detail) = parse_oauth_error_details(&value);
        return Err(AppError::new(
            AUTH_PROVIDER_ERROR,
            format!("Token exchange error: {}", join_error(code, detail)),
        ));
    }

    let access_token = non_empty_str(&value, "access_token")
        .ok_or_else(|| AppError::new(AUTH_MISSING_TOKEN, "No access token in response"))?;

    Ok(TokenResponse {
        access_token,
        token_type: non_empty_str(&value, "token_type"),
        expires_in: value.get("expires_in").and_then(parse_i64_lossy),
        refresh_token: non_empty_str(&value, "refresh_token"),
        id_token: non_empty_str(&value, "id_token"),
        scope: non_empty_str(&value, "scope"),
    })
}

/// `error` alone, or `error - description` when the provider supplies one.
pub(crate) fn join_error(code: Option<String>, detail: Option<String>) -> String {
    match (code, detail) {
        (Some(code), Some(detail)) => format!("{code} - {detail}"),
        (Some(code), None) => code,
        (None, Some(detail)) => detail,
        (None, None) => "unknown error".to_string(),
    }
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token") || key_lc.contains("secret") || key_lc == "code"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

pub(crate) fn sanitize_oauth_error_body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(500).collect();
        }
    }
    body.chars().take(500).collect()
}

/// Accepts both the RFC 6749 shape (`error` + `error_description`) and nested error objects.
pub(crate) fn parse_oauth_error_details(value: &Value) -> (Option<String>, Option<String>) {
    let mut code = None;
    let mut message = non_empty_str(value, "error_description");

    match value.get("error") {
        Some(Value::String(err)) => {
            code = Some(err.trim().to_string()).filter(|v| !v.is_empty());
        }
        Some(Value::Object(err_obj)) => {
            code = err_obj
                .get("status")
                .or_else(|| err_obj.get("code"))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|v| !v.is_empty());
            if message.is_none() {
                message = err_obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
            }
        }
        _ => {}
    }

    (code, message)
}
