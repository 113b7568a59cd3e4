//! Usage: Unified login error model (every failure renders as a `CODE: message` string).

use std::sync::Arc;

pub type AppResult<T> = Result<T, AppError>;

pub(crate) const SYSTEM_ERROR: &str = "SYSTEM_ERROR";
pub(crate) const AUTH_PROVIDER_ERROR: &str = "AUTH_PROVIDER_ERROR";
pub(crate) const AUTH_EMPTY_CODE: &str = "AUTH_EMPTY_CODE";
pub(crate) const AUTH_MISSING_TOKEN: &str = "AUTH_MISSING_TOKEN";
pub(crate) const AUTH_MISSING_EMAIL: &str = "AUTH_MISSING_EMAIL";
pub(crate) const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
pub(crate) const AUTH_CANCELLED: &str = "AUTH_CANCELLED";
pub(crate) const SEC_INVALID_INPUT: &str = "SEC_INVALID_INPUT";
const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    code: String,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(
        code: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn split_code_message(raw: &str) -> Option<(&str, &str)> {
    let msg = raw.trim();
    let msg = msg.strip_prefix("Error:").unwrap_or(msg).trim();
    if msg.is_empty() {
        return None;
    }

    let (maybe_code, rest) = msg.split_once(':')?;
    let code = maybe_code.trim();
    let mut chars = code.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_') {
        return None;
    }
    Some((code, rest.trim()))
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        if let Some((code, rest)) = split_code_message(&value) {
            let message = if rest.is_empty() { value.trim() } else { rest };
            return AppError::new(code, message);
        }
        AppError::new(INTERNAL_ERROR, value)
    }
}

impl From<&'static str> for AppError {
    fn from(value: &'static str) -> Self {
        AppError::from(value.to_string())
    }
}

impl From<AppError> for String {
    fn from(value: AppError) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_string_is_split_into_code_and_message() {
        let err = AppError::from("AUTH_MISSING_EMAIL: No email address in user info".to_string());
        assert_eq!(err.code(), AUTH_MISSING_EMAIL);
        assert_eq!(err.message(), "No email address in user info");
        assert_eq!(
            err.to_string(),
            "AUTH_MISSING_EMAIL: No email address in user info"
        );
    }

    #[test]
    fn plain_string_maps_to_internal_error() {
        let err = AppError::from("something broke: badly".to_string());
        assert_eq!(err.code(), INTERNAL_ERROR);
        assert_eq!(err.message(), "something broke: badly");
    }

    #[test]
    fn leading_error_prefix_is_ignored() {
        let err = AppError::from("Error: SYSTEM_ERROR: bind failed");
        assert_eq!(err.code(), SYSTEM_ERROR);
        assert_eq!(err.message(), "bind failed");
    }

    #[test]
    fn source_is_exposed_through_error_trait() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = AppError::with_source(SYSTEM_ERROR, "bind failed", io);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("in use"));
    }
}
