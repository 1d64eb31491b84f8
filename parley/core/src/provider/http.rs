//! HTTP error mapping shared by the reqwest-based adapters

use std::time::Duration;

use reqwest::{header, StatusCode};
use serde_json::Value;

use super::{ProviderError, ProviderErrorKind};

/// Map a transport failure onto `Timeout` or `Network`
pub(crate) fn request_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Network
    };
    tracing::debug!(provider, kind = %kind, error = %err, "HTTP request failed");
    ProviderError::new(provider, kind, err.to_string())
}

/// Turn a non-success response into a provider error, keeping `Retry-After`
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    let (kind, message) = classify_status(status, &body);
    tracing::warn!(provider, status = status.as_u16(), kind = %kind, "Provider returned error status");

    let error = ProviderError::new(provider, kind, message);
    match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

/// Map an HTTP error status and body onto an error kind and message
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> (ProviderErrorKind, String) {
    let detail = error_message(body);

    match status.as_u16() {
        401 | 403 => (ProviderErrorKind::Auth, "Invalid API key".to_string()),
        429 => (ProviderErrorKind::RateLimit, "Rate limit exceeded".to_string()),
        400 if is_context_length(body) => (
            ProviderErrorKind::ContextLength,
            "Context length exceeded".to_string(),
        ),
        400 | 422 => (
            ProviderErrorKind::InvalidRequest,
            detail.unwrap_or_else(|| format!("Request rejected ({status})")),
        ),
        404 => (
            ProviderErrorKind::ModelNotAvailable,
            detail.unwrap_or_else(|| "Model not available".to_string()),
        ),
        500..=599 => (
            ProviderErrorKind::Server,
            detail.unwrap_or_else(|| format!("Provider server error ({status})")),
        ),
        _ => (
            ProviderErrorKind::InvalidRequest,
            detail.unwrap_or_else(|| format!("Unexpected status {status}")),
        ),
    }
}

fn is_context_length(body: &str) -> bool {
    body.contains("context_length")
        || body.contains("maximum context length")
        || body.contains("exceeds the maximum number of tokens")
}

/// `error.message` of a JSON error body; OpenAI and Gemini share the shape
pub(crate) fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
}
