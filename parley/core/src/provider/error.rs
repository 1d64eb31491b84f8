//! Normalized provider errors
//!
//! Every adapter maps its failures onto [`ProviderErrorKind`]; callers switch
//! on the kind only.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What went wrong talking to a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// Missing or rejected credentials
    Auth,
    /// Provider rate limit hit
    RateLimit,
    /// Connection-level failure
    Network,
    /// Provider-side failure (5xx)
    Server,
    /// Request exceeds the model's context window
    ContextLength,
    /// Provider rejected the request
    InvalidRequest,
    /// Caller cancelled
    Cancelled,
    /// Provider-local timeout elapsed
    Timeout,
    /// Requested model does not exist or is not available
    ModelNotAvailable,
}

impl ProviderErrorKind {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Server | Self::Timeout
        )
    }

    /// Stable identifier used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Server => "server",
            Self::ContextLength => "context_length",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ModelNotAvailable => "model_not_available",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a [`Provider`](super::Provider)
#[derive(Clone, Debug, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    /// Provider name
    pub provider: String,
    /// Normalized kind
    pub kind: ProviderErrorKind,
    /// Human-readable message
    pub message: String,
    /// Provider-supplied retry hint
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Create a provider error
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Cancellation error for `provider`
    pub fn cancelled(provider: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Cancelled, "Request cancelled")
    }

    /// Attach a retry hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
