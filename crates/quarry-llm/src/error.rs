use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} server error (status {status})")]
    Server { provider: String, status: u16 },

    #[error("{provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("{provider} rejected the request: {message}")]
    Permanent { provider: String, message: String },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("no embedding provider available")]
    NoProviderAvailable,

    #[error("{0}")]
    Other(String),
}

impl EmbedError {
    /// Transient failures are retried and, once retries run out, count as a
    /// rate-limit hit rather than a circuit-breaker failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Server { .. } | Self::Unavailable { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Provider-supplied retry hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Map a non-success HTTP status to the matching error class.
#[must_use]
pub fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> EmbedError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return EmbedError::RateLimited {
            provider: provider.to_owned(),
            retry_after,
        };
    }
    if status.is_server_error() {
        return EmbedError::Server {
            provider: provider.to_owned(),
            status: status.as_u16(),
        };
    }
    let snippet: String = body.chars().take(200).collect();
    EmbedError::Permanent {
        provider: provider.to_owned(),
        message: format!("status {status}: {snippet}"),
    }
}
