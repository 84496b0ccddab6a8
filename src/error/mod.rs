use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// HTTP statuses that indicate a transient upstream condition.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Authentication failed for {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("Rate limit exceeded for {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    #[error("{provider} error{}: {message}", .status.map(|s| format!(" {}", s)).unwrap_or_default())]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
        retryable: bool,
        retry_after: Option<Duration>,
    },

    #[error("Circuit breaker is open for {key}")]
    CircuitOpen { key: String },

    #[error("All candidates failed ({}): {source}", .attempted.join(", "))]
    AllCandidatesExhausted {
        attempted: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("No candidate models available for {0}")]
    NoCandidates(String),

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Authentication {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Generic vendor failure without an HTTP status; never retried.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            status: None,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Vendor failure derived from an HTTP status.
    pub fn provider_status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Error::Provider {
            provider: provider.into(),
            status: Some(status),
            message: message.into(),
            retryable: RETRYABLE_STATUS_CODES.contains(&status),
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider {
                status, retryable, ..
            } => *retryable || status.map_or(false, |s| RETRYABLE_STATUS_CODES.contains(&s)),
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status()
                        .map_or(false, |s| RETRYABLE_STATUS_CODES.contains(&s.as_u16()))
            }
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Provider { retry_after, .. } => *retry_after,
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Local rejections (rate limit, open circuit, cancellation) are not
    /// evidence that the provider itself is failing.
    pub fn counts_against_health(&self) -> bool {
        !matches!(
            self,
            Error::RateLimited { .. } | Error::CircuitOpen { .. } | Error::Cancelled(_)
        )
    }

    /// The innermost cause, looking through `AllCandidatesExhausted`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::AllCandidatesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(Error::provider_status("openai", status, "boom", None).is_retryable());
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!Error::provider_status("openai", status, "boom", None).is_retryable());
        }
    }

    #[test]
    fn test_local_rejections_are_not_retryable() {
        let rate_limited = Error::RateLimited {
            provider: "openai".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert!(!rate_limited.is_retryable());
        assert!(!rate_limited.counts_against_health());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(5)));

        let auth = Error::authentication("anthropic", "invalid x-api-key");
        assert!(!auth.is_retryable());
        assert!(auth.counts_against_health());
    }

    #[test]
    fn test_root_cause_unwraps_exhaustion() {
        let err = Error::AllCandidatesExhausted {
            attempted: vec!["a:m".to_string(), "b:m".to_string()],
            source: Box::new(Error::provider_status("b", 503, "unavailable", None)),
        };
        assert!(matches!(
            err.root_cause(),
            Error::Provider { status: Some(503), .. }
        ));
        assert!(err.to_string().contains("a:m, b:m"));
    }
}
