//! HTTP plumbing shared by the vendor adapters.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .map_err(Error::from)
}

/// Longest `Retry-After` hint taken from a vendor. Larger values are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a `Retry-After` header given either as delta-seconds or as an
/// HTTP date. The result never exceeds [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let delay = if let Ok(secs) = value.parse::<u64>() {
        Duration::from_secs(secs)
    } else if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER)
    } else {
        let at = DateTime::parse_from_rfc2822(value).ok()?;
        let delta = at.with_timezone(&Utc) - Utc::now();
        delta.to_std().unwrap_or(Duration::ZERO)
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Pulls a human-readable message out of a vendor error body. All three
/// vendors nest it under `error.message`; fall back to the raw body.
pub fn extract_error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    });
    match message {
        Some(m) => m,
        None if body.trim().is_empty() => "empty response body".to_string(),
        None => body.chars().take(500).collect(),
    }
}

pub fn error_for_status(provider: &str, status: StatusCode, retry_after: Option<Duration>, body: &str) -> Error {
    let message = extract_error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::authentication(provider, message),
        _ => Error::provider_status(provider, status.as_u16(), message, retry_after),
    }
}

/// Converts a non-success response into a typed error.
pub async fn error_from_response(provider: &str, response: Response) -> Error {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    error!("{} API error: {} - {}", provider, status, extract_error_message(&body));
    error_for_status(provider, status, retry_after, &body)
}

/// Sends `request`, aborting the transport when `cancel` fires. Non-success
/// statuses come back as errors.
pub async fn send(
    provider: &str,
    request: RequestBuilder,
    cancel: &CancellationToken,
    request_id: &str,
) -> Result<Response> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(provider, request_id, "Request cancelled before response headers");
            return Err(Error::Cancelled(request_id.to_string()));
        }
        response = request.send() => response?,
    };

    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(provider, response).await)
    }
}

/// Reads a JSON body, still honouring cancellation.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    response: Response,
    cancel: &CancellationToken,
    request_id: &str,
) -> Result<T> {
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled(request_id.to_string())),
        bytes = response.bytes() => bytes?,
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::provider(provider, format!("Failed to parse response: {}", e))
    })
}
