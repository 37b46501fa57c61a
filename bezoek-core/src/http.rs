//! Request execution policy shared by every provider adapter.
//!
//! All provider traffic funnels through [`send_with_policy`]: per-attempt
//! timeouts, transport retries for GET requests only, and rate-limit
//! back-off driven by the `Retry-After` header. Mutating requests are never
//! replayed, so a transport failure or 429 on anything but a GET fails
//! immediately.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::BezoekError;
use crate::sanitize::{sanitize_headers, sanitize_json};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry and timeout budget applied to each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Timeout applied to every individual attempt.
    pub timeout: Duration,
    /// Extra attempts granted to GET requests after a transport failure or
    /// rate-limit response.
    pub retry_count: usize,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
        }
    }
}

/// Execute a request under the given policy.
///
/// `configure` is applied to a fresh builder on every attempt so request
/// bodies and headers are rebuilt rather than replayed.
///
/// # Errors
///
/// Returns [`BezoekError::Network`] when the transport budget is exhausted
/// and [`BezoekError::RateLimited`] when the provider keeps answering 429.
/// Responses with any other status are returned to the caller untouched.
pub async fn send_with_policy(
    client: &Client,
    policy: &RequestPolicy,
    method: Method,
    url: &str,
    configure: impl Fn(RequestBuilder) -> RequestBuilder,
) -> Result<Response, BezoekError> {
    let is_get = method == Method::GET;
    let transport_budget = if is_get { policy.retry_count } else { 0 };
    let mut attempt = 0_usize;
    loop {
        attempt += 1;
        let request = configure(client.request(method.clone(), url))
            .timeout(policy.timeout)
            .build()?;
        trace!(
            method = %method,
            url,
            headers = ?sanitize_headers(request.headers()),
            attempt,
            "sending provider request"
        );
        match client.execute(request).await {
            Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                if is_get && attempt <= transport_budget {
                    let delay = retry_after_seconds(response.headers());
                    warn!(url, attempt, delay_seconds = delay, "rate limited, backing off");
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                    continue;
                }
                return Err(BezoekError::RateLimited(String::from(
                    "Provider rate limit exceeded.",
                )));
            }
            Ok(response) => {
                debug!(method = %method, url, status = response.status().as_u16(), attempt, "provider response");
                return Ok(response);
            }
            Err(error) => {
                if attempt > transport_budget {
                    return Err(BezoekError::Network(error));
                }
                warn!(url, attempt, error = %error, "transport failure, retrying");
            }
        }
    }
}

/// Fail non-success responses with the canonical status error.
///
/// # Errors
///
/// Returns [`BezoekError::Auth`] for 401/403 and [`BezoekError::Provider`]
/// for any other non-2xx status.
pub fn expect_success(response: Response) -> Result<Response, BezoekError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response.status()))
    }
}

/// Canonical error for a non-success status code.
#[must_use]
pub fn status_error(status: StatusCode) -> BezoekError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        BezoekError::Auth(String::from("Authentication failed."))
    } else {
        BezoekError::Provider(format!(
            "Provider request failed with status {}.",
            status.as_u16()
        ))
    }
}

/// Decode a response body as JSON, tracing the sanitized payload.
///
/// # Errors
///
/// Returns [`BezoekError::Provider`] when the body is not valid JSON or does
/// not match the expected shape.
pub async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, BezoekError> {
    let payload: Value = response.json().await.map_err(|_| invalid_json())?;
    trace!(payload = %sanitize_json(&payload), "decoded response payload");
    serde_json::from_value(payload).map_err(|_| invalid_json())
}

fn invalid_json() -> BezoekError {
    BezoekError::Provider(String::from("Response did not contain valid JSON."))
}

fn retry_after_seconds(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok())
        .unwrap_or(0)
}
