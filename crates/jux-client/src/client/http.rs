//! HTTP layer: transport seam, status mapping, retry.
//!
//! This is the ONLY place for status code handling. client/mod.rs never
//! interprets status codes.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::error::{ClientResult, PublishError};
use crate::types::{PublishResult, PublisherConfig};

use super::helpers::{backoff_delay, body_excerpt, parse_publish_body, parse_retry_after};

/// `User-Agent` sent with every submission.
pub const CLIENT_USER_AGENT: &str = concat!("jux-client/", env!("CARGO_PKG_VERSION"));

/// One submission as handed to a [`Transport`].
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub url: &'a Url,
    pub body: &'a [u8],
    /// Bearer token; `None` for unauthenticated loopback submissions.
    pub token: Option<&'a str>,
}

/// Raw server answer, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// Sends one request. Connection, timeout and IO failures are
/// [`PublishError::Network`]; any HTTP answer is a [`TransportResponse`].
pub trait Transport: Send + Sync {
    fn post(&self, request: &SubmitRequest<'_>) -> ClientResult<TransportResponse>;
}

/// Blocking reqwest transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> ClientResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| PublishError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post(&self, request: &SubmitRequest<'_>) -> ClientResult<TransportResponse> {
        let mut builder = self
            .client
            .post(request.url.clone())
            .header(CONTENT_TYPE, "application/xml")
            .body(request.body.to_vec());

        if let Some(token) = request.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().map_err(|e| PublishError::Network {
            message: format!("failed to read response body: {}", e),
        })?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Map a server answer to a result.
pub(crate) fn classify(
    response: &TransportResponse,
    clock: &dyn Clock,
) -> ClientResult<PublishResult> {
    let status = response.status;
    let message = || body_excerpt(&response.body, &format!("HTTP {}", status));

    match status {
        200..=299 => parse_publish_body(&response.body),

        400 | 422 => Err(PublishError::Validation {
            status,
            message: message(),
        }),

        401 | 403 => Err(PublishError::Auth {
            status,
            message: message(),
        }),

        408 => Err(PublishError::Network {
            message: format!("HTTP 408: {}", message()),
        }),

        429 => Err(PublishError::RateLimited {
            retry_after: response
                .retry_after
                .as_deref()
                .and_then(|v| parse_retry_after(v, clock.now())),
        }),

        500..=599 => Err(PublishError::ServerError {
            status,
            message: message(),
        }),

        _ => Err(PublishError::Rejected {
            status,
            message: message(),
        }),
    }
}

/// Submit with retries. Sleeps go through `clock`.
pub(crate) fn submit_with_retry(
    transport: &dyn Transport,
    request: &SubmitRequest<'_>,
    config: &PublisherConfig,
    clock: &dyn Clock,
) -> ClientResult<PublishResult> {
    let mut retries = 0;
    let max_retries = config.max_retries;

    loop {
        let result = transport
            .post(request)
            .and_then(|response| classify(&response, clock));

        match result {
            Ok(published) => {
                debug!(
                    run_id = %published.run_id,
                    attempts = retries + 1,
                    "report published"
                );
                return Ok(published);
            }
            Err(e) if e.is_retryable() && retries < max_retries => {
                retries += 1;

                let hint = match &e {
                    PublishError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                let backoff = backoff_delay(config, retries, hint);

                warn!(
                    error = %e,
                    retry = retries,
                    max_retries = max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying request"
                );

                clock.sleep(backoff);
            }
            Err(e) if e.is_retryable() => {
                return Err(PublishError::RetriesExhausted {
                    attempts: retries + 1,
                    last: Box::new(e),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_status_classification() {
        let clock = ManualClock::default();
        let kind = |status: u16| {
            classify(&TransportResponse::new(status, ""), &clock)
                .unwrap_err()
                .kind()
        };

        assert_eq!(kind(400), "validation");
        assert_eq!(kind(422), "validation");
        assert_eq!(kind(401), "auth");
        assert_eq!(kind(403), "auth");
        assert_eq!(kind(404), "rejected");
        assert_eq!(kind(409), "rejected");
        assert_eq!(kind(408), "network");
        assert_eq!(kind(429), "rate_limited");
        assert_eq!(kind(500), "server_error");
        assert_eq!(kind(503), "server_error");
        // 2xx with an empty body is not a valid publish response.
        assert_eq!(kind(201), "invalid_response");
    }

    #[test]
    fn test_rate_limit_hint_is_parsed() {
        let clock = ManualClock::default();
        let response = TransportResponse::new(429, "slow down").with_retry_after("12");
        let err = classify(&response, &clock).unwrap_err();
        assert_eq!(
            err,
            PublishError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn test_error_message_uses_body() {
        let clock = ManualClock::default();
        let response = TransportResponse::new(422, r#"{"detail": "no testsuite element"}"#);
        let err = classify(&response, &clock).unwrap_err();
        assert_eq!(
            err.to_string(),
            "report rejected as invalid (HTTP 422): no testsuite element"
        );
    }
}
