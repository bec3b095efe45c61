//! Pure helpers: endpoint parsing, Retry-After, response body, backoff (no HTTP).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use url::{Host, Url};

use crate::error::{ClientResult, PublishError};
use crate::types::{PublishResult, PublisherConfig, SubmitResponse};

/// Path of the submit endpoint, relative to the API base URL.
pub(crate) const SUBMIT_PATH: &str = "junit/submit";

/// Build `{base}/junit/submit`, rejecting non-HTTP schemes.
pub(crate) fn submit_endpoint(base: &str) -> ClientResult<Url> {
    let base = format!("{}/", base.trim_end_matches('/'));
    let base = Url::parse(&base).map_err(|e| PublishError::Config {
        message: format!("invalid API URL '{}': {}", base.trim_end_matches('/'), e),
    })?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(PublishError::Config {
            message: format!("unsupported API URL scheme '{}'", base.scheme()),
        });
    }
    base.join(SUBMIT_PATH).map_err(|e| PublishError::Config {
        message: format!("invalid API URL: {}", e),
    })
}

/// `localhost`, `127.0.0.0/8` and `::1` accept unauthenticated submissions.
pub(crate) fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Parse a 2xx body into a [`PublishResult`].
pub(crate) fn parse_publish_body(body: &str) -> ClientResult<PublishResult> {
    serde_json::from_str::<SubmitResponse>(body)
        .map(PublishResult::from)
        .map_err(|e| PublishError::InvalidResponse {
            message: format!("failed to parse submit response: {}", e),
        })
}

/// Short excerpt of an error body for messages.
pub(crate) fn body_excerpt(body: &str, fallback: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    // Prefer a JSON `detail`/`message`/`error` field when present.
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for field in ["detail", "message", "error"] {
            if let Some(text) = json.get(field).and_then(|v| v.as_str()) {
                return text.chars().take(200).collect();
            }
        }
    }
    trimmed.chars().take(200).collect()
}

/// Delay before retry `retry` (1-based).
///
/// `min(base * 2^(retry-1), max)`; a server hint replaces the schedule but is
/// still capped. With jitter the delay is drawn uniformly from `[0, delay]`.
pub(crate) fn backoff_delay(
    config: &PublisherConfig,
    retry: u32,
    hint: Option<Duration>,
) -> Duration {
    let max = config.backoff_max();
    let delay = match hint {
        Some(hint) => hint.min(max),
        None => {
            let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
            config.backoff_base().saturating_mul(factor).min(max)
        }
    };
    if config.jitter && hint.is_none() {
        let ms = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> PublisherConfig {
        PublisherConfig::default().with_jitter(false)
    }

    #[test]
    fn test_submit_endpoint() {
        let url = submit_endpoint("https://jux.example.com/api/v1").unwrap();
        assert_eq!(url.as_str(), "https://jux.example.com/api/v1/junit/submit");

        let url = submit_endpoint("http://localhost:4000/api/v1/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:4000/api/v1/junit/submit");

        assert!(matches!(
            submit_endpoint("ftp://jux.example.com"),
            Err(PublishError::Config { .. })
        ));
        assert!(submit_endpoint("not a url").is_err());
    }

    #[test]
    fn test_is_loopback() {
        let check = |s: &str| is_loopback(&Url::parse(s).unwrap());
        assert!(check("http://localhost:4000/api"));
        assert!(check("http://LOCALHOST/api"));
        assert!(check("http://127.0.0.1:8080/"));
        assert!(check("http://127.10.0.3/"));
        assert!(check("http://[::1]:4000/"));
        assert!(!check("https://jux.example.com/"));
        assert!(!check("http://10.0.0.1/"));
        assert!(!check("http://localhost.example.com/"));
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2025, 1, 24, 12, 0, 0).unwrap();
        assert_eq!(parse_retry_after("7", now), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Fri, 24 Jan 2025 12:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        // Dates in the past mean "now".
        assert_eq!(
            parse_retry_after("Fri, 24 Jan 2025 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_backoff_schedule() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1, None), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 6, None), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 40, None), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_hint_is_capped() {
        let config = config();
        assert_eq!(
            backoff_delay(&config, 1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff_delay(&config, 1, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let config = PublisherConfig::default();
        for retry in 1..=5 {
            let ceiling = backoff_delay(&config.clone().with_jitter(false), retry, None);
            let jittered = backoff_delay(&config, retry, None);
            assert!(jittered <= ceiling);
        }
    }

    #[test]
    fn test_parse_publish_body() {
        let result = parse_publish_body(
            r#"{"test_run": {"id": "run-1", "status": "completed", "tests": 2}, "message": "stored"}"#,
        )
        .unwrap();
        assert_eq!(result.run_id, "run-1");
        assert_eq!(result.summary.tests, 2);

        let err = parse_publish_body("<html>ok</html>").unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }

    #[test]
    fn test_body_excerpt() {
        assert_eq!(body_excerpt("", "HTTP 400"), "HTTP 400");
        assert_eq!(
            body_excerpt(r#"{"detail": "missing testsuites"}"#, "x"),
            "missing testsuites"
        );
        assert_eq!(body_excerpt("plain text", "x"), "plain text");
    }
}
