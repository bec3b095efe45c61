//! Publisher configuration and the submit response types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counters reported by the server for a submitted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub tests: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub skipped: u64,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Server-assigned test run id.
    pub run_id: String,

    /// Run status as reported by the server.
    #[serde(default)]
    pub status: Option<String>,

    pub summary: RunSummary,

    /// Human-readable server message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a 2xx response to `POST /junit/submit`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubmitResponse {
    pub test_run: TestRun,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TestRun {
    pub id: RunId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub summary: RunSummary,
}

/// Servers send the run id as a string or an integer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RunId {
    Text(String),
    Number(u64),
}

impl From<SubmitResponse> for PublishResult {
    fn from(response: SubmitResponse) -> Self {
        let run_id = match response.test_run.id {
            RunId::Text(id) => id,
            RunId::Number(id) => id.to_string(),
        };
        Self {
            run_id,
            status: response.test_run.status,
            summary: response.test_run.summary,
            message: response.message,
        }
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Base URL of the API (reports go to `{url}/junit/submit`).
    #[serde(default = "default_api_url")]
    pub url: String,

    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Additional attempts after the first for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Randomize delays uniformly in `[0, delay]`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_api_url() -> String {
    "http://localhost:4000/api/v1".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            token: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl PublisherConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `JUX_API_URL` | API base URL |
    /// | `JUX_API_TOKEN` | Bearer token |
    /// | `JUX_API_TIMEOUT` | Request timeout (seconds) |
    /// | `JUX_API_MAX_RETRIES` | Retries for transient failures |
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("JUX_API_URL").unwrap_or_else(|_| default_api_url()),
            token: std::env::var("JUX_API_TOKEN").ok().filter(|t| !t.is_empty()),
            timeout_secs: std::env::var("JUX_API_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout),
            max_retries: std::env::var("JUX_API_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            ..Self::default()
        }
    }

    /// Set the token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base and maximum backoff.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_defaults_from_empty_yaml() {
        let config: PublisherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PublisherConfig::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), Duration::from_secs(30));
        assert!(config.jitter);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("JUX_API_URL", "https://jux.example.com/api/v1");
        std::env::set_var("JUX_API_MAX_RETRIES", "5");
        std::env::set_var("JUX_API_TIMEOUT", "not-a-number");

        let config = PublisherConfig::from_env();
        assert_eq!(config.url, "https://jux.example.com/api/v1");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout_secs, 30);

        std::env::remove_var("JUX_API_URL");
        std::env::remove_var("JUX_API_MAX_RETRIES");
        std::env::remove_var("JUX_API_TIMEOUT");
    }

    #[test]
    fn test_submit_response_accepts_numeric_id() {
        let body = r#"{"test_run": {"id": 42, "status": "completed", "tests": 3, "failures": 1}, "message": "ok"}"#;
        let response: SubmitResponse = serde_json::from_str(body).unwrap();
        let result = PublishResult::from(response);
        assert_eq!(result.run_id, "42");
        assert_eq!(result.summary.tests, 3);
        assert_eq!(result.summary.failures, 1);
        assert_eq!(result.summary.skipped, 0);
        assert_eq!(result.message.as_deref(), Some("ok"));
    }
}
