//! Resolved run configuration.
//!
//! Loading files is the caller's job; the core consumes one immutable
//! [`JuxConfig`] built from defaults, YAML and environment overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use jux_client::PublisherConfig;
use jux_evidence::{DetectOptions, MetadataInjector, Signer, SigningError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{ReportStore, RetentionPolicy, StorageResult};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its domain.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// YAML could not be parsed.
    #[error("failed to parse config: {message}")]
    Parse { message: String },

    /// Signing needs a key and none is configured.
    #[error("no signing key configured (set signing.key_path or JUX_KEY_PATH)")]
    MissingSigningKey,

    #[error("failed to load signing key: {0}")]
    Signing(#[from] SigningError),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidValue { .. } => "invalid_value",
            Self::Parse { .. } => "parse",
            Self::MissingSigningKey => "missing_signing_key",
            Self::Signing(_) => "signing_key",
        }
    }
}

/// Where signed reports go, fixed for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Local store only.
    #[default]
    Local,
    /// Publish only; nothing is kept locally.
    Api,
    /// Store locally, then publish; publish failures only warn.
    Both,
    /// Store locally, then publish; failures are queued for a later drain.
    Cache,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Api => "api",
            Self::Both => "both",
            Self::Cache => "cache",
        }
    }

    pub fn needs_local(&self) -> bool {
        !matches!(self, Self::Api)
    }

    pub fn needs_publish(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "api" => Ok(Self::Api),
            "both" => Ok(Self::Both),
            "cache" => Ok(Self::Cache),
            other => Err(ConfigError::invalid(
                "storage_mode",
                format!("'{other}' (expected local, api, both or cache)"),
            )),
        }
    }
}

/// Metadata capture settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Explicit project name; detected from the repository when unset.
    pub project_name: Option<String>,
    /// Environment variables recorded as `env:var.<NAME>`.
    pub include_env_vars: Vec<String>,
    /// Free-form `extra:` properties.
    pub extras: BTreeMap<String, String>,
    /// Directory searched for git information.
    pub git_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub key_path: Option<PathBuf>,
    /// PEM certificate embedded in `ds:KeyInfo`.
    pub certificate_path: Option<PathBuf>,
}

/// Cleanup limits; unset means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_days: Option<u32>,
    pub max_total_size_mb: Option<u64>,
}

/// Full configuration for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JuxConfig {
    #[serde(default)]
    pub storage_mode: StorageMode,

    /// Store root; the platform data directory when unset.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    #[serde(default)]
    pub api: PublisherConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    env_var(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string()))
        })
        .transpose()
}

impl JuxConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `JUX_STORAGE_MODE` | `storage_mode` |
    /// | `JUX_STORAGE_PATH` | `storage_path` |
    /// | `JUX_API_URL` | `api.url` |
    /// | `JUX_API_TOKEN` | `api.token` |
    /// | `JUX_API_TIMEOUT` | `api.timeout_secs` |
    /// | `JUX_API_MAX_RETRIES` | `api.max_retries` |
    /// | `JUX_PROJECT_NAME` | `metadata.project_name` |
    /// | `JUX_KEY_PATH` | `signing.key_path` |
    /// | `JUX_CERT_PATH` | `signing.certificate_path` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Parse YAML; missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Apply the environment variables listed in [`JuxConfig::from_env`]
    /// on top of `self`. Unset or empty variables leave fields alone.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(mode) = env_var("JUX_STORAGE_MODE") {
            self.storage_mode = mode.parse()?;
        }
        if let Some(path) = env_var("JUX_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_var("JUX_API_URL") {
            self.api.url = url;
        }
        if let Some(token) = env_var("JUX_API_TOKEN") {
            self.api.token = Some(token);
        }
        if let Some(timeout) = env_parse("JUX_API_TIMEOUT")? {
            self.api.timeout_secs = timeout;
        }
        if let Some(retries) = env_parse("JUX_API_MAX_RETRIES")? {
            self.api.max_retries = retries;
        }
        if let Some(name) = env_var("JUX_PROJECT_NAME") {
            self.metadata.project_name = Some(name);
        }
        if let Some(path) = env_var("JUX_KEY_PATH") {
            self.signing.key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var("JUX_CERT_PATH") {
            self.signing.certificate_path = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_api(mut self, api: PublisherConfig) -> Self {
        self.api = api;
        self
    }

    pub fn with_signing_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.signing.key_path = Some(key_path.into());
        self
    }

    pub fn with_certificate(mut self, certificate_path: impl Into<PathBuf>) -> Self {
        self.signing.certificate_path = Some(certificate_path.into());
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.project_name = Some(name.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.extras.insert(key.into(), value.into());
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_mode.needs_publish() {
            let url = url::Url::parse(&self.api.url)
                .map_err(|e| ConfigError::invalid("api.url", e.to_string()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::invalid(
                    "api.url",
                    format!("unsupported scheme '{}'", url.scheme()),
                ));
            }
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::invalid("api.timeout_secs", "must be positive"));
        }
        if self.api.backoff_max_ms < self.api.backoff_base_ms {
            return Err(ConfigError::invalid(
                "api.backoff_max_ms",
                "must not be smaller than api.backoff_base_ms",
            ));
        }
        if self.signing.certificate_path.is_some() && self.signing.key_path.is_none() {
            return Err(ConfigError::invalid(
                "signing.certificate_path",
                "a certificate needs signing.key_path",
            ));
        }
        Ok(())
    }

    /// Store root: `storage_path` or [`ReportStore::default_root`].
    pub fn storage_root(&self) -> StorageResult<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(path.clone()),
            None => ReportStore::default_root(),
        }
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            project_name: self.metadata.project_name.clone(),
            include_env_vars: self.metadata.include_env_vars.clone(),
            working_dir: self.metadata.git_dir.clone(),
            ..DetectOptions::default()
        }
    }

    /// Injector with the standard providers plus configured extras.
    pub fn metadata_injector(&self) -> MetadataInjector {
        self.metadata
            .extras
            .iter()
            .fold(MetadataInjector::detect(self.detect_options()), |injector, (k, v)| {
                injector.with_extra(k, v)
            })
    }

    /// Load the configured signing key (and certificate).
    pub fn signer(&self) -> Result<Signer, ConfigError> {
        let key_path = self
            .signing
            .key_path
            .as_ref()
            .ok_or(ConfigError::MissingSigningKey)?;
        Ok(Signer::from_pem_files(
            key_path,
            self.signing.certificate_path.as_deref(),
        )?)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: self
                .retention
                .max_age_days
                .map(|days| chrono::Duration::days(i64::from(days))),
            max_total_size: self
                .retention
                .max_total_size_mb
                .map(|mb| mb.saturating_mul(1024 * 1024)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 9] = [
        "JUX_STORAGE_MODE",
        "JUX_STORAGE_PATH",
        "JUX_API_URL",
        "JUX_API_TOKEN",
        "JUX_API_TIMEOUT",
        "JUX_API_MAX_RETRIES",
        "JUX_PROJECT_NAME",
        "JUX_KEY_PATH",
        "JUX_CERT_PATH",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_storage_mode_parsing() {
        assert_eq!("CACHE".parse::<StorageMode>().unwrap(), StorageMode::Cache);
        assert_eq!(" both ".parse::<StorageMode>().unwrap(), StorageMode::Both);
        let err = "s3".parse::<StorageMode>().unwrap_err();
        assert_eq!(err.kind(), "invalid_value");
        assert!(err.to_string().contains("storage_mode"));

        assert!(StorageMode::Local.needs_local());
        assert!(!StorageMode::Local.needs_publish());
        assert!(!StorageMode::Api.needs_local());
        assert!(StorageMode::Cache.needs_local() && StorageMode::Cache.needs_publish());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("JUX_STORAGE_MODE", "cache");
        std::env::set_var("JUX_STORAGE_PATH", "/var/lib/jux");
        std::env::set_var("JUX_API_URL", "https://jux.example.com/api/v1");
        std::env::set_var("JUX_API_TOKEN", "secret");
        std::env::set_var("JUX_API_MAX_RETRIES", "5");
        std::env::set_var("JUX_KEY_PATH", "/etc/jux/key.pem");

        let config = JuxConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.storage_mode, StorageMode::Cache);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/jux")));
        assert_eq!(config.api.url, "https://jux.example.com/api/v1");
        assert_eq!(config.api.token.as_deref(), Some("secret"));
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.signing.key_path, Some(PathBuf::from("/etc/jux/key.pem")));
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_numbers() {
        clear_env();
        std::env::set_var("JUX_API_TIMEOUT", "soon");
        let err = JuxConfig::from_env().unwrap_err();
        clear_env();
        assert!(err.to_string().contains("JUX_API_TIMEOUT"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_yaml() {
        clear_env();
        let yaml = r#"
storage_mode: both
api:
  url: https://yaml.example.com/api/v1
  max_retries: 1
"#;
        std::env::set_var("JUX_API_URL", "https://env.example.com/api/v1");
        let config = JuxConfig::from_yaml_str(yaml)
            .unwrap()
            .with_env_overrides()
            .unwrap();
        clear_env();

        assert_eq!(config.storage_mode, StorageMode::Both);
        assert_eq!(config.api.url, "https://env.example.com/api/v1");
        assert_eq!(config.api.max_retries, 1);
    }

    #[test]
    fn test_from_yaml_defaults() {
        let yaml = r#"
storage_mode: cache
storage_path: /tmp/jux
metadata:
  project_name: billing
  include_env_vars: [RUST_LOG]
  extras:
    build: "1187"
retention:
  max_age_days: 30
"#;
        let config = JuxConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.storage_mode, StorageMode::Cache);
        assert_eq!(config.api, PublisherConfig::default());
        assert_eq!(config.metadata.extras.get("build").map(String::as_str), Some("1187"));

        let policy = config.retention_policy();
        assert_eq!(policy.max_age, Some(chrono::Duration::days(30)));
        assert_eq!(policy.max_total_size, None);

        let options = config.detect_options();
        assert_eq!(options.project_name.as_deref(), Some("billing"));
        assert_eq!(options.include_env_vars, vec!["RUST_LOG".to_string()]);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_mode() {
        let err = JuxConfig::from_yaml_str("storage_mode: s3\n").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_validate() {
        let config = JuxConfig::default().with_storage_mode(StorageMode::Api);
        config.validate().unwrap();

        let bad_url = config.clone().with_api(PublisherConfig::default().with_url("ftp://x"));
        assert!(bad_url.validate().is_err());

        // URL is irrelevant in local mode.
        let local = bad_url.with_storage_mode(StorageMode::Local);
        local.validate().unwrap();

        let mut backwards = JuxConfig::default();
        backwards.api.backoff_base_ms = 5_000;
        backwards.api.backoff_max_ms = 1_000;
        assert!(backwards.validate().is_err());

        let cert_only = JuxConfig::default().with_certificate("/tmp/cert.pem");
        let err = cert_only.validate().unwrap_err();
        assert!(err.to_string().contains("signing.certificate_path"));
    }

    #[test]
    fn test_signer_requires_key() {
        let err = JuxConfig::default().signer().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSigningKey));
    }

    #[test]
    fn test_storage_root_prefers_explicit_path() {
        let config = JuxConfig::default().with_storage_path("/srv/jux");
        assert_eq!(config.storage_root().unwrap(), PathBuf::from("/srv/jux"));
    }
}
