//! Metadata capture and injection.
//!
//! Metadata lives in disjoint namespaces and is written into the report's
//! root `<properties>` as `<property name="<namespace>:<key>" value="..."/>`
//! before the report is canonicalized, so the signature covers it.
//!
//! ```text
//! providers (env, git, ci, project, static) -> Metadata
//!   + extras   (validated: no reserved namespace prefixes)
//!   + overrides (win over detected values)
//!   -> MetadataInjector::apply -> RawReport properties
//! ```

mod providers;

pub use providers::{
    CiProvider, EnvSnapshot, EnvironmentProvider, GitProvider, ProjectProvider, StaticProvider,
};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MetadataError;
use crate::report::RawReport;

/// Metadata namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Execution context (host, user, platform, tools).
    Env,
    /// Version control.
    Git,
    /// CI provider.
    Ci,
    /// Project identity.
    Project,
    /// Free-form caller extras.
    Extra,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Env,
        Namespace::Git,
        Namespace::Ci,
        Namespace::Project,
        Namespace::Extra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Git => "git",
            Self::Ci => "ci",
            Self::Project => "project",
            Self::Extra => "extra",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `key` matches `[A-Za-z0-9_.-]+`.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Namespaced key/value pairs. Serializes as a flat `"ns:key" -> value` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Metadata {
    entries: BTreeMap<(Namespace, String), String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one entry.
    pub fn insert(
        &mut self,
        namespace: Namespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let key = key.into();
        if !is_valid_key(&key) {
            return Err(MetadataError::InvalidKey { key });
        }
        self.entries.insert((namespace, key), value.into());
        Ok(())
    }

    /// Insert, dropping entries with invalid keys (detected values).
    pub(crate) fn insert_detected(
        &mut self,
        namespace: Namespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let key = key.into();
        if let Err(e) = self.insert(namespace, key, value) {
            tracing::debug!(error = %e, "skipping detected metadata entry");
        }
    }

    pub fn get(&self, namespace: Namespace, key: &str) -> Option<&str> {
        self.entries
            .get(&(namespace, key.to_string()))
            .map(String::as_str)
    }

    /// Entries of one namespace.
    pub fn namespace(&self, namespace: Namespace) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .filter(move |((ns, _), _)| *ns == namespace)
            .map(|((_, key), value)| (key.as_str(), value.as_str()))
    }

    /// `(property name, value)` pairs, e.g. `("git:commit", "abc123")`.
    pub fn properties(&self) -> impl Iterator<Item = (String, &str)> + '_ {
        self.entries
            .iter()
            .map(|((ns, key), value)| (format!("{ns}:{key}"), value.as_str()))
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<BTreeMap<String, String>> for Metadata {
    type Error = MetadataError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut metadata = Metadata::new();
        for (name, value) in map {
            let (ns, key) = name
                .split_once(':')
                .and_then(|(ns, key)| Some((Namespace::parse(ns)?, key)))
                .ok_or_else(|| MetadataError::InvalidKey { key: name.clone() })?;
            metadata.insert(ns, key, value)?;
        }
        Ok(metadata)
    }
}

impl From<Metadata> for BTreeMap<String, String> {
    fn from(metadata: Metadata) -> Self {
        metadata
            .entries
            .into_iter()
            .map(|((ns, key), value)| (format!("{ns}:{key}"), value))
            .collect()
    }
}

/// Source of metadata. Providers degrade to empty output when their source
/// is unavailable instead of failing.
pub trait MetadataProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    fn provide(&self) -> Metadata;
}

/// Options for [`MetadataInjector::detect`].
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Explicit project name (wins over detection).
    pub project_name: Option<String>,
    /// Environment variables captured as `env:var.<NAME>`.
    pub include_env_vars: Vec<String>,
    /// Tool versions captured as `env:tool.<name>`.
    pub tools: BTreeMap<String, String>,
    /// Directory searched for git information; defaults to the current directory.
    pub working_dir: Option<PathBuf>,
}

/// Collects metadata from providers and writes it into a report.
#[derive(Default)]
pub struct MetadataInjector {
    providers: Vec<Box<dyn MetadataProvider>>,
    extras: Vec<(String, String)>,
    overrides: Metadata,
}

impl fmt::Debug for MetadataInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataInjector")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("extras", &self.extras)
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl MetadataInjector {
    /// Injector without providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Injector with the standard providers reading the process environment.
    pub fn detect(options: DetectOptions) -> Self {
        Self::detect_with_env(options, EnvSnapshot::from_process())
    }

    /// Like [`Self::detect`] with an explicit environment snapshot.
    pub fn detect_with_env(options: DetectOptions, env: EnvSnapshot) -> Self {
        let dir = options
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new()
            .with_provider(
                EnvironmentProvider::new(env.clone())
                    .with_env_vars(options.include_env_vars)
                    .with_tools(options.tools),
            )
            .with_provider(GitProvider::new(dir.clone()))
            .with_provider(CiProvider::new(env.clone()))
            .with_provider(ProjectProvider::new(options.project_name, env, dir))
    }

    pub fn with_provider(mut self, provider: impl MetadataProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Add a free-form extra, stored under the `extra` namespace.
    ///
    /// Validated at injection time: a key naming a reserved namespace
    /// (`git:commit`) is a [`MetadataError::NamespaceCollision`].
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.push((key.into(), value.into()));
        self
    }

    /// Set a value that wins over anything detected.
    pub fn with_override(
        mut self,
        namespace: Namespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, MetadataError> {
        self.overrides.insert(namespace, key, value)?;
        Ok(self)
    }

    /// Run providers, validate extras and apply overrides.
    pub fn collect(&self) -> Result<Metadata, MetadataError> {
        let mut metadata = Metadata::new();
        for provider in &self.providers {
            let provided = provider.provide();
            tracing::debug!(
                provider = provider.name(),
                entries = provided.len(),
                "collected metadata"
            );
            metadata.merge(provided);
        }
        for (key, value) in &self.extras {
            if let Some((prefix, _)) = key.split_once(':') {
                if let Some(namespace) = Namespace::parse(prefix) {
                    return Err(MetadataError::NamespaceCollision {
                        key: key.clone(),
                        namespace: namespace.to_string(),
                    });
                }
            }
            metadata.insert(Namespace::Extra, key.clone(), value.clone())?;
        }
        metadata.merge(self.overrides.clone());
        Ok(metadata)
    }

    /// Collect metadata and write it into `report`.
    pub fn inject(&self, report: &mut RawReport) -> Result<Metadata, MetadataError> {
        let metadata = self.collect()?;
        Self::apply(report, &metadata);
        Ok(metadata)
    }

    /// Write `metadata` into the report's properties. Idempotent.
    pub fn apply(report: &mut RawReport, metadata: &Metadata) {
        for (name, value) in metadata.properties() {
            report.set_property(&name, value);
        }
    }
}
