//! Storage-mode orchestration.
//!
//! # State table
//!
//! ```text
//! mode   local write     publish              retryable failure   terminal failure
//! local  always          never                -                   -
//! api    never           always               run fails           run fails
//! both   always, first   after local write    warn, run succeeds  warn, run succeeds
//! cache  always, first   after local write    queue as pending    failed_permanent
//! ```
//!
//! A local-write failure is fatal and no publish is attempted. In `both`
//! mode, failing to update the record after a publish only warns; the
//! artifact is already stored.

use std::fmt;
use std::sync::Arc;

use jux_client::{
    Clock, HttpTransport, PublishError, PublishResult, PublisherClient, SystemClock, Transport,
};
use jux_evidence::{
    canonicalize, CanonicalizationError, ContentHash, Metadata, MetadataError, MetadataInjector,
    RawReport, SignedArtifact, Signer, SigningError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, JuxConfig, StorageMode};
use crate::queue::OfflineQueue;
use crate::store::{DeliveryState, PutOutcome, ReportStore, StorageError};

/// A failed run, by stage.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("metadata injection failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("canonicalization failed: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("local storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProcessingError {
    /// Pipeline stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Canonicalization(_) => "canonicalization",
            Self::Signing(_) => "signing",
            Self::Storage(_) => "storage",
            Self::Publish(_) => "publish",
            Self::Config(_) => "config",
        }
    }

    /// Machine-readable kind of the underlying error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(e) => e.kind(),
            Self::Canonicalization(e) => e.kind(),
            Self::Signing(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Publish(e) => e.kind(),
            Self::Config(e) => e.kind(),
        }
    }

    /// Suggested exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Storage(e) => e.exit_code(),
            Self::Publish(e) => e.exit_code(),
            _ => 1,
        }
    }
}

/// What happened to the publish leg of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Local mode.
    NotAttempted,
    Published(PublishResult),
    /// Cache mode, retryable failure: left pending for a later drain.
    Queued { error: PublishError },
    /// Cache mode, terminal failure: kept locally, never retried.
    FailedPermanent { error: PublishError },
    /// Both mode: failure logged, run still succeeds. Also cache mode when
    /// the stored report had already reached a terminal state.
    Failed { error: PublishError },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }

    pub fn error(&self) -> Option<&PublishError> {
        match self {
            Self::Queued { error } | Self::FailedPermanent { error } | Self::Failed { error } => {
                Some(error)
            }
            Self::NotAttempted | Self::Published(_) => None,
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub hash: ContentHash,
    pub mode: StorageMode,
    /// `None` when nothing was written locally (api mode).
    pub stored: Option<PutOutcome>,
    pub publish: PublishOutcome,
    /// Delivery state of the stored record after the run.
    pub delivery_state: Option<DeliveryState>,
    /// Metadata injected into the report.
    pub metadata: Metadata,
    pub artifact: SignedArtifact,
}

/// Runs reports through inject, canonicalize, sign, then store and publish
/// as the storage mode dictates.
pub struct StorageOrchestrator<T: Transport = HttpTransport> {
    mode: StorageMode,
    store: Option<ReportStore>,
    publisher: Option<PublisherClient<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> fmt::Debug for StorageOrchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageOrchestrator")
            .field("mode", &self.mode)
            .field("store", &self.store.as_ref().map(|s| s.root().to_path_buf()))
            .field(
                "endpoint",
                &self.publisher.as_ref().map(|p| p.endpoint().to_string()),
            )
            .finish()
    }
}

impl StorageOrchestrator<HttpTransport> {
    /// Build the store and publisher a validated config asks for.
    pub fn from_config(config: &JuxConfig) -> Result<Self, ProcessingError> {
        config.validate()?;
        let mode = config.storage_mode;

        let store = if mode.needs_local() {
            Some(ReportStore::open(config.storage_root()?)?)
        } else {
            None
        };
        let publisher = if mode.needs_publish() {
            Some(PublisherClient::new(config.api.clone())?)
        } else {
            None
        };

        Ok(Self::new(mode, store, publisher)?)
    }
}

impl<T: Transport> StorageOrchestrator<T> {
    /// Fails if the mode needs a store or publisher that is missing.
    pub fn new(
        mode: StorageMode,
        store: Option<ReportStore>,
        publisher: Option<PublisherClient<T>>,
    ) -> Result<Self, ConfigError> {
        if mode.needs_local() && store.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "storage_path".to_string(),
                message: format!("storage mode '{mode}' needs a local store"),
            });
        }
        if mode.needs_publish() && publisher.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "api".to_string(),
                message: format!("storage mode '{mode}' needs a publisher"),
            });
        }
        Ok(Self {
            mode,
            store,
            publisher,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for retry sleeps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn store(&self) -> Option<&ReportStore> {
        self.store.as_ref()
    }

    pub fn publisher(&self) -> Option<&PublisherClient<T>> {
        self.publisher.as_ref()
    }

    /// Queue over the local store, if there is one.
    pub fn queue(&self) -> Option<OfflineQueue> {
        self.store.clone().map(OfflineQueue::new)
    }

    /// Inject metadata, canonicalize, sign, then store and publish.
    pub fn process_report(
        &self,
        mut report: RawReport,
        injector: &MetadataInjector,
        signer: &Signer,
    ) -> Result<ProcessingResult, ProcessingError> {
        let metadata = injector.inject(&mut report)?;
        let form = canonicalize(report.document())?;
        let artifact = signer.sign(&form, report)?;
        debug!(hash = %artifact.hash(), bytes = artifact.bytes().len(), "report signed");

        let result = self.deliver(artifact, metadata)?;
        info!(
            hash = %result.hash,
            mode = %result.mode,
            state = result.delivery_state.map(|s| s.as_str()).unwrap_or("none"),
            published = result.publish.is_published(),
            "report processed"
        );
        Ok(result)
    }

    fn deliver(
        &self,
        artifact: SignedArtifact,
        metadata: Metadata,
    ) -> Result<ProcessingResult, ProcessingError> {
        let hash = artifact.hash();

        let stored = match (&self.store, self.mode.needs_local()) {
            (Some(store), true) => Some(store.put(&hash, artifact.bytes())?),
            _ => None,
        };

        let publish = match (&self.publisher, self.mode.needs_publish()) {
            (Some(publisher), true) => self.publish(publisher, &hash, artifact.bytes())?,
            _ => PublishOutcome::NotAttempted,
        };

        let delivery_state = match (&self.store, stored) {
            (Some(store), Some(_)) => match store.record(&hash) {
                Ok(record) => Some(record.delivery_state),
                Err(e) if self.mode == StorageMode::Both => {
                    warn!(hash = %hash, error = %e, "could not read report record");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            _ => None,
        };

        Ok(ProcessingResult {
            hash,
            mode: self.mode,
            stored,
            publish,
            delivery_state,
            metadata,
            artifact,
        })
    }

    fn publish(
        &self,
        publisher: &PublisherClient<T>,
        hash: &ContentHash,
        bytes: &[u8],
    ) -> Result<PublishOutcome, ProcessingError> {
        let outcome = publisher.submit(bytes, self.clock.as_ref());

        let queue = match (self.mode, self.queue()) {
            (StorageMode::Local | StorageMode::Api, _) | (_, None) => {
                // Nothing stored: the publish result is the run result.
                return Ok(PublishOutcome::Published(outcome?));
            }
            (_, Some(queue)) => queue,
        };

        if self.mode == StorageMode::Both {
            if let Err(e) = Self::record_outcome(&queue, hash, &outcome) {
                warn!(hash = %hash, error = %e, "could not update report record");
            }
            return Ok(match outcome {
                Ok(result) => PublishOutcome::Published(result),
                Err(error) => {
                    warn!(hash = %hash, error = %error, "publish failed, report kept locally");
                    PublishOutcome::Failed { error }
                }
            });
        }

        Self::record_outcome(&queue, hash, &outcome)?;
        let error = match outcome {
            Ok(result) => return Ok(PublishOutcome::Published(result)),
            Err(error) => error,
        };

        let record = if error.is_retryable() {
            queue.enqueue(hash)?
        } else {
            queue.mark_failed_permanent(hash, &error.to_string())?
        };
        Ok(match record.delivery_state {
            DeliveryState::Pending => {
                warn!(hash = %hash, error = %error, "publish failed, report queued");
                PublishOutcome::Queued { error }
            }
            DeliveryState::FailedPermanent => {
                warn!(
                    hash = %hash,
                    error = %error,
                    kind = error.kind(),
                    "publish rejected, report kept locally"
                );
                PublishOutcome::FailedPermanent { error }
            }
            state => {
                warn!(
                    hash = %hash,
                    error = %error,
                    state = %state,
                    "publish failed, record already final"
                );
                PublishOutcome::Failed { error }
            }
        })
    }

    /// Count the attempt and, on success, mark the report delivered.
    fn record_outcome(
        queue: &OfflineQueue,
        hash: &ContentHash,
        outcome: &Result<PublishResult, PublishError>,
    ) -> Result<(), StorageError> {
        match outcome {
            Ok(result) => {
                queue.record_attempt(hash, None)?;
                queue.mark_delivered(hash, &result.run_id)?;
            }
            Err(error) => {
                queue.record_attempt(hash, Some(error))?;
            }
        }
        Ok(())
    }
}

/// One-shot run: build an orchestrator for `mode` from `config` and process
/// `report`.
pub fn process_report(
    report: RawReport,
    injector: &MetadataInjector,
    signer: &Signer,
    mode: StorageMode,
    config: &JuxConfig,
) -> Result<ProcessingResult, ProcessingError> {
    let config = config.clone().with_storage_mode(mode);
    StorageOrchestrator::from_config(&config)?.process_report(report, injector, signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jux_client::{
        ClientResult, ManualClock, PublisherConfig, SubmitRequest, TokenProvider, TransportResponse,
    };
    use jux_evidence::{generate_signing_key, KeyAlgorithm};
    use tempfile::TempDir;

    const REPORT: &str = r#"<testsuites><testsuite name="s" tests="1"><testcase name="t"/></testsuite></testsuites>"#;

    struct Always(u16);

    impl Transport for Always {
        fn post(&self, _: &SubmitRequest<'_>) -> ClientResult<TransportResponse> {
            Ok(TransportResponse::new(
                self.0,
                r#"{"test_run": {"id": 3}, "message": "ok"}"#,
            ))
        }
    }

    fn publisher(status: u16) -> PublisherClient<Always> {
        let config = PublisherConfig::default()
            .with_max_retries(0)
            .with_jitter(false);
        PublisherClient::with_transport(config, TokenProvider::None, Always(status)).unwrap()
    }

    fn signer() -> Signer {
        Signer::new(generate_signing_key(KeyAlgorithm::Ed25519).unwrap())
    }

    #[test]
    fn test_new_requires_components() {
        let err =
            StorageOrchestrator::new(StorageMode::Cache, None, Some(publisher(201))).unwrap_err();
        assert!(err.to_string().contains("storage_path"));

        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let err = StorageOrchestrator::<Always>::new(StorageMode::Both, Some(store), None)
            .unwrap_err();
        assert!(err.to_string().contains("publisher"));
    }

    #[test]
    fn test_both_mode_terminal_failure_keeps_not_queued() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let orchestrator = StorageOrchestrator::new(
            StorageMode::Both,
            Some(store.clone()),
            Some(publisher(422)),
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::default()));

        let report = RawReport::parse(REPORT).unwrap();
        let result = orchestrator
            .process_report(report, &MetadataInjector::new(), &signer())
            .unwrap();

        assert!(matches!(result.publish, PublishOutcome::Failed { .. }));
        assert_eq!(result.delivery_state, Some(DeliveryState::NotQueued));
        let record = store.record(&result.hash).unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.is_some());
    }

    #[test]
    fn test_both_mode_success_is_delivered() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let orchestrator =
            StorageOrchestrator::new(StorageMode::Both, Some(store.clone()), Some(publisher(201)))
                .unwrap();

        let report = RawReport::parse(REPORT).unwrap();
        let result = orchestrator
            .process_report(report, &MetadataInjector::new(), &signer())
            .unwrap();

        assert_eq!(result.stored, Some(PutOutcome::Stored));
        assert_eq!(result.delivery_state, Some(DeliveryState::Delivered));
        assert_eq!(store.record(&result.hash).unwrap().run_id.as_deref(), Some("3"));
    }

    /// Answers with a fixed status after turning every record file into a
    /// directory, so record reads and writes fail from then on.
    struct BreaksRecords {
        records_dir: std::path::PathBuf,
        status: u16,
    }

    impl Transport for BreaksRecords {
        fn post(&self, _: &SubmitRequest<'_>) -> ClientResult<TransportResponse> {
            for entry in std::fs::read_dir(&self.records_dir).unwrap() {
                let path = entry.unwrap().path();
                std::fs::remove_file(&path).unwrap();
                std::fs::create_dir(&path).unwrap();
                std::fs::write(path.join("blocker"), b"").unwrap();
            }
            Ok(TransportResponse::new(
                self.status,
                r#"{"test_run": {"id": 4}, "message": "ok"}"#,
            ))
        }
    }

    fn breaking_orchestrator(
        mode: StorageMode,
        status: u16,
    ) -> (TempDir, StorageOrchestrator<BreaksRecords>) {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let transport = BreaksRecords {
            records_dir: dir.path().join("records"),
            status,
        };
        let config = PublisherConfig::default()
            .with_max_retries(0)
            .with_jitter(false);
        let publisher =
            PublisherClient::with_transport(config, TokenProvider::None, transport).unwrap();
        let orchestrator = StorageOrchestrator::new(mode, Some(store), Some(publisher))
            .unwrap()
            .with_clock(Arc::new(ManualClock::default()));
        (dir, orchestrator)
    }

    #[test]
    fn test_both_mode_survives_record_update_failure() {
        for status in [201, 503] {
            let (_dir, orchestrator) = breaking_orchestrator(StorageMode::Both, status);

            let result = orchestrator
                .process_report(
                    RawReport::parse(REPORT).unwrap(),
                    &MetadataInjector::new(),
                    &signer(),
                )
                .unwrap();

            assert_eq!(result.stored, Some(PutOutcome::Stored));
            assert_eq!(result.publish.is_published(), status == 201);
            assert_eq!(result.delivery_state, None);
            let store = orchestrator.store().unwrap();
            assert!(store.get(&result.hash).is_ok());
        }
    }

    #[test]
    fn test_cache_mode_fails_on_record_update_failure() {
        let (_dir, orchestrator) = breaking_orchestrator(StorageMode::Cache, 503);

        let err = orchestrator
            .process_report(
                RawReport::parse(REPORT).unwrap(),
                &MetadataInjector::new(),
                &signer(),
            )
            .unwrap_err();
        assert_eq!(err.stage(), "storage");
    }

    #[test]
    fn test_cache_mode_failure_on_delivered_report_is_not_queued() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let signer = signer();
        let process = |status: u16| {
            StorageOrchestrator::new(
                StorageMode::Cache,
                Some(store.clone()),
                Some(publisher(status)),
            )
            .unwrap()
            .with_clock(Arc::new(ManualClock::default()))
            .process_report(
                RawReport::parse(REPORT).unwrap(),
                &MetadataInjector::new(),
                &signer,
            )
            .unwrap()
        };

        let first = process(201);
        assert_eq!(first.delivery_state, Some(DeliveryState::Delivered));

        let again = process(503);
        assert_eq!(again.stored, Some(PutOutcome::AlreadyPresent));
        assert!(matches!(again.publish, PublishOutcome::Failed { .. }));
        assert_eq!(again.delivery_state, Some(DeliveryState::Delivered));

        let rejected = process(422);
        assert!(matches!(rejected.publish, PublishOutcome::Failed { .. }));
        assert_eq!(rejected.delivery_state, Some(DeliveryState::Delivered));

        let record = store.record(&first.hash).unwrap();
        assert_eq!(record.run_id.as_deref(), Some("3"));
        assert_eq!(record.attempts, 3);
    }

    #[test]
    fn test_signed_input_fails_before_storage() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let orchestrator =
            StorageOrchestrator::<Always>::new(StorageMode::Local, Some(store.clone()), None)
                .unwrap();
        let signer = signer();

        let signed = signer
            .sign_report(RawReport::parse(REPORT).unwrap())
            .unwrap();
        let again = RawReport::from_bytes(signed.bytes()).unwrap();
        let err = orchestrator
            .process_report(again, &MetadataInjector::new(), &signer)
            .unwrap_err();

        assert_eq!(err.stage(), "signing");
        assert_eq!(err.kind(), "already_signed");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_extra_fails_before_storage() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let orchestrator =
            StorageOrchestrator::<Always>::new(StorageMode::Local, Some(store.clone()), None)
                .unwrap();

        let injector = MetadataInjector::new().with_extra("git:commit", "forged");
        let err = orchestrator
            .process_report(RawReport::parse(REPORT).unwrap(), &injector, &signer())
            .unwrap_err();

        assert_eq!(err.stage(), "metadata");
        assert_eq!(err.kind(), "namespace_collision");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_publish_outcome_error_accessor() {
        let error = PublishError::Network {
            message: "down".into(),
        };
        assert_eq!(
            PublishOutcome::Queued {
                error: error.clone()
            }
            .error(),
            Some(&error)
        );
        assert_eq!(PublishOutcome::NotAttempted.error(), None);
    }
}
