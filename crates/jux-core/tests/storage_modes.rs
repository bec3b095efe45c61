//! End-to-end runs through the orchestrator, one per storage mode.
//!
//! Publishing goes through scripted transports and a manual clock, so
//! attempts and backoff sleeps are observable without a server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jux_client::{
    ClientResult, ManualClock, PublishError, PublisherClient, PublisherConfig, SubmitRequest,
    TokenProvider, Transport, TransportResponse,
};
use jux_core::{
    process_report, DeliveryState, JuxConfig, OfflineQueue, ProcessingError, PublishOutcome,
    PutOutcome, ReportStore, RetentionPolicy, StorageMode, StorageOrchestrator,
};
use jux_evidence::{
    generate_signing_key, verify, KeyAlgorithm, MetadataInjector, Namespace, RawReport, Signer,
    StaticProvider,
};
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

const REPORT: &str = r#"<testsuites name="billing">
  <testsuite name="invoices" tests="3" failures="1" skipped="1">
    <testcase classname="invoices" name="totals"/>
    <testcase classname="invoices" name="rounding"><failure message="off by one">expected 10 got 11</failure></testcase>
    <testcase classname="invoices" name="currency"><skipped/></testcase>
  </testsuite>
</testsuites>"#;

const CREATED: &str = r#"{"test_run": {"id": "run-42", "status": "completed", "tests": 3, "failures": 1, "errors": 0, "skipped": 1}, "message": "Test report submitted successfully"}"#;

const BASE: Duration = Duration::from_millis(100);

/// Replays answers in order, then keeps answering with the last one.
struct Scripted {
    answers: Mutex<Vec<ClientResult<TransportResponse>>>,
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl Scripted {
    fn new(answers: Vec<ClientResult<TransportResponse>>) -> Self {
        Self {
            answers: Mutex::new(answers),
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn status(statuses: &[u16]) -> Self {
        Self::new(
            statuses
                .iter()
                .map(|&s| Ok(TransportResponse::new(s, if s < 300 { CREATED } else { "" })))
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }
}

impl Transport for Scripted {
    fn post(&self, request: &SubmitRequest<'_>) -> ClientResult<TransportResponse> {
        self.bodies.lock().unwrap().push(request.body.to_vec());
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.remove(0)
        } else {
            answers[0].clone()
        }
    }
}

fn publisher(transport: Scripted) -> PublisherClient<Scripted> {
    let config = PublisherConfig::default()
        .with_max_retries(2)
        .with_backoff(BASE, Duration::from_secs(1))
        .with_jitter(false);
    PublisherClient::with_transport(config, TokenProvider::None, transport).unwrap()
}

fn injector() -> MetadataInjector {
    MetadataInjector::new()
        .with_provider(StaticProvider::new(Namespace::Git).with("commit", "4f2a9c1e"))
        .with_extra("build", "1187")
}

fn report() -> RawReport {
    RawReport::parse(REPORT).unwrap()
}

struct Harness {
    _dir: TempDir,
    store: ReportStore,
    signer: Signer,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path().join("store")).unwrap();
        Self {
            _dir: dir,
            store,
            signer: Signer::new(generate_signing_key(KeyAlgorithm::Ed25519).unwrap()),
            clock: Arc::new(ManualClock::default()),
        }
    }

    fn orchestrator(
        &self,
        mode: StorageMode,
        transport: Option<Scripted>,
    ) -> StorageOrchestrator<Scripted> {
        let store = mode.needs_local().then(|| self.store.clone());
        StorageOrchestrator::new(mode, store, transport.map(publisher))
            .unwrap()
            .with_clock(self.clock.clone())
    }
}

fn calls(orchestrator: &StorageOrchestrator<Scripted>) -> usize {
    orchestrator.publisher().unwrap().transport().calls()
}

#[test]
fn test_local_mode_stores_without_publishing() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Local, None);

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert_eq!(result.publish, PublishOutcome::NotAttempted);
    assert_eq!(result.stored, Some(PutOutcome::Stored));
    assert_eq!(result.delivery_state, Some(DeliveryState::NotQueued));

    let listing = h.store.list().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].hash, result.hash);

    // Stored bytes are exactly the signed artifact and still verify.
    let stored = h.store.get(&result.hash).unwrap();
    assert_eq!(stored, result.artifact.bytes());
    let verified = verify(&stored, &h.signer.key().trusted_key());
    assert!(verified.is_valid(), "{verified:?}");

    let record = h.store.record(&result.hash).unwrap();
    assert_eq!(record.metadata.get("git:commit").map(String::as_str), Some("4f2a9c1e"));
    assert_eq!(record.metadata.get("extra:build").map(String::as_str), Some("1187"));
    assert_eq!(record.summary.unwrap().tests, 3);
}

#[test]
fn test_local_mode_with_publisher_stub_makes_no_calls() {
    let h = Harness::new();
    let store = ReportStore::open(h.store.root()).unwrap();
    let orchestrator = StorageOrchestrator::new(
        StorageMode::Local,
        Some(store),
        Some(publisher(Scripted::status(&[201]))),
    )
    .unwrap();

    orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert_eq!(calls(&orchestrator), 0);
    assert_eq!(h.store.list().unwrap().len(), 1);
}

#[test]
fn test_same_report_twice_is_already_present() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Local, None);

    let first = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();
    let second = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert_eq!(first.hash, second.hash);
    assert_eq!(second.stored, Some(PutOutcome::AlreadyPresent));
    assert_eq!(h.store.list().unwrap().len(), 1);
}

#[test]
fn test_api_mode_connection_failure_stores_nothing() {
    // Grab a free port, then close it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = TempDir::new().unwrap();
    let storage = dir.path().join("store");
    let config = JuxConfig::default()
        .with_storage_path(&storage)
        .with_api(
            PublisherConfig::default()
                .with_url(format!("http://127.0.0.1:{port}/api/v1"))
                .with_timeout_secs(2)
                .with_max_retries(2)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
                .with_jitter(false),
        );
    let signer = Signer::new(generate_signing_key(KeyAlgorithm::Ed25519).unwrap());

    let err = process_report(report(), &injector(), &signer, StorageMode::Api, &config)
        .unwrap_err();

    match &err {
        ProcessingError::Publish(PublishError::RetriesExhausted { attempts, last }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(last.kind(), "network");
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(err.stage(), "publish");
    assert_eq!(err.exit_code(), 5);
    assert!(!storage.exists(), "api mode must not create a store");
}

#[test]
fn test_api_mode_success_keeps_nothing_locally() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Api, Some(Scripted::status(&[201])));

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    match &result.publish {
        PublishOutcome::Published(published) => assert_eq!(published.run_id, "run-42"),
        other => panic!("expected published, got {other:?}"),
    }
    assert_eq!(result.stored, None);
    assert_eq!(result.delivery_state, None);
    assert!(h.store.list().unwrap().is_empty());
}

#[test]
fn test_cache_mode_transient_failures_then_delivered() {
    let h = Harness::new();
    let transport = Scripted::status(&[503, 503, 201]);
    let orchestrator = h.orchestrator(StorageMode::Cache, Some(transport));

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert!(result.publish.is_published());
    assert_eq!(result.delivery_state, Some(DeliveryState::Delivered));
    assert_eq!(calls(&orchestrator), 3);
    assert_eq!(h.clock.sleeps(), vec![BASE, BASE * 2]);

    let record = h.store.record(&result.hash).unwrap();
    assert_eq!(record.run_id.as_deref(), Some("run-42"));
    assert!(record.delivered_at.is_some());

    // Nothing left for a later drain.
    let queue = orchestrator.queue().unwrap();
    let drained = queue
        .drain(orchestrator.publisher().unwrap(), None, h.clock.as_ref())
        .unwrap();
    assert_eq!(drained.attempted, 0);
    assert_eq!(calls(&orchestrator), 3);
}

#[test]
fn test_cache_mode_unauthorized_is_failed_permanent() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Cache, Some(Scripted::status(&[401])));

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert!(matches!(
        result.publish,
        PublishOutcome::FailedPermanent {
            error: PublishError::Auth { status: 401, .. }
        }
    ));
    assert_eq!(result.delivery_state, Some(DeliveryState::FailedPermanent));
    assert_eq!(calls(&orchestrator), 1);
    assert!(h.clock.sleeps().is_empty());

    // Retained and retrievable, never drained.
    assert_eq!(h.store.get(&result.hash).unwrap(), result.artifact.bytes());
    let queue = orchestrator.queue().unwrap();
    assert!(queue.pending().unwrap().is_empty());
    let drained = queue
        .drain(orchestrator.publisher().unwrap(), None, h.clock.as_ref())
        .unwrap();
    assert_eq!(drained.attempted, 0);
}

#[test]
fn test_cache_mode_outage_queues_then_drain_delivers() {
    let h = Harness::new();
    let down = || {
        Err(PublishError::Network {
            message: "connection refused".into(),
        })
    };
    let orchestrator = h.orchestrator(StorageMode::Cache, Some(Scripted::new(vec![down()])));

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert!(matches!(result.publish, PublishOutcome::Queued { .. }));
    assert_eq!(result.delivery_state, Some(DeliveryState::Pending));
    let record = h.store.record(&result.hash).unwrap();
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.unwrap().contains("connection refused"));

    // Pending reports survive cleanup.
    let policy = RetentionPolicy::default()
        .with_max_age(chrono::Duration::zero())
        .with_max_total_size(0);
    let cleanup = h
        .store
        .cleanup(&policy, false, chrono::Utc::now() + chrono::Duration::days(365))
        .unwrap();
    assert!(cleanup.removed.is_empty());
    assert_eq!(cleanup.skipped, 1);

    // Server is back.
    let queue = OfflineQueue::new(h.store.clone());
    let healthy = publisher(Scripted::status(&[201]));
    let drained = queue.drain(&healthy, Some(10), h.clock.as_ref()).unwrap();

    assert_eq!(drained.delivered, vec![result.hash]);
    assert_eq!(healthy.transport().bodies.lock().unwrap()[0], result.artifact.bytes());
    let record = h.store.record(&result.hash).unwrap();
    assert_eq!(record.delivery_state, DeliveryState::Delivered);
    assert_eq!(record.attempts, 2);
}

#[test]
fn test_local_write_failure_skips_publish() {
    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Cache, Some(Scripted::status(&[201])));

    // Make the report path unusable: a directory where the file should go.
    let hash = {
        let mut unsigned = report();
        injector().inject(&mut unsigned).unwrap();
        jux_evidence::canonicalize(unsigned.document()).unwrap().hash()
    };
    std::fs::create_dir_all(h.store.report_path(&hash)).unwrap();

    let err = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap_err();

    assert_eq!(err.stage(), "storage");
    assert_eq!(calls(&orchestrator), 0);
}

#[derive(Clone)]
struct MockWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MockWriter {
    type Writer = MockWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn test_both_mode_failure_warns_and_succeeds() {
    let writer = MockWriter {
        buf: Arc::new(Mutex::new(Vec::new())),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .json()
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = Harness::new();
    let orchestrator = h.orchestrator(StorageMode::Both, Some(Scripted::status(&[503])));

    let result = orchestrator
        .process_report(report(), &injector(), &h.signer)
        .unwrap();

    assert!(matches!(result.publish, PublishOutcome::Failed { .. }));
    assert_eq!(result.delivery_state, Some(DeliveryState::NotQueued));
    assert!(h.store.contains(&result.hash));
    assert_eq!(calls(&orchestrator), 3);

    let output = String::from_utf8(writer.buf.lock().unwrap().clone()).unwrap();
    let warnings: Vec<serde_json::Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let failure = warnings
        .iter()
        .find(|w| w["fields"]["message"] == "publish failed, report kept locally")
        .expect("missing publish failure warning");
    assert_eq!(failure["level"], "WARN");
    assert_eq!(failure["fields"]["hash"], result.hash.to_string());
    // Retries are logged on the way.
    assert!(warnings
        .iter()
        .any(|w| w["fields"]["message"] == "retrying request"));
}
