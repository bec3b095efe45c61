//! Storage, offline queue and storage-mode orchestration for signed reports.
//!
//! A run takes one unsigned JUnit report through metadata injection,
//! canonicalization and signing, then stores and/or publishes the signed
//! artifact according to the [`StorageMode`]:
//!
//! - `local`: content-addressed store only
//! - `api`: publish only
//! - `both`: store, then publish; publish failures only warn
//! - `cache`: store, then publish; failures are queued for [`OfflineQueue::drain`]
//!
//! # Quick Start
//!
//! ```no_run
//! use jux_core::{process_report, JuxConfig, StorageMode};
//! use jux_evidence::RawReport;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = JuxConfig::from_env()?;
//! let report = RawReport::parse(&std::fs::read_to_string("junit.xml")?)?;
//! let result = process_report(
//!     report,
//!     &config.metadata_injector(),
//!     &config.signer()?,
//!     StorageMode::Cache,
//!     &config,
//! )?;
//! println!("{} -> {:?}", result.hash, result.delivery_state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod orchestrator;
pub mod queue;
pub mod store;

pub use config::{
    ConfigError, JuxConfig, MetadataConfig, RetentionConfig, SigningConfig, StorageMode,
};
pub use orchestrator::{
    process_report, ProcessingError, ProcessingResult, PublishOutcome, StorageOrchestrator,
};
pub use queue::{DrainReport, OfflineQueue};
pub use store::{
    CleanupReport, DeliveryState, PutOutcome, ReportDetails, ReportListing, ReportStore,
    RetentionPolicy, StorageError, StorageResult, StoreStats, StoredRecord,
};
