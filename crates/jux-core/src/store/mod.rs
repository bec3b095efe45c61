//! Content-addressed local storage for signed reports.
//!
//! # Layout
//!
//! ```text
//! <root>/reports/<hex>.xml    signed artifact bytes
//! <root>/records/<hex>.json   StoredRecord (delivery state, attempts, metadata)
//! <root>/locks/<hex>.lock     held while the report or its record changes
//! <root>/locks/<hex>.claim    held by the drain currently sending the report
//! ```
//!
//! # Design Principles
//!
//! 1. **Content-addressed**: the canonical-form hash is the only key
//! 2. **Immutability-safe**: artifacts are written with no-clobber renames;
//!    different bytes under an existing hash are refused
//! 3. **No partial files**: every write goes to a temp file in the target
//!    directory and is renamed into place
//! 4. **Monotonic delivery state**: puts, deletes and record updates run
//!    under the report's lock and re-read the record before changing it

pub mod error;
mod io;
pub mod record;
pub mod retention;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jux_evidence::{ContentHash, RawReport, ReportSummary};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use error::{StorageError, StorageResult};
pub use record::{DeliveryState, StoredRecord};
pub use retention::{CleanupReport, RetentionPolicy};

const REPORTS_DIR: &str = "reports";
const RECORDS_DIR: &str = "records";
const LOCKS_DIR: &str = "locks";
const REPORT_EXT: &str = "xml";
const RECORD_EXT: &str = "json";

/// Result of [`ReportStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    /// Newly written.
    Stored,
    /// Identical bytes were already stored; nothing changed.
    AlreadyPresent,
}

/// One line of [`ReportStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportListing {
    pub hash: ContentHash,
    pub size: u64,
    pub delivery_state: DeliveryState,
    pub stored_at: DateTime<Utc>,
}

/// Everything known about one stored report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDetails {
    pub record: StoredRecord,
    pub path: PathBuf,
    /// `None` if the stored bytes no longer parse.
    pub summary: Option<ReportSummary>,
}

impl ReportDetails {
    pub fn is_signed(&self) -> bool {
        self.summary.as_ref().is_some_and(|s| s.signed)
    }
}

/// Aggregate numbers for a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub count: usize,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub by_state: BTreeMap<DeliveryState, usize>,
}

/// Exclusive advisory lock on one report, released on drop.
#[derive(Debug)]
pub(crate) struct ReportLock {
    _file: std::fs::File,
}

/// Filesystem report store rooted at one directory.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let store = Self { root: root.into() };
        io::create_dir_private(&store.reports_dir())?;
        io::create_dir_private(&store.records_dir())?;
        io::create_dir_private(&store.locks_dir())?;
        Ok(store)
    }

    /// Open the store at [`ReportStore::default_root`].
    pub fn open_default() -> StorageResult<Self> {
        Self::open(Self::default_root()?)
    }

    /// Platform data directory: `~/.local/share/jux`,
    /// `~/Library/Application Support/jux` or `%LOCALAPPDATA%\jux`.
    pub fn default_root() -> StorageResult<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
            .ok_or_else(|| StorageError::NoDefaultRoot {
                message: "could not determine data directory".to_string(),
            })?;
        Ok(base.join("jux"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    fn lock_path(&self, hash: &ContentHash, kind: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.{kind}", hash.to_hex()))
    }

    /// Serialize changes to one report across threads and processes.
    fn lock(&self, hash: &ContentHash) -> StorageResult<ReportLock> {
        let file = io::lock_exclusive(&self.lock_path(hash, "lock"))?;
        Ok(ReportLock { _file: file })
    }

    /// Claim the right to send one report. `None` while another drain
    /// holds the claim.
    pub(crate) fn try_claim_delivery(
        &self,
        hash: &ContentHash,
    ) -> StorageResult<Option<ReportLock>> {
        let file = io::try_lock_exclusive(&self.lock_path(hash, "claim"))?;
        Ok(file.map(|file| ReportLock { _file: file }))
    }

    /// Path of the artifact stored under `hash`.
    pub fn report_path(&self, hash: &ContentHash) -> PathBuf {
        self.reports_dir()
            .join(format!("{}.{REPORT_EXT}", hash.to_hex()))
    }

    fn record_path(&self, hash: &ContentHash) -> PathBuf {
        self.records_dir()
            .join(format!("{}.{RECORD_EXT}", hash.to_hex()))
    }

    /// Store signed bytes under their hash.
    pub fn put(&self, hash: &ContentHash, bytes: &[u8]) -> StorageResult<PutOutcome> {
        self.put_at(hash, bytes, Utc::now())
    }

    /// [`ReportStore::put`] with an explicit timestamp for the new record.
    pub fn put_at(
        &self,
        hash: &ContentHash,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> StorageResult<PutOutcome> {
        let path = self.report_path(hash);
        let _lock = self.lock(hash)?;

        let outcome = if io::write_new(&path, bytes)? {
            debug!(hash = %hash, size = bytes.len(), "stored report");
            PutOutcome::Stored
        } else {
            let existing = io::read_optional(&path)?.unwrap_or_default();
            if existing != bytes {
                warn!(hash = %hash, "refusing to overwrite stored report with different bytes");
                return Err(StorageError::HashCollision { hash: *hash });
            }
            debug!(hash = %hash, "report already stored");
            PutOutcome::AlreadyPresent
        };

        // First writer wins; an existing record keeps its delivery state.
        let record = new_record(hash, bytes, now);
        let json = encode_record(&record, &self.record_path(hash))?;
        io::write_new(&self.record_path(hash), &json)?;

        Ok(outcome)
    }

    /// Read the artifact stored under `hash`.
    pub fn get(&self, hash: &ContentHash) -> StorageResult<Vec<u8>> {
        io::read_optional(&self.report_path(hash))?
            .ok_or(StorageError::NotFound { hash: *hash })
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.report_path(hash).is_file()
    }

    /// Read the record for `hash`.
    ///
    /// An artifact without a record (crash between the two writes) reads
    /// as `not_queued`, stamped with the artifact's modification time.
    pub fn record(&self, hash: &ContentHash) -> StorageResult<StoredRecord> {
        let record_path = self.record_path(hash);
        if let Some(json) = io::read_optional(&record_path)? {
            return serde_json::from_slice(&json).map_err(|e| StorageError::CorruptRecord {
                path: record_path,
                message: e.to_string(),
            });
        }

        let report_path = self.report_path(hash);
        let meta = match std::fs::metadata(&report_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound { hash: *hash })
            }
            Err(e) => return Err(StorageError::io(&report_path, e)),
        };
        let stored_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredRecord::new(*hash, meta.len(), stored_at))
    }

    /// All stored hashes, in no particular order. Temp files and foreign
    /// files are ignored.
    fn hashes(&self) -> StorageResult<Vec<ContentHash>> {
        let dir = self.reports_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };

        let mut hashes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(stem) = name
                .to_str()
                .and_then(|n| n.strip_suffix(&format!(".{REPORT_EXT}")))
            else {
                continue;
            };
            if let Ok(hash) = ContentHash::from_hex(stem) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// All records, oldest first.
    pub fn records(&self) -> StorageResult<Vec<StoredRecord>> {
        let mut records = Vec::new();
        for hash in self.hashes()? {
            match self.record(&hash) {
                Ok(record) => records.push(record),
                // Removed by a concurrent cleanup.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then(a.hash.cmp(&b.hash)));
        Ok(records)
    }

    /// List stored reports, oldest first.
    pub fn list(&self) -> StorageResult<Vec<ReportListing>> {
        Ok(self
            .records()?
            .into_iter()
            .map(|r| ReportListing {
                hash: r.hash,
                size: r.size,
                delivery_state: r.delivery_state,
                stored_at: r.stored_at,
            })
            .collect())
    }

    /// Record, path and summary of one report.
    pub fn show(&self, hash: &ContentHash) -> StorageResult<ReportDetails> {
        let record = self.record(hash)?;
        let bytes = self.get(hash)?;
        Ok(ReportDetails {
            summary: jux_evidence::inspect(&bytes).ok(),
            path: self.report_path(hash),
            record,
        })
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        let mut stats = StoreStats::default();
        for record in self.records()? {
            stats.count += 1;
            stats.total_size += record.size;
            let at = record.stored_at;
            stats.oldest = Some(stats.oldest.map_or(at, |t| t.min(at)));
            stats.newest = Some(stats.newest.map_or(at, |t| t.max(at)));
            *stats.by_state.entry(record.delivery_state).or_default() += 1;
        }
        Ok(stats)
    }

    /// Remove every report matching `predicate`, oldest first.
    ///
    /// `pending` reports are never removed, whatever the predicate says.
    pub fn remove_if<F>(&self, mut predicate: F) -> StorageResult<Vec<StoredRecord>>
    where
        F: FnMut(&StoredRecord) -> bool,
    {
        let mut removed = Vec::new();
        for record in self.records()? {
            if record.delivery_state == DeliveryState::Pending || !predicate(&record) {
                continue;
            }
            match self.delete(&record.hash) {
                Ok(record) => removed.push(record),
                // Became pending or vanished since listing.
                Err(StorageError::Pending { .. }) | Err(StorageError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Delete one report. Refuses while it is `pending`.
    pub fn delete(&self, hash: &ContentHash) -> StorageResult<StoredRecord> {
        let _lock = self.lock(hash)?;
        let record = self.record(hash)?;
        if record.delivery_state == DeliveryState::Pending {
            return Err(StorageError::Pending { hash: *hash });
        }
        // Record first: a crash in between leaves an artifact that reads as
        // not_queued rather than a record without an artifact.
        io::remove_file(&self.record_path(hash))?;
        io::remove_file(&self.report_path(hash))?;
        debug!(hash = %hash, state = %record.delivery_state, "removed report");
        Ok(record)
    }

    /// Under the report's lock, re-read the record for `hash`, let `f`
    /// modify it and persist it if `f` reports a change.
    pub(crate) fn update_record<F>(&self, hash: &ContentHash, f: F) -> StorageResult<StoredRecord>
    where
        F: FnOnce(&mut StoredRecord) -> bool,
    {
        let _lock = self.lock(hash)?;
        let mut record = self.record(hash)?;
        if f(&mut record) {
            let path = self.record_path(hash);
            let json = encode_record(&record, &path)?;
            io::write_replace(&path, &json)?;
        }
        Ok(record)
    }
}

fn new_record(hash: &ContentHash, bytes: &[u8], now: DateTime<Utc>) -> StoredRecord {
    let mut record = StoredRecord::new(*hash, bytes.len() as u64, now);
    // Best effort: the store accepts any bytes, the record just knows less.
    if let Ok(report) = RawReport::from_bytes(bytes) {
        record.metadata = report.properties().into_iter().collect();
        record.summary = report.summary().ok();
    }
    record
}

fn encode_record(record: &StoredRecord, path: &Path) -> StorageResult<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|e| StorageError::CorruptRecord {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
