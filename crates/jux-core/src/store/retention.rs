//! Age and size based cleanup.

use chrono::{DateTime, Duration, Utc};
use jux_evidence::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::StorageResult;
use super::record::{DeliveryState, StoredRecord};
use super::ReportStore;

/// Limits applied by [`ReportStore::cleanup`]. `None` disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_total_size: Option<u64>,
}

impl RetentionPolicy {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_total_size(mut self, bytes: u64) -> Self {
        self.max_total_size = Some(bytes);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_total_size.is_none()
    }
}

/// What a cleanup removed (or would remove, for a dry run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<ContentHash>,
    pub freed_bytes: u64,
    /// Reports left in the store.
    pub kept: usize,
    /// Reports protected from eviction (`pending` or `failed_permanent`).
    pub skipped: usize,
    pub dry_run: bool,
}

fn is_evictable(record: &StoredRecord) -> bool {
    matches!(
        record.delivery_state,
        DeliveryState::NotQueued | DeliveryState::Delivered
    )
}

impl ReportStore {
    /// Evict reports older than `max_age`, then the oldest reports until the
    /// store fits in `max_total_size`.
    ///
    /// `pending` and `failed_permanent` reports are never evicted; they still
    /// count towards the size limit.
    pub fn cleanup(
        &self,
        policy: &RetentionPolicy,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<CleanupReport> {
        let records = self.records()?;
        let mut report = CleanupReport {
            dry_run,
            ..CleanupReport::default()
        };

        let mut total: u64 = records.iter().map(|r| r.size).sum();
        let cutoff = policy.max_age.and_then(|age| now.checked_sub_signed(age));

        let mut victims = Vec::new();
        for record in &records {
            if !is_evictable(record) {
                report.skipped += 1;
                continue;
            }
            let expired = cutoff.is_some_and(|cutoff| record.stored_at < cutoff);
            let oversized = policy.max_total_size.is_some_and(|max| total > max);
            if expired || oversized {
                total = total.saturating_sub(record.size);
                victims.push(record.hash);
            }
        }

        for hash in victims {
            if dry_run {
                if let Some(record) = records.iter().find(|r| r.hash == hash) {
                    report.freed_bytes += record.size;
                    report.removed.push(hash);
                }
                continue;
            }
            // Re-checked under delete: a report queued since listing is kept.
            match self.delete(&hash) {
                Ok(record) => {
                    report.freed_bytes += record.size;
                    report.removed.push(hash);
                }
                Err(e) if e.is_not_found() => {}
                Err(super::StorageError::Pending { .. }) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        report.kept = records.len() - report.removed.len();
        info!(
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            kept = report.kept,
            dry_run,
            "store cleanup finished"
        );
        Ok(report)
    }
}
