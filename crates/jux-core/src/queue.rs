//! Offline delivery queue.
//!
//! The queue is a view over [`ReportStore`] records in the `pending` state.
//! Draining is explicit: nothing runs in the background.

use chrono::Utc;
use jux_client::{Clock, PublishError, PublisherClient, Transport};
use jux_evidence::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{DeliveryState, ReportListing, ReportStore, StorageResult, StoredRecord};

/// Outcome counters of one [`OfflineQueue::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: Vec<ContentHash>,
    pub still_pending: Vec<ContentHash>,
    pub failed_permanent: Vec<ContentHash>,
}

/// Pending reports in the local store.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    store: ReportStore,
}

impl OfflineQueue {
    pub fn new(store: ReportStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Mark a stored report as waiting for delivery.
    ///
    /// Terminal reports are left as they are.
    pub fn enqueue(&self, hash: &ContentHash) -> StorageResult<StoredRecord> {
        self.store
            .update_record(hash, |r| r.transition(DeliveryState::Pending))
    }

    pub fn mark_delivered(&self, hash: &ContentHash, run_id: &str) -> StorageResult<StoredRecord> {
        self.store.update_record(hash, |r| {
            if !r.transition(DeliveryState::Delivered) {
                return false;
            }
            r.run_id = Some(run_id.to_string());
            r.delivered_at = Some(Utc::now());
            r.last_error = None;
            true
        })
    }

    pub fn mark_failed_permanent(
        &self,
        hash: &ContentHash,
        reason: &str,
    ) -> StorageResult<StoredRecord> {
        self.store.update_record(hash, |r| {
            if !r.transition(DeliveryState::FailedPermanent) {
                return false;
            }
            r.last_error = Some(reason.to_string());
            true
        })
    }

    /// Count one publish attempt and remember its error.
    pub(crate) fn record_attempt(
        &self,
        hash: &ContentHash,
        error: Option<&PublishError>,
    ) -> StorageResult<StoredRecord> {
        self.store.update_record(hash, |r| {
            r.attempts = r.attempts.saturating_add(1);
            r.last_attempt_at = Some(Utc::now());
            if let Some(error) = error {
                r.last_error = Some(error.to_string());
            }
            true
        })
    }

    /// Pending reports, oldest first.
    pub fn pending(&self) -> StorageResult<Vec<ReportListing>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|l| l.delivery_state == DeliveryState::Pending)
            .collect())
    }

    /// Reports a drain with the same `max_items` would send.
    pub fn dry_run(&self, max_items: Option<usize>) -> StorageResult<Vec<ReportListing>> {
        let mut pending = self.pending()?;
        if let Some(max) = max_items {
            pending.truncate(max);
        }
        Ok(pending)
    }

    /// Publish pending reports, oldest first.
    ///
    /// Concurrent drains (threads or processes) share the work: each report
    /// is claimed by one drain while it is sent, so nothing is sent twice.
    ///
    /// Success marks the report `delivered`. A retryable failure (including
    /// exhausted retries) leaves it `pending` with the attempt recorded. A
    /// terminal failure marks it `failed_permanent`; such reports are kept
    /// but never retried.
    pub fn drain<T: Transport>(
        &self,
        publisher: &PublisherClient<T>,
        max_items: Option<usize>,
        clock: &dyn Clock,
    ) -> StorageResult<DrainReport> {
        let mut report = DrainReport::default();

        for item in self.dry_run(max_items)? {
            let hash = item.hash;
            let Some(_claim) = self.store.try_claim_delivery(&hash)? else {
                debug!(hash = %hash, "queued report is being sent by another drain");
                continue;
            };
            // Another drain may have finished this one already.
            match self.store.record(&hash) {
                Ok(record) if record.delivery_state == DeliveryState::Pending => {}
                Ok(_) => continue,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
            let bytes = self.store.get(&hash)?;

            report.attempted += 1;
            match publisher.submit(&bytes, clock) {
                Ok(result) => {
                    self.record_attempt(&hash, None)?;
                    self.mark_delivered(&hash, &result.run_id)?;
                    debug!(hash = %hash, run_id = %result.run_id, "queued report delivered");
                    report.delivered.push(hash);
                }
                Err(e) if e.is_retryable() => {
                    self.record_attempt(&hash, Some(&e))?;
                    warn!(hash = %hash, error = %e, "queued report still pending");
                    report.still_pending.push(hash);
                }
                Err(e) => {
                    self.record_attempt(&hash, Some(&e))?;
                    self.mark_failed_permanent(&hash, &e.to_string())?;
                    warn!(hash = %hash, error = %e, kind = e.kind(), "queued report rejected");
                    report.failed_permanent.push(hash);
                }
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered.len(),
            still_pending = report.still_pending.len(),
            failed_permanent = report.failed_permanent.len(),
            "queue drain finished"
        );
        Ok(report)
    }
}
