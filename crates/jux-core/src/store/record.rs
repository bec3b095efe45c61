//! Per-report bookkeeping persisted next to each artifact.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use jux_evidence::{ContentHash, ReportSummary};
use serde::{Deserialize, Serialize};

/// Delivery state of a stored report.
///
/// Transitions only move forward:
/// `not_queued -> pending | delivered | failed_permanent`,
/// `pending -> delivered | failed_permanent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    NotQueued,
    Pending,
    Delivered,
    FailedPermanent,
}

impl DeliveryState {
    pub const ALL: [DeliveryState; 4] = [
        Self::NotQueued,
        Self::Pending,
        Self::Delivered,
        Self::FailedPermanent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotQueued => "not_queued",
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::FailedPermanent)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Re-applying the current state is allowed and is a no-op.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::NotQueued => true,
            Self::Pending => next.is_terminal(),
            Self::Delivered | Self::FailedPermanent => false,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record file contents (`records/<hex>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub hash: ContentHash,
    /// Artifact size in bytes.
    pub size: u64,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_state: DeliveryState,
    /// Publish attempts made so far (runs, not HTTP requests).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Server-assigned run id once delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Injected report properties (`namespace:key -> value`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReportSummary>,
}

impl StoredRecord {
    pub fn new(hash: ContentHash, size: u64, stored_at: DateTime<Utc>) -> Self {
        Self {
            hash,
            size,
            stored_at,
            delivery_state: DeliveryState::NotQueued,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            run_id: None,
            delivered_at: None,
            metadata: BTreeMap::new(),
            summary: None,
        }
    }

    /// Apply a state change if the transition rule allows it.
    ///
    /// Returns whether the state actually changed.
    pub(crate) fn transition(&mut self, next: DeliveryState) -> bool {
        if self.delivery_state == next || !self.delivery_state.can_transition_to(next) {
            return false;
        }
        self.delivery_state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        use DeliveryState::*;

        assert!(NotQueued.can_transition_to(Pending));
        assert!(NotQueued.can_transition_to(Delivered));
        assert!(NotQueued.can_transition_to(FailedPermanent));
        assert!(Pending.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(FailedPermanent));

        assert!(!Pending.can_transition_to(NotQueued));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(FailedPermanent));
        assert!(!FailedPermanent.can_transition_to(Delivered));
        assert!(!FailedPermanent.can_transition_to(NotQueued));

        for state in DeliveryState::ALL {
            assert!(state.can_transition_to(state), "{state} re-apply");
        }
    }

    #[test]
    fn test_transition_reports_change() {
        let hash = ContentHash::from_bytes([7; 32]);
        let mut record = StoredRecord::new(hash, 10, Utc::now());

        assert!(record.transition(DeliveryState::Pending));
        assert!(!record.transition(DeliveryState::Pending));
        assert!(record.transition(DeliveryState::Delivered));
        assert!(!record.transition(DeliveryState::Pending));
        assert_eq!(record.delivery_state, DeliveryState::Delivered);
    }

    #[test]
    fn test_record_json_shape() {
        let hash = ContentHash::from_bytes([1; 32]);
        let record = StoredRecord::new(hash, 42, Utc::now());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["delivery_state"], "not_queued");
        assert_eq!(json["hash"], hash.to_string());
        assert!(json.get("last_error").is_none());

        let back: StoredRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
