//! Shared stores backing the breaker: per-bucket counters and the rate history.
//!
//! Both stores are multi-writer and lock-free from the caller's point of view.
//! Every mutation is an increment or an append, so concurrent writers from
//! several processes never need to coordinate.

pub mod memory;
pub mod schema;
pub mod sqlite;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::window::BucketId;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached in time. Callers on the hot path swallow these.
    #[error("store unavailable: {0}")]
    Transport(String),
    /// The store answered, but with something unusable. Never swallowed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// Whether any attempt has been counted yet in a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// Neither counter exists: this caller is (one of) the first in the bucket.
    Fresh,
    /// At least one counter exists.
    Active,
}

/// Per-bucket success rate, one entry of the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub bucket_id: String,
    pub rate_percent: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a single tracked attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Key layout for one deployment. Distinct namespaces never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn counter(&self, bucket: &BucketId, outcome: Outcome) -> String {
        format!("{}:counter:{}:{}", self.namespace, bucket, outcome.as_str())
    }

    pub fn history(&self) -> String {
        format!("{}:history", self.namespace)
    }
}

/// Atomic counters with a bounded lifetime.
pub trait CounterStore: Send + Sync {
    /// Report `Fresh` only when both keys are absent (or expired).
    ///
    /// This is a read; two callers can both observe `Fresh` for the same bucket.
    fn window_state(&self, success_key: &str, failure_key: &str) -> Result<WindowState, StoreError>;

    /// Increment `key` by one and return the new value. The expiry is set to
    /// `now + ttl` only if the key has none, so repeated increments never extend it.
    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current value; missing or expired keys read as zero.
    fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Expiry currently attached to `key`, if the key exists.
    fn expires_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Physically drop expired counters; returns how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Append-only, capped sequence of rate samples, oldest first.
pub trait HistoryStore: Send + Sync {
    /// Append `sample` and trim the oldest entries down to `cap`.
    ///
    /// A sample whose bucket is already present is dropped; returns whether
    /// it was appended.
    fn push_capped(&self, key: &str, sample: &RateSample, cap: usize) -> Result<bool, StoreError>;

    fn range(&self, key: &str) -> Result<Vec<RateSample>, StoreError>;

    fn len(&self, key: &str) -> Result<usize, StoreError>;

    /// Drop every sample under `key`; returns how many were removed.
    fn clear(&self, key: &str) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_keyspace_layout() {
        let keys = KeySpace::new("hcaptcha");
        let bucket = BucketId {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            index: 3,
        };
        assert_eq!(
            keys.counter(&bucket, Outcome::Success),
            "hcaptcha:counter:2024-05-01_3:success"
        );
        assert_eq!(
            keys.counter(&bucket, Outcome::Failure),
            "hcaptcha:counter:2024-05-01_3:failure"
        );
        assert_eq!(keys.history(), "hcaptcha:history");
        assert_ne!(KeySpace::new("a").history(), KeySpace::new("b").history());
    }

    #[test]
    fn test_error_classification() {
        assert!(StoreError::Transport("timeout".into()).is_transport());
        assert!(!StoreError::Backend("bad row".into()).is_transport());
    }
}
