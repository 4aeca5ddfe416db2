//! Window evaluation: judge the just-completed bucket against the baseline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::breaker::FailOpenBreaker;
use crate::detect::{Decision, Severity, TripEvent};
use crate::store::{RateSample, StoreError};
use crate::window::BucketId;

/// Attempt counts of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub success: u64,
    pub failure: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    pub fn rate_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.success as f64 / total as f64 * 100.0
    }
}

/// What one evaluation did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Evaluation {
    /// Too few attempts to say anything. Nothing was read or written beyond the counters.
    Skipped {
        bucket: BucketId,
        counts: WindowCounts,
        min_attempts: u64,
    },
    /// Normal window (or not enough baseline yet). The rate joined the baseline
    /// unless an earlier evaluation of the same bucket already added it.
    Recorded {
        bucket: BucketId,
        counts: WindowCounts,
        rate_percent: f64,
        decision: Decision,
        appended: bool,
    },
    /// Anomalous window. The hook fired and the baseline was left untouched.
    Tripped {
        bucket: BucketId,
        counts: WindowCounts,
        rate_percent: f64,
        decision: Decision,
    },
}

impl Evaluation {
    pub fn bucket(&self) -> BucketId {
        match self {
            Evaluation::Skipped { bucket, .. }
            | Evaluation::Recorded { bucket, .. }
            | Evaluation::Tripped { bucket, .. } => *bucket,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Evaluation::Skipped { .. } => None,
            Evaluation::Recorded { decision, .. } | Evaluation::Tripped { decision, .. } => {
                Some(decision)
            }
        }
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self, Evaluation::Tripped { .. })
    }
}

impl FailOpenBreaker {
    pub fn evaluate_previous_window(&self) -> Result<Evaluation, StoreError> {
        self.evaluate_previous_window_at(self.now())
    }

    /// Evaluate the bucket preceding the one containing `now`.
    ///
    /// Reads counters without touching them, and excludes the evaluated bucket's
    /// own sample from the baseline, so repeated runs reach the same decision
    /// and append at most once.
    pub fn evaluate_previous_window_at(&self, now: DateTime<Utc>) -> Result<Evaluation, StoreError> {
        let bucket = self.buckets.previous_bucket_id(now);
        let counts = self.window_counts(&bucket)?;
        let total = counts.total();
        let min_attempts = self.config.evaluation.min_attempts;

        if total < min_attempts {
            debug!(
                bucket = %bucket,
                success = counts.success,
                failure = counts.failure,
                total,
                min_attempts,
                "window below minimum volume, not evaluated"
            );
            return Ok(Evaluation::Skipped {
                bucket,
                counts,
                min_attempts,
            });
        }

        let rate_percent = counts.rate_percent();
        info!(
            bucket = %bucket,
            success = counts.success,
            failure = counts.failure,
            total,
            rate = rate_percent,
            "evaluating verification window"
        );

        let history_key = self.keys.history();
        let bucket_label = bucket.to_string();
        let baseline: Vec<f64> = self
            .history
            .range(&history_key)?
            .into_iter()
            .filter(|s| s.bucket_id != bucket_label)
            .map(|s| s.rate_percent)
            .collect();

        let decision = self.detector.decide(rate_percent, &baseline);

        if decision.anomalous {
            let z_score = decision.stats.map_or(0.0, |s| s.z_score);
            warn!(bucket = %bucket, z_score, "verification rate anomaly: {}", decision.reason);
            self.hook.trigger(&TripEvent {
                namespace: self.keys.namespace().to_string(),
                bucket_id: bucket_label,
                reason: decision.reason.clone(),
                rate_percent,
                z_score,
                severity: decision.severity.unwrap_or(Severity::Info),
                tripped_at: now,
            });
            return Ok(Evaluation::Tripped {
                bucket,
                counts,
                rate_percent,
                decision,
            });
        }

        if decision.stats.is_none() {
            info!(bucket = %bucket, baseline_len = baseline.len(), "{}", decision.reason);
        }

        let sample = RateSample {
            bucket_id: bucket_label,
            rate_percent,
            recorded_at: now,
        };
        let appended = self
            .history
            .push_capped(&history_key, &sample, self.config.max_entries())?;
        if !appended {
            debug!(bucket = %bucket, "rate already recorded for window");
        }

        Ok(Evaluation::Recorded {
            bucket,
            counts,
            rate_percent,
            decision,
            appended,
        })
    }
}
