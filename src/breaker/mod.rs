//! The fail-open breaker: per-attempt tracking and window evaluation.
//!
//! There is no background scheduler. Whichever attempt first observes an
//! empty current bucket evaluates the previous one before it is counted.
//! Several replicas may do so for the same bucket; evaluation is idempotent.

pub mod evaluator;

pub use self::evaluator::{Evaluation, WindowCounts};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, ConfigError};
use crate::detect::{AnomalyDetector, FailOpenHook, LogHook, TimeSeries};
use crate::store::{CounterStore, HistoryStore, KeySpace, Outcome, RateSample, StoreError, WindowState};
use crate::window::{BucketClock, BucketId, Clock, SystemClock};

pub struct FailOpenBreaker {
    config: BreakerConfig,
    keys: KeySpace,
    buckets: BucketClock,
    detector: AnomalyDetector,
    counters: Arc<dyn CounterStore>,
    history: Arc<dyn HistoryStore>,
    hook: Arc<dyn FailOpenHook>,
    clock: Arc<dyn Clock>,
}

impl FailOpenBreaker {
    /// Build a breaker over the given stores. The config is validated here.
    pub fn new(
        config: BreakerConfig,
        counters: Arc<dyn CounterStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            keys: KeySpace::new(config.store.namespace.clone()),
            buckets: BucketClock::new(config.window.bucket_hours),
            detector: AnomalyDetector::new(
                config.evaluation.z_threshold,
                config.evaluation.min_baseline,
            ),
            config,
            counters,
            history,
            hook: Arc::new(LogHook),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn FailOpenHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn buckets(&self) -> &BucketClock {
        &self.buckets
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record one verification attempt at the current time.
    ///
    /// Store outages are logged and swallowed so the verification path is
    /// never affected. Any other store error is returned.
    pub fn track(&self, success: bool) -> Result<(), StoreError> {
        self.track_at(success, self.clock.now())
    }

    pub fn track_at(&self, success: bool, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.track_observed(success, now).map(|_| ())
    }

    /// Like [`track_at`](Self::track_at), but hands back the evaluation this
    /// attempt ran when it was the first one seen in a new window.
    pub fn track_observed(
        &self,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Evaluation>, StoreError> {
        match self.record(Outcome::from_success(success), now) {
            Err(e) if e.is_transport() => {
                warn!(namespace = %self.keys.namespace(), error = %e, "verification tracking skipped");
                Ok(None)
            }
            other => other,
        }
    }

    fn record(&self, outcome: Outcome, now: DateTime<Utc>) -> Result<Option<Evaluation>, StoreError> {
        let bucket = self.buckets.bucket_id(now);
        let success_key = self.keys.counter(&bucket, Outcome::Success);
        let failure_key = self.keys.counter(&bucket, Outcome::Failure);

        let mut evaluation = None;
        if self.counters.window_state(&success_key, &failure_key)? == WindowState::Fresh {
            debug!(bucket = %bucket, "new window observed");
            // A failed evaluation must not cost us the attempt itself.
            match self.on_new_window(now) {
                Ok(eval) => evaluation = Some(eval),
                Err(e) if e.is_transport() => {
                    warn!(bucket = %bucket, error = %e, "window evaluation skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let key = match outcome {
            Outcome::Success => success_key,
            Outcome::Failure => failure_key,
        };
        self.counters.incr_with_expiry(&key, self.config.counter_ttl())?;
        Ok(evaluation)
    }

    fn on_new_window(&self, now: DateTime<Utc>) -> Result<Evaluation, StoreError> {
        let evaluation = self.evaluate_previous_window_at(now)?;
        let purged = self.counters.purge_expired()?;
        if purged > 0 {
            debug!(purged, "expired counters purged");
        }
        Ok(evaluation)
    }

    /// Baseline samples, oldest first.
    pub fn history(&self) -> Result<Vec<RateSample>, StoreError> {
        self.history.range(&self.keys.history())
    }

    /// Forget the baseline. The breaker relearns from scratch.
    pub fn reset_history(&self) -> Result<usize, StoreError> {
        let removed = self.history.clear(&self.keys.history())?;
        warn!(namespace = %self.keys.namespace(), removed, "rate history cleared");
        Ok(removed)
    }

    pub fn status(&self) -> Result<BreakerStatus, StoreError> {
        self.status_at(self.clock.now())
    }

    /// Read-only snapshot of counters and baseline.
    pub fn status_at(&self, now: DateTime<Utc>) -> Result<BreakerStatus, StoreError> {
        let current = self.buckets.bucket_id(now);
        let previous = self.buckets.previous_bucket_id(now);
        let rates: Vec<f64> = self.history()?.iter().map(|s| s.rate_percent).collect();
        let baseline = TimeSeries::new(&rates);

        Ok(BreakerStatus {
            namespace: self.keys.namespace().to_string(),
            at: now,
            current: BucketStatus::new(current, self.window_counts(&current)?),
            previous: BucketStatus::new(previous, self.window_counts(&previous)?),
            history_len: baseline.len(),
            history_cap: self.config.max_entries(),
            baseline_mean: baseline.mean(),
            baseline_std_dev: baseline.std_dev(),
            min_attempts: self.config.evaluation.min_attempts,
            min_baseline: self.config.evaluation.min_baseline,
            z_threshold: self.config.evaluation.z_threshold,
        })
    }

    pub(crate) fn window_counts(&self, bucket: &BucketId) -> Result<WindowCounts, StoreError> {
        Ok(WindowCounts {
            success: self.counters.get(&self.keys.counter(bucket, Outcome::Success))?,
            failure: self.counters.get(&self.keys.counter(bucket, Outcome::Failure))?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub bucket: BucketId,
    pub success: u64,
    pub failure: u64,
    pub total: u64,
    pub rate_percent: Option<f64>,
}

impl BucketStatus {
    fn new(bucket: BucketId, counts: WindowCounts) -> Self {
        Self {
            bucket,
            success: counts.success,
            failure: counts.failure,
            total: counts.total(),
            rate_percent: (counts.total() > 0).then(|| counts.rate_percent()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub namespace: String,
    pub at: DateTime<Utc>,
    pub current: BucketStatus,
    pub previous: BucketStatus,
    pub history_len: usize,
    pub history_cap: usize,
    pub baseline_mean: f64,
    pub baseline_std_dev: f64,
    pub min_attempts: u64,
    pub min_baseline: usize,
    pub z_threshold: f64,
}
