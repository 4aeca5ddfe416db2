//! Offline replay of synthetic traffic through an in-memory breaker.
//!
//! Useful for tuning thresholds: pick a normal success rate, inject an outage
//! day, and see which windows trip.

use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::breaker::{Evaluation, FailOpenBreaker};
use crate::config::BreakerConfig;
use crate::detect::RecordingHook;
use crate::store::MemoryStore;
use crate::window::ManualClock;

#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub days: u32,
    /// Normal success probability, in percent.
    pub success_rate: f64,
    pub attempts_per_bucket: u64,
    /// Zero-based day on which the provider degrades.
    pub outage_day: Option<u32>,
    /// Success probability during the outage, in percent.
    pub outage_rate: f64,
    pub seed: u64,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            days: 14,
            success_rate: 92.0,
            attempts_per_bucket: 500,
            outage_day: Some(12),
            outage_rate: 40.0,
            seed: 7,
        }
    }
}

/// One evaluated window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub bucket: String,
    pub outcome: &'static str,
    pub total: u64,
    pub rate_percent: Option<f64>,
    pub z_score: Option<f64>,
    pub reason: Option<String>,
}

impl From<&Evaluation> for WindowReport {
    fn from(eval: &Evaluation) -> Self {
        let (outcome, counts, rate) = match eval {
            Evaluation::Skipped { counts, .. } => ("skipped", counts, None),
            Evaluation::Recorded {
                counts,
                rate_percent,
                ..
            } => ("recorded", counts, Some(*rate_percent)),
            Evaluation::Tripped {
                counts,
                rate_percent,
                ..
            } => ("tripped", counts, Some(*rate_percent)),
        };
        let decision = eval.decision();
        Self {
            bucket: eval.bucket().to_string(),
            outcome,
            total: counts.total(),
            rate_percent: rate,
            z_score: decision.and_then(|d| d.stats).map(|s| s.z_score),
            reason: decision.map(|d| d.reason.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub windows: Vec<WindowReport>,
    pub trips: usize,
    pub history_len: usize,
}

/// Simulated time starts here.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

pub fn run(plan: &SimulationPlan, config: BreakerConfig) -> Result<SimulationReport> {
    for (name, rate) in [("success_rate", plan.success_rate), ("outage_rate", plan.outage_rate)] {
        ensure!(
            rate.is_finite() && (0.0..=100.0).contains(&rate),
            "{name} must be a percentage in 0..=100, got {rate}"
        );
    }
    let per_bucket = i32::try_from(plan.attempts_per_bucket.max(1))
        .map_err(|_| anyhow!("attempts_per_bucket {} is too large", plan.attempts_per_bucket))?;

    let start = epoch();
    let clock = ManualClock::new(start);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let hook = Arc::new(RecordingHook::new());
    let breaker = FailOpenBreaker::new(config, store.clone(), store)?
        .with_hook(hook.clone())
        .with_clock(Arc::new(clock.clone()));

    let mut rng = StdRng::seed_from_u64(plan.seed);
    let bucket_len = breaker.buckets().bucket_duration();
    let buckets = u64::from(plan.days) * u64::from(breaker.buckets().buckets_per_day());
    let step = bucket_len / per_bucket;
    let mut windows = Vec::new();

    for b in 0..buckets {
        let bucket_start = start + bucket_len * b as i32;
        let day = (b / u64::from(breaker.buckets().buckets_per_day())) as u32;
        let rate = if plan.outage_day == Some(day) {
            plan.outage_rate
        } else {
            plan.success_rate
        };
        let p = rate / 100.0;

        for i in 0..plan.attempts_per_bucket {
            let now = bucket_start + step * i as i32;
            clock.set(now);
            if let Some(eval) = breaker.track_observed(rng.gen_bool(p), now)? {
                windows.push(WindowReport::from(&eval));
            }
        }
    }

    // Close out the final bucket.
    let end = start + bucket_len * buckets as i32;
    clock.set(end);
    windows.push(WindowReport::from(&breaker.evaluate_previous_window_at(end)?));

    Ok(SimulationReport {
        windows,
        trips: hook.events().len(),
        history_len: breaker.history()?.len(),
    })
}
