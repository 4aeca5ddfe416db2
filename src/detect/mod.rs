//! Anomaly classification and fail-open trigger hooks.

pub mod anomaly;
pub mod hook;

pub use self::anomaly::{AnomalyDetector, TimeSeries};
pub use self::hook::{FailOpenHook, IncidentLog, LogHook, RecordingHook, TripEvent};

use serde::{Deserialize, Serialize};

/// How far below the baseline a tripped window fell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Self {
        match s {
            "Critical" => Severity::Critical,
            "Warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Figures behind a z-score classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZStats {
    pub current: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
}

/// Verdict for one window. Never persisted, only logged or acted upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub anomalous: bool,
    pub reason: String,
    /// Set only for anomalous decisions.
    pub severity: Option<Severity>,
    /// Absent when the baseline was too short to judge.
    pub stats: Option<ZStats>,
}

impl Decision {
    pub fn insufficient_data(have: usize, needed: usize) -> Self {
        Self {
            anomalous: false,
            reason: format!("insufficient data: {have} baseline samples, need {needed}"),
            severity: None,
            stats: None,
        }
    }
}
