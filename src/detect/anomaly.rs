use crate::detect::{Decision, Severity, ZStats};

/// A simple time series for statistical analysis.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Sample variance (Bessel's correction). Zero below two values.
    pub fn variance(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / (self.values.len() - 1) as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().max(0.0).sqrt()
    }

    /// Z = (value - mean) / std_dev, or 0.0 for a flat or degenerate baseline.
    pub fn z_score(&self, value: f64) -> f64 {
        let std = self.std_dev();
        if std == 0.0 {
            return 0.0;
        }
        (value - self.mean()) / std
    }
}

/// Stateless classifier for one completed window.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    z_threshold: f64,
    min_baseline: usize,
}

impl AnomalyDetector {
    pub fn new(z_threshold: f64, min_baseline: usize) -> Self {
        Self {
            z_threshold,
            min_baseline,
        }
    }

    pub fn z_threshold(&self) -> f64 {
        self.z_threshold
    }

    pub fn min_baseline(&self) -> usize {
        self.min_baseline
    }

    /// Classify `current` against `baseline`, refusing to judge a short baseline.
    pub fn decide(&self, current: f64, baseline: &[f64]) -> Decision {
        if baseline.len() < self.min_baseline {
            return Decision::insufficient_data(baseline.len(), self.min_baseline);
        }
        self.classify(current, baseline)
    }

    /// Z-score classification with no baseline floor. Only drops are anomalous.
    pub fn classify(&self, current: f64, baseline: &[f64]) -> Decision {
        let ts = TimeSeries::new(baseline);
        let stats = ZStats {
            current,
            mean: ts.mean(),
            std_dev: ts.std_dev(),
            z_score: ts.z_score(current),
        };
        let anomalous = stats.z_score <= self.z_threshold;
        let reason = format!(
            "success rate {:.2}% is {:.2} standard deviations from baseline mean {:.2}% (stddev {:.2}, threshold {:.2}, samples {})",
            stats.current,
            stats.z_score,
            stats.mean,
            stats.std_dev,
            self.z_threshold,
            ts.len()
        );
        Decision {
            anomalous,
            reason,
            severity: anomalous.then(|| severity_for(stats.z_score, self.z_threshold)),
            stats: Some(stats),
        }
    }
}

fn severity_for(z_score: f64, threshold: f64) -> Severity {
    if z_score <= threshold * 2.0 {
        Severity::Critical
    } else if z_score <= threshold * 1.5 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE: [f64; 10] = [90.0, 92.0, 91.0, 89.0, 93.0, 90.0, 91.0, 92.0, 90.0, 91.0];

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(-3.0, 10)
    }

    #[test]
    fn test_stats() {
        let ts = TimeSeries::new(&BASELINE);
        assert!((ts.mean() - 90.9).abs() < 1e-9);
        // Sum of squared deviations is 12.9 over 9 degrees of freedom.
        assert!((ts.variance() - 12.9 / 9.0).abs() < 1e-9);
        assert!((ts.std_dev() - 1.197).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_series() {
        assert_eq!(TimeSeries::new(&[]).mean(), 0.0);
        assert_eq!(TimeSeries::new(&[]).std_dev(), 0.0);
        assert_eq!(TimeSeries::new(&[42.0]).std_dev(), 0.0);
        assert_eq!(TimeSeries::new(&[42.0]).z_score(0.0), 0.0);
        assert_eq!(TimeSeries::new(&[5.0, 5.0, 5.0]).z_score(1.0), 0.0);
    }

    #[test]
    fn test_short_baseline_never_anomalous() {
        let d = AnomalyDetector::new(-3.0, 0);
        for baseline in [&[][..], &[95.0][..]] {
            for current in [0.0, 50.0, 100.0] {
                let decision = d.classify(current, baseline);
                assert!(!decision.anomalous);
                assert_eq!(decision.stats.unwrap().std_dev, 0.0);
            }
        }
    }

    #[test]
    fn test_mean_value_is_normal() {
        let ts = TimeSeries::new(&BASELINE);
        let decision = detector().decide(ts.mean(), &BASELINE);
        assert!(!decision.anomalous);
        assert!(decision.stats.unwrap().z_score.abs() < 1e-9);
    }

    #[test]
    fn test_collapse_is_anomalous() {
        let decision = detector().decide(50.0, &BASELINE);
        assert!(decision.anomalous);
        let stats = decision.stats.unwrap();
        assert!((stats.z_score + 34.2).abs() < 0.1, "z = {}", stats.z_score);
        assert_eq!(decision.severity, Some(Severity::Critical));
        assert!(decision.reason.contains("50.00%"));
        assert!(decision.reason.contains("90.90%"));
        assert!(decision.reason.contains("-34."));
    }

    #[test]
    fn test_small_dip_is_normal() {
        let decision = detector().decide(88.0, &BASELINE);
        assert!(!decision.anomalous);
        assert!(decision.stats.unwrap().z_score > -3.0);
        assert_eq!(decision.severity, None);
    }

    #[test]
    fn test_spike_is_not_flagged() {
        let decision = detector().decide(100.0, &BASELINE);
        assert!(decision.stats.unwrap().z_score > 3.0);
        assert!(!decision.anomalous);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let ts = TimeSeries::new(&BASELINE);
        let at_threshold = ts.mean() - 3.0 * ts.std_dev();
        assert!(detector().decide(at_threshold - 1e-9, &BASELINE).anomalous);
        let severity = detector().decide(at_threshold - 1e-9, &BASELINE).severity;
        assert_eq!(severity, Some(Severity::Info));
    }

    #[test]
    fn test_insufficient_baseline() {
        let decision = detector().decide(0.0, &BASELINE[..9]);
        assert!(!decision.anomalous);
        assert!(decision.stats.is_none());
        assert!(decision.reason.starts_with("insufficient data"));
    }
}
