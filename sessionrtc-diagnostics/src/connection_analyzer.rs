//! Statistics over series of latency probes

use std::time::Duration;

/// Stability threshold: standard deviation as a fraction of the mean
pub const STABILITY_RATIO: f64 = 0.3;

/// Bandwidth inferred from a timed transfer is clamped to this range (Mbps)
pub const INFERRED_BANDWIDTH_RANGE_MBPS: (f64, f64) = (0.5, 100.0);

/// Outcomes of a run of latency probes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySeries {
    samples_ms: Vec<f64>,
    failures: usize,
}

impl LatencySeries {
    /// Empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe outcome
    pub fn record(&mut self, outcome: Option<Duration>) {
        match outcome {
            Some(rtt) => self.samples_ms.push(rtt.as_nanos() as f64 / 1_000_000.0),
            None => self.failures += 1,
        }
    }

    /// Successful samples in milliseconds
    pub fn samples_ms(&self) -> &[f64] {
        &self.samples_ms
    }

    /// Number of failed probes
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Total probes recorded
    pub fn total(&self) -> usize {
        self.samples_ms.len() + self.failures
    }

    /// Every recorded probe failed
    pub fn all_failed(&self) -> bool {
        self.total() > 0 && self.samples_ms.is_empty()
    }

    /// Median of successful samples
    pub fn median_ms(&self) -> Option<f64> {
        median(self.samples_ms.clone())
    }

    /// Median with every failed probe counted at `fallback_ms`
    pub fn median_with_fallback(&self, fallback_ms: f64) -> f64 {
        let mut padded = self.samples_ms.clone();
        padded.extend(std::iter::repeat(fallback_ms).take(self.failures));
        median(padded).unwrap_or(fallback_ms)
    }

    /// Arithmetic mean of successful samples
    pub fn mean_ms(&self) -> Option<f64> {
        if self.samples_ms.is_empty() {
            return None;
        }
        Some(self.samples_ms.iter().sum::<f64>() / self.samples_ms.len() as f64)
    }

    /// Population standard deviation of successful samples
    pub fn std_dev_ms(&self) -> Option<f64> {
        let mean = self.mean_ms()?;
        let variance = self
            .samples_ms
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f64>()
            / self.samples_ms.len() as f64;
        Some(variance.sqrt())
    }

    /// Stable iff no probe failed, at least two samples exist, and the
    /// standard deviation is below [`STABILITY_RATIO`] of the mean
    pub fn is_stable(&self) -> bool {
        if self.failures > 0 || self.samples_ms.len() < 2 {
            return false;
        }
        match (self.mean_ms(), self.std_dev_ms()) {
            (Some(mean), Some(std_dev)) if mean > 0.0 => std_dev < STABILITY_RATIO * mean,
            // Identical zero-latency samples have no spread at all
            (Some(_), Some(std_dev)) => std_dev == 0.0,
            _ => false,
        }
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Percentage of failed probes across several series
pub fn loss_percent(series: &[&LatencySeries]) -> f64 {
    let total: usize = series.iter().map(|s| s.total()).sum();
    if total == 0 {
        return 0.0;
    }
    let failed: usize = series.iter().map(|s| s.failures()).sum();
    failed as f64 * 100.0 / total as f64
}

/// Bandwidth in Mbps inferred from moving `bytes` in `elapsed`
pub fn inferred_bandwidth_mbps(bytes: usize, elapsed: Duration) -> f64 {
    let (floor, ceiling) = INFERRED_BANDWIDTH_RANGE_MBPS;
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 {
        return ceiling;
    }
    let mbps = (bytes as f64 * 8.0) / seconds / 1_000_000.0;
    mbps.clamp(floor, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(samples: &[u64], failures: usize) -> LatencySeries {
        let mut series = LatencySeries::new();
        for &ms in samples {
            series.record(Some(Duration::from_millis(ms)));
        }
        for _ in 0..failures {
            series.record(None);
        }
        series
    }

    #[test]
    fn test_median_of_three() {
        assert_eq!(series(&[120, 40, 80], 0).median_ms(), Some(80.0));
        assert_eq!(series(&[10, 20], 0).median_ms(), Some(15.0));
        assert_eq!(series(&[], 3).median_ms(), None);
    }

    #[test]
    fn test_median_with_fallback() {
        assert_eq!(series(&[50, 60], 1).median_with_fallback(1000.0), 60.0);
        assert_eq!(series(&[50], 2).median_with_fallback(1000.0), 1000.0);
        assert_eq!(series(&[], 0).median_with_fallback(1000.0), 1000.0);
    }

    #[test]
    fn test_stability_threshold() {
        assert!(series(&[100, 100, 100, 100, 100], 0).is_stable());
        assert!(series(&[90, 110, 100, 95, 105], 0).is_stable());
        assert!(!series(&[20, 200, 40, 300, 60], 0).is_stable());
        // Any failed probe makes the series unstable
        assert!(!series(&[100, 100, 100, 100], 1).is_stable());
    }

    #[test]
    fn test_loss_percent() {
        let latency = series(&[50, 50], 1);
        let stability = series(&[50, 50, 50, 50], 1);
        assert_eq!(loss_percent(&[&latency, &stability]), 25.0);
        assert_eq!(loss_percent(&[]), 0.0);
    }

    #[test]
    fn test_inferred_bandwidth_is_clamped() {
        // 64 KiB in 1 s is ~0.52 Mbps
        let mbps = inferred_bandwidth_mbps(64 * 1024, Duration::from_secs(1));
        assert!((mbps - 0.524).abs() < 0.01);
        assert_eq!(
            inferred_bandwidth_mbps(1024, Duration::from_secs(10)),
            0.5
        );
        assert_eq!(
            inferred_bandwidth_mbps(100_000_000, Duration::from_millis(1)),
            100.0
        );
        assert_eq!(inferred_bandwidth_mbps(1024, Duration::ZERO), 100.0);
    }
}
