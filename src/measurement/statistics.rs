//! Statistical summaries over a batch of readings.
//!
//! Summaries are recomputed from the full reading set every time, never
//! updated incrementally. Variance uses the two-pass corrected algorithm:
//! the mean first, then the sum of squared deviations with a compensation
//! term for the rounding error left in the mean. Readings at µV resolution
//! around a large offset lose every significant digit with the one-pass
//! `Σx² - (Σx)²/n` formula.

use serde::{Deserialize, Serialize};

/// Aggregate of valid readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalSummary {
    /// Readings included in the statistics.
    pub count: usize,
    /// Readings discarded as invalid (overflow or NaN).
    pub discarded: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (n - 1); zero for a single reading.
    pub standard_deviation: f64,
    /// `standard_deviation / |mean|`; infinite when the mean is zero.
    pub coefficient_of_variation: f64,
    /// Smallest reading.
    pub min: f64,
    /// Largest reading.
    pub max: f64,
    /// False when the loop was cancelled before all readings were taken.
    pub complete: bool,
}

impl StatisticalSummary {
    /// Summarize `readings`. Returns `None` for an empty slice.
    pub fn from_readings(readings: &[f64], discarded: usize, complete: bool) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let n = readings.len() as f64;
        let mean = readings.iter().sum::<f64>() / n;

        let standard_deviation = if readings.len() > 1 {
            let (sum_sq, sum) = readings.iter().fold((0.0, 0.0), |(sq, s), x| {
                let d = x - mean;
                (sq + d * d, s + d)
            });
            let variance = (sum_sq - sum * sum / n) / (n - 1.0);
            variance.max(0.0).sqrt()
        } else {
            0.0
        };

        let coefficient_of_variation = if mean == 0.0 {
            f64::INFINITY
        } else {
            standard_deviation / mean.abs()
        };

        let (min, max) = readings
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x), hi.max(x))
            });

        Some(Self {
            count: readings.len(),
            discarded,
            mean,
            standard_deviation,
            coefficient_of_variation,
            min,
            max,
            complete,
        })
    }

    /// Coefficient of variation as a percentage.
    pub fn cv_percent(&self) -> f64 {
        self.coefficient_of_variation * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_statistics() {
        let summary =
            StatisticalSummary::from_readings(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 0, true)
                .unwrap();
        assert_eq!(summary.count, 8);
        assert!((summary.mean - 5.0).abs() < 1e-12);
        // sample variance = 32 / 7
        assert!((summary.standard_deviation - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 9.0);
        assert!((summary.cv_percent() - summary.standard_deviation / 5.0 * 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_reading_has_zero_deviation() {
        let summary = StatisticalSummary::from_readings(&[1.5], 2, false).unwrap();
        assert_eq!(summary.standard_deviation, 0.0);
        assert_eq!(summary.discarded, 2);
        assert!(!summary.complete);
        assert!(StatisticalSummary::from_readings(&[], 0, true).is_none());
    }

    #[test]
    fn test_zero_mean_gives_infinite_cv() {
        let summary = StatisticalSummary::from_readings(&[-1.0, 1.0], 0, true).unwrap();
        assert!(summary.coefficient_of_variation.is_infinite());
    }

    #[test]
    fn test_no_cancellation_at_resolution_floor() {
        const FLOOR: f64 = 1e-9;
        const N: usize = 1_000_000;

        // half the readings sit one resolution step above 1.000000
        let readings: Vec<f64> = (0..N)
            .map(|i| if i % 2 == 0 { 1.0 } else { 1.0 + FLOOR })
            .collect();
        let summary = StatisticalSummary::from_readings(&readings, 0, true).unwrap();

        let n = N as f64;
        let expected = 0.5 * FLOOR * (n / (n - 1.0)).sqrt();
        assert!(
            (summary.standard_deviation - expected).abs() < FLOOR,
            "std {} vs expected {}",
            summary.standard_deviation,
            expected
        );

        let constant = vec![1.0 + FLOOR; N];
        let flat = StatisticalSummary::from_readings(&constant, 0, true).unwrap();
        assert!(flat.standard_deviation < FLOOR);
    }
}
