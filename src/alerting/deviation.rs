//! Deviation arithmetic and severity tiers

use crate::config::defaults::DEVIATION_EPSILON;
use crate::types::AlertSeverity;

/// Signed deviation of `actual` from `predicted`, in percent.
///
/// - both near zero: 0
/// - predicted usable as denominator: `(actual - predicted) / predicted * 100`
/// - predicted near zero, actual not: `(actual - predicted) / actual * 100`
///
/// `None` when either input is not finite or no safe denominator exists.
pub fn compute_deviation_percent(actual: f64, predicted: f64) -> Option<f64> {
    if !actual.is_finite() || !predicted.is_finite() {
        return None;
    }
    let actual_zero = actual.abs() < DEVIATION_EPSILON;
    let predicted_zero = predicted.abs() < DEVIATION_EPSILON;
    if actual_zero && predicted_zero {
        return Some(0.0);
    }

    let denominator = if predicted_zero { actual } else { predicted };
    if denominator.abs() < DEVIATION_EPSILON {
        return None;
    }
    let pct = (actual - predicted) / denominator * 100.0;
    pct.is_finite().then_some(pct)
}

/// HIGH at or above `high_percent`, MEDIUM otherwise. Takes the absolute
/// deviation.
pub fn classify_severity(abs_deviation_percent: f64, high_percent: f64) -> AlertSeverity {
    if abs_deviation_percent >= high_percent {
        AlertSeverity::High
    } else {
        AlertSeverity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicted_is_the_preferred_denominator() {
        assert_eq!(compute_deviation_percent(200.0, 100.0), Some(100.0));
        assert_eq!(compute_deviation_percent(80.0, 100.0), Some(-20.0));
    }

    #[test]
    fn near_zero_pairs_are_no_deviation() {
        assert_eq!(compute_deviation_percent(1e-7, 1e-7), Some(0.0));
        assert_eq!(compute_deviation_percent(0.0, -0.0), Some(0.0));
    }

    #[test]
    fn zero_prediction_falls_back_to_actual() {
        let pct = compute_deviation_percent(50.0, 1e-9).expect("deviation");
        assert!((pct - 100.0).abs() < 1e-6);
        let pct = compute_deviation_percent(-50.0, 0.0).expect("deviation");
        assert!((pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_inputs_yield_nothing() {
        assert_eq!(compute_deviation_percent(f64::NAN, 1.0), None);
        assert_eq!(compute_deviation_percent(1.0, f64::INFINITY), None);
    }

    #[test]
    fn severity_tiers() {
        assert_eq!(classify_severity(18.0, 20.0), AlertSeverity::Medium);
        assert_eq!(classify_severity(20.0, 20.0), AlertSeverity::High);
        assert_eq!(classify_severity(25.0, 20.0), AlertSeverity::High);
    }
}
