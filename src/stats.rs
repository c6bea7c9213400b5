//! Pure statistics kernel shared by every detector. No state, no I/O.

/// Arithmetic mean. Returns 0.0 for an empty slice (callers are expected to
/// guard on length before relying on the result).
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation (divide by N, not N-1). See DESIGN.md for
/// why the population form was chosen over the sample form.
pub fn sample_std_dev(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let m = mean(xs);
    let variance = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    variance.sqrt()
}

/// `(x - mean) / stddev`. Absent (`None`) when `stddev == 0` — a z-score is
/// undefined, not zero, when there is no spread to measure against.
pub fn z_score(x: f64, mean: f64, std_dev: f64) -> Option<f64> {
    if std_dev == 0.0 {
        None
    } else {
        Some((x - mean) / std_dev)
    }
}

/// Percentage change from `a` to `b`. `a == 0.0` maps a nonzero `b` to signed
/// infinity; `a == 0.0 && b == 0.0` is defined as 0.0.
pub fn pct_change(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        if b == 0.0 {
            0.0
        } else if b > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    } else {
        (b - a) / a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn mean_basic() {
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn std_dev_constant_series_is_zero() {
        assert_eq!(sample_std_dev(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn std_dev_population_matches_known_value() {
        // population stddev of [2,4,4,4,5,5,7,9] is 2.0
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((sample_std_dev(&xs) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn z_score_absent_when_no_spread() {
        assert_eq!(z_score(10.0, 10.0, 0.0), None);
    }

    #[test]
    fn z_score_basic() {
        assert!((z_score(13.0, 10.0, 1.5).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pct_change_basic() {
        assert!((pct_change(0.5, 0.8) - 0.6).abs() < 1e-9);
        assert!((pct_change(0.8, 0.55) - (-0.3125)).abs() < 1e-9);
    }

    #[test]
    fn pct_change_from_zero_is_signed_infinity() {
        assert_eq!(pct_change(0.0, 5.0), f64::INFINITY);
        assert_eq!(pct_change(0.0, -5.0), f64::NEG_INFINITY);
        assert_eq!(pct_change(0.0, 0.0), 0.0);
    }
}
