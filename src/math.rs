//! Floating-point GCD and the sensitivity transform.
//!
//! A client turns mouse counts into rotation in fixed increments, so the absolute
//! rotation deltas it reports are (up to float noise) integer multiples of one step. The
//! Euclidean GCD of two consecutive deltas therefore recovers that step, as long as the
//! descent is stopped before it starts chasing rounding error.

/// Smallest step size the GCD will descend to.
///
/// This is the step produced by the lowest in-game sensitivity granularity, minus a
/// margin for float noise.
pub const MINIMUM_DIVISOR: f64 = ((0.2 * 0.2 * 0.2) * 8.0) * 0.15 - 1e-3;

/// Euclidean GCD on non-negative magnitudes with a floor at [`MINIMUM_DIVISOR`].
///
/// Returns `0.0` when `a` is zero. Otherwise the larger input is used as the dividend and
/// remainders are taken until the divisor drops to the floor or below.
///
/// # Examples
///
/// ```
/// use aimwatch::math::gcd;
///
/// assert!((gcd(0.75, 0.5) - 0.25).abs() < 1e-9);
/// assert!((gcd(0.5, 0.75) - 0.25).abs() < 1e-9);
/// assert_eq!(gcd(0.0, 0.5), 0.0);
/// assert_eq!(gcd(0.5, 0.0), 0.5);
/// ```
#[must_use]
pub fn gcd(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return 0.0;
    }
    let (mut a, mut b) = if a < b { (b, a) } else { (a, b) };
    while b > MINIMUM_DIVISOR {
        let remainder = a - (a / b).floor() * b;
        a = b;
        b = remainder;
    }
    a
}

/// Maps an accepted rotation step back to the in-game sensitivity setting (0.0 to 1.0 for
/// the usual 0% to 100% slider range).
#[must_use]
pub fn convert_to_sensitivity(step: f64) -> f64 {
    ((step / 0.15 / 8.0).cbrt() - 0.2) / 0.6
}

/// Distance from `delta` to the nearest multiple of `step`, folded into `[0, step / 2]`.
///
/// Returns `0.0` while no step has been accepted (`step <= 0`).
///
/// # Examples
///
/// ```
/// use aimwatch::math::quantization_error;
///
/// assert!((quantization_error(1.1, 0.5) - 0.1).abs() < 1e-9);
/// assert!((quantization_error(-1.4, 0.5) - 0.1).abs() < 1e-9);
/// assert_eq!(quantization_error(3.0, 0.0), 0.0);
/// ```
#[must_use]
pub fn quantization_error(delta: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return 0.0;
    }
    let error = (delta % step).abs();
    error.min(step - error)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn minimum_divisor_value() {
        assert!((MINIMUM_DIVISOR - 0.0086).abs() < 1e-12);
    }

    #[test]
    fn gcd_of_multiples_recovers_step() {
        let step = 0.15;
        let g = gcd(step * 7.0, step * 3.0);
        assert!((g - step).abs() < 1e-6, "got {g}");
    }

    #[test]
    fn gcd_zero_dividend_is_zero() {
        assert_eq!(gcd(0.0, 3.0), 0.0);
    }

    #[test]
    fn gcd_zero_divisor_returns_dividend() {
        assert_eq!(gcd(2.5, 0.0), 2.5);
    }

    #[test]
    fn gcd_below_floor_returns_immediately() {
        let tiny = MINIMUM_DIVISOR / 2.0;
        assert_eq!(gcd(1.0, tiny), 1.0);
        assert_eq!(gcd(tiny, tiny / 2.0), tiny);
    }

    #[test]
    fn gcd_handles_non_finite_inputs() {
        assert!(gcd(f64::INFINITY, 1.0).is_nan() || gcd(f64::INFINITY, 1.0) >= 0.0);
        let _ = gcd(f64::NAN, 1.0);
        let _ = gcd(1.0, f64::NAN);
    }

    #[test]
    fn sensitivity_transform_is_monotonic() {
        let low = convert_to_sensitivity(0.05);
        let mid = convert_to_sensitivity(0.3);
        let high = convert_to_sensitivity(1.2);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn sensitivity_at_fifty_percent() {
        // 50% sensitivity: f = 0.5 * 0.6 + 0.2 = 0.5, step = f^3 * 8 * 0.15
        let step = 0.5_f64.powi(3) * 8.0 * 0.15;
        assert!((convert_to_sensitivity(step) - 0.5).abs() < EPS);
    }

    #[test]
    fn quantization_error_is_folded() {
        let step = 0.4;
        for delta in [0.0, 0.1, 0.2, 0.39, 1.21, -0.75, 12.3] {
            let e = quantization_error(delta, step);
            assert!((0.0..=step / 2.0 + EPS).contains(&e), "delta {delta}: {e}");
        }
        assert!(quantization_error(0.8, step) < EPS);
        assert!((quantization_error(0.3, step) - 0.1).abs() < EPS);
    }
}
