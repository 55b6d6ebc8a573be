//! Per-axis sensitivity estimation.
//!
//! Each axis keeps a [`RunningMode`] over the GCDs of consecutive rotation deltas. Once
//! enough of them agree, the mode is accepted as the axis's quantization step and turned
//! into a sensitivity estimate. The estimator also tracks the acceleration of the delta
//! magnitudes, which the tick sampler reads back.
//!
//! Insufficient data is not an error: an axis without an accepted step simply reports
//! `None` and a quantization error of zero.

mod running_mode;

pub use running_mode::{ModeReading, RunningMode, MODE_EPSILON};

use crate::config::EstimatorConfig;
use crate::math::{convert_to_sensitivity, gcd, quantization_error, MINIMUM_DIVISOR};
use crate::network::messages::RotationSample;

/// Estimator state for one rotation axis.
#[derive(Debug, Clone)]
pub struct AxisEstimator {
    mode: RunningMode,
    significance: usize,
    max_delta: f64,
    last_recorded: f64,
    step: f64,
    sensitivity: f64,
    last_magnitude: f64,
    accel: f64,
    last_accel: f64,
    divisor: f64,
}

impl AxisEstimator {
    /// Creates an axis with no observations.
    #[must_use]
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            mode: RunningMode::new(config.capacity),
            significance: config.significance,
            max_delta: config.max_delta_degrees,
            last_recorded: 0.0,
            step: 0.0,
            sensitivity: 0.0,
            last_magnitude: 0.0,
            accel: 0.0,
            last_accel: 0.0,
            divisor: 0.0,
        }
    }

    /// Feeds one rotation delta (in degrees) for this axis.
    pub fn observe(&mut self, delta: f64) {
        let magnitude = delta.abs();

        self.last_accel = self.accel;
        self.accel = magnitude - self.last_magnitude;
        self.last_magnitude = magnitude;

        self.divisor = gcd(magnitude, self.last_recorded);
        if magnitude > 0.0 && magnitude < self.max_delta && self.divisor > MINIMUM_DIVISOR {
            self.mode.add(self.divisor);
            self.last_recorded = magnitude;
        }

        if self.mode.len() > self.significance {
            let reading = self.mode.update_mode();
            if reading.count > self.significance {
                self.step = reading.value;
                self.sensitivity = convert_to_sensitivity(reading.value);
            }
        }
    }

    /// The accepted quantization step, once one exists.
    #[must_use]
    pub fn step(&self) -> Option<f64> {
        (self.step > 0.0).then_some(self.step)
    }

    /// Sensitivity derived from the accepted step.
    #[must_use]
    pub fn sensitivity(&self) -> Option<f64> {
        self.step().map(|_| self.sensitivity)
    }

    /// Change in delta magnitude on the latest observation.
    #[must_use]
    pub fn accel(&self) -> f64 {
        self.accel
    }

    /// Change in delta magnitude on the observation before.
    #[must_use]
    pub fn last_accel(&self) -> f64 {
        self.last_accel
    }

    /// GCD computed on the latest observation.
    #[must_use]
    pub fn divisor(&self) -> f64 {
        self.divisor
    }

    /// Distance of `delta` from the nearest multiple of the accepted step.
    #[must_use]
    pub fn quantization_error(&self, delta: f64) -> f64 {
        quantization_error(delta, self.step)
    }

    /// The underlying mode tracker.
    #[must_use]
    pub fn running_mode(&self) -> &RunningMode {
        &self.mode
    }
}

/// A point-in-time view of both axes, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensitivityReadout {
    /// Accepted yaw step.
    pub yaw_step: Option<f64>,
    /// Accepted pitch step.
    pub pitch_step: Option<f64>,
    /// Yaw sensitivity estimate.
    pub yaw_sensitivity: Option<f64>,
    /// Pitch sensitivity estimate.
    pub pitch_sensitivity: Option<f64>,
    /// Latest yaw GCD.
    pub yaw_divisor: f64,
    /// Latest pitch GCD.
    pub pitch_divisor: f64,
}

/// Yaw and pitch estimators fed from genuine rotation samples.
#[derive(Debug, Clone)]
pub struct SensitivityEstimator {
    yaw: AxisEstimator,
    pitch: AxisEstimator,
}

impl SensitivityEstimator {
    /// Creates an estimator with empty history on both axes.
    #[must_use]
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            yaw: AxisEstimator::new(config),
            pitch: AxisEstimator::new(config),
        }
    }

    /// Feeds a genuine rotation sample to both axes.
    pub fn observe(&mut self, sample: RotationSample) {
        self.yaw.observe(f64::from(sample.delta_yaw));
        self.pitch.observe(f64::from(sample.delta_pitch));
    }

    /// Yaw axis state.
    #[must_use]
    pub fn yaw(&self) -> &AxisEstimator {
        &self.yaw
    }

    /// Pitch axis state.
    #[must_use]
    pub fn pitch(&self) -> &AxisEstimator {
        &self.pitch
    }

    /// Both axes at a glance.
    #[must_use]
    pub fn readout(&self) -> SensitivityReadout {
        SensitivityReadout {
            yaw_step: self.yaw.step(),
            pitch_step: self.pitch.step(),
            yaw_sensitivity: self.yaw.sensitivity(),
            pitch_sensitivity: self.pitch.sensitivity(),
            yaw_divisor: self.yaw.divisor(),
            pitch_divisor: self.pitch.divisor(),
        }
    }
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

    fn feed_multiples(axis: &mut AxisEstimator, step: f64, multiples: &[u32]) {
        for &m in multiples {
            axis.observe(step * f64::from(m));
        }
    }

    #[test]
    fn no_step_before_significance() {
        let mut axis = AxisEstimator::new(&EstimatorConfig::default());
        feed_multiples(&mut axis, 0.15, &[2, 3, 5, 4, 7]);
        assert_eq!(axis.step(), None);
        assert_eq!(axis.sensitivity(), None);
        assert_eq!(axis.quantization_error(0.37), 0.0);
    }

    #[test]
    fn consistent_steps_are_accepted() {
        let step = 0.15;
        let mut axis = AxisEstimator::new(&EstimatorConfig::default());
        let multiples: Vec<u32> = (0..40).map(|i| 2 + (i * 7) % 11).collect();
        feed_multiples(&mut axis, step, &multiples);

        let accepted = axis.step().expect("step should be accepted");
        assert!((accepted - step).abs() < 1e-3, "accepted {accepted}");
        let sensitivity = axis.sensitivity().unwrap();
        assert!((sensitivity - convert_to_sensitivity(accepted)).abs() < 1e-12);
    }

    #[test]
    fn large_and_zero_deltas_are_not_recorded() {
        let mut axis = AxisEstimator::new(&EstimatorConfig::default());
        axis.observe(0.0);
        axis.observe(12.0);
        axis.observe(-30.0);
        assert!(axis.running_mode().is_empty());
    }

    #[test]
    fn acceleration_tracks_magnitude_changes() {
        let mut axis = AxisEstimator::new(&EstimatorConfig::default());
        axis.observe(1.0);
        axis.observe(-3.0);
        assert_eq!(axis.last_accel(), 1.0);
        assert_eq!(axis.accel(), 2.0);
        axis.observe(0.5);
        assert_eq!(axis.last_accel(), 2.0);
        assert_eq!(axis.accel(), -2.5);
    }

    #[test]
    fn estimator_feeds_both_axes() {
        let mut estimator = SensitivityEstimator::new(&EstimatorConfig::default());
        estimator.observe(RotationSample {
            delta_yaw: 1.5,
            delta_pitch: -0.5,
        });
        assert_eq!(estimator.yaw().accel(), 1.5);
        assert_eq!(estimator.pitch().accel(), 0.5);
        let readout = estimator.readout();
        assert_eq!(readout.yaw_step, None);
        assert_eq!(readout.pitch_step, None);
    }
}
