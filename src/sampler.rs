//! Per-tick feature extraction.
//!
//! A [`TickFeature`] is taken for every genuine movement report: the orientation change
//! since the previous genuine rotation, the acceleration and jerk of the delta
//! magnitudes, and how far each delta sits from the accepted quantization step.
//!
//! The sampler also owns the combat counter that decides whether a tick is eligible for
//! classification. Aim only carries signal around fights, so a player who has not
//! attacked another player within one window's worth of ticks is not sampled.

use serde::{Deserialize, Serialize};

use crate::estimator::SensitivityEstimator;
use crate::network::reconciler::Orientation;

/// The fixed-shape record sent to the classifier, one per eligible tick.
///
/// Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TickFeature {
    /// Yaw change since the previous genuine rotation.
    pub delta_yaw: f32,
    /// Pitch change since the previous genuine rotation.
    pub delta_pitch: f32,
    /// Change in yaw delta magnitude.
    pub accel_yaw: f32,
    /// Change in pitch delta magnitude.
    pub accel_pitch: f32,
    /// Change in yaw acceleration.
    pub jerk_yaw: f32,
    /// Change in pitch acceleration.
    pub jerk_pitch: f32,
    /// Distance of the yaw delta from the nearest multiple of the yaw step.
    pub gcd_error_yaw: f32,
    /// Distance of the pitch delta from the nearest multiple of the pitch step.
    pub gcd_error_pitch: f32,
}

impl TickFeature {
    /// Number of fields in a record.
    pub const FIELD_COUNT: usize = 8;

    /// The fields in wire order.
    #[must_use]
    pub const fn as_array(&self) -> [f32; Self::FIELD_COUNT] {
        [
            self.delta_yaw,
            self.delta_pitch,
            self.accel_yaw,
            self.accel_pitch,
            self.jerk_yaw,
            self.jerk_pitch,
            self.gcd_error_yaw,
            self.gcd_error_pitch,
        ]
    }
}

/// Tracks combat recency and builds tick features.
#[derive(Debug, Clone)]
pub struct TickSampler {
    ticks_since_attack: u32,
}

impl TickSampler {
    /// Creates a sampler that starts out of combat for a window of `sequence` ticks.
    #[must_use]
    pub fn new(sequence: usize) -> Self {
        let start = u32::try_from(sequence).unwrap_or(u32::MAX).saturating_add(1);
        Self {
            ticks_since_attack: start,
        }
    }

    /// Counts one movement report.
    pub fn on_movement(&mut self) {
        self.ticks_since_attack = self.ticks_since_attack.saturating_add(1);
    }

    /// Records that the player attacked another player.
    pub fn on_attack(&mut self) {
        self.ticks_since_attack = 0;
    }

    /// Movement reports since the last attack on a player.
    #[must_use]
    pub fn ticks_since_attack(&self) -> u32 {
        self.ticks_since_attack
    }

    /// True while the player is recent enough to combat for a window of `sequence`
    /// ticks to carry signal.
    #[must_use]
    pub fn is_eligible(&self, sequence: usize) -> bool {
        usize::try_from(self.ticks_since_attack).is_ok_and(|ticks| ticks <= sequence)
    }

    /// Builds the feature for the current tick.
    ///
    /// `orientation` supplies the delta, `estimator` the acceleration and accepted steps.
    #[must_use]
    pub fn sample(orientation: &Orientation, estimator: &SensitivityEstimator) -> TickFeature {
        let delta_yaw = orientation.yaw - orientation.last_yaw;
        let delta_pitch = orientation.pitch - orientation.last_pitch;

        let yaw = estimator.yaw();
        let pitch = estimator.pitch();
        let accel_yaw = yaw.accel() as f32;
        let accel_pitch = pitch.accel() as f32;

        TickFeature {
            delta_yaw,
            delta_pitch,
            accel_yaw,
            accel_pitch,
            jerk_yaw: accel_yaw - yaw.last_accel() as f32,
            jerk_pitch: accel_pitch - pitch.last_accel() as f32,
            gcd_error_yaw: yaw.quantization_error(f64::from(delta_yaw)) as f32,
            gcd_error_pitch: pitch.quantization_error(f64::from(delta_pitch)) as f32,
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
    use crate::config::EstimatorConfig;
    use crate::network::messages::RotationSample;

    #[test]
    fn starts_just_out_of_combat() {
        let sampler = TickSampler::new(40);
        assert_eq!(sampler.ticks_since_attack(), 41);
        assert!(!sampler.is_eligible(40));
    }

    #[test]
    fn attack_opens_a_window_of_eligibility() {
        let mut sampler = TickSampler::new(40);
        sampler.on_attack();
        for _ in 0..40 {
            sampler.on_movement();
            assert!(sampler.is_eligible(40));
        }
        sampler.on_movement();
        assert!(!sampler.is_eligible(40));
    }

    #[test]
    fn counter_saturates() {
        let mut sampler = TickSampler::new(usize::MAX);
        sampler.on_movement();
        assert_eq!(sampler.ticks_since_attack(), u32::MAX);
    }

    #[test]
    fn feature_combines_orientation_and_estimator() {
        let mut estimator = SensitivityEstimator::new(&EstimatorConfig::default());
        estimator.observe(RotationSample {
            delta_yaw: 1.0,
            delta_pitch: 0.5,
        });
        estimator.observe(RotationSample {
            delta_yaw: -3.0,
            delta_pitch: 0.25,
        });

        let orientation = Orientation {
            yaw: 7.0,
            pitch: 10.25,
            last_yaw: 10.0,
            last_pitch: 10.0,
        };
        let tick = TickSampler::sample(&orientation, &estimator);

        assert_eq!(tick.delta_yaw, -3.0);
        assert_eq!(tick.delta_pitch, 0.25);
        assert_eq!(tick.accel_yaw, 2.0);
        assert_eq!(tick.accel_pitch, -0.25);
        assert_eq!(tick.jerk_yaw, 1.0);
        assert_eq!(tick.jerk_pitch, -0.75);
        // no step accepted yet
        assert_eq!(tick.gcd_error_yaw, 0.0);
        assert_eq!(tick.gcd_error_pitch, 0.0);
    }

    #[test]
    fn wire_order_matches_declaration() {
        let tick = TickFeature {
            delta_yaw: 1.0,
            delta_pitch: 2.0,
            accel_yaw: 3.0,
            accel_pitch: 4.0,
            jerk_yaw: 5.0,
            jerk_pitch: 6.0,
            gcd_error_yaw: 7.0,
            gcd_error_pitch: 8.0,
        };
        assert_eq!(tick.as_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}
