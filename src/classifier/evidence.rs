//! The evidence buffer: a decaying score that turns probabilities into flags.

use crate::config::EvidenceConfig;
use crate::telemetry::{InvariantChecker, InvariantViolation};

/// Probabilities above this add evidence.
pub const HIGH_PROBABILITY: f64 = 0.90;

/// Probabilities below this let evidence decay.
pub const LOW_PROBABILITY: f64 = 0.10;

/// What one probability did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceUpdate {
    /// Buffer before the probability.
    pub old: f64,
    /// Buffer after the probability, before any flag reset.
    pub raised: f64,
    /// Buffer after the probability and any flag reset.
    pub new: f64,
    /// The buffer crossed the suspicion threshold upward.
    pub suspicious: bool,
    /// The buffer went over the flag threshold and was reset.
    pub flagged: bool,
}

/// Accumulated evidence for one player.
///
/// | Probability | Effect |
/// |-------------|--------|
/// | `p > 0.90` | `+ (p - 0.90) * multiplier` |
/// | `p < 0.10` | `- decrease`, floored at zero |
/// | otherwise | unchanged |
///
/// Once the buffer exceeds `flag` it is set to exactly `reset_on_flag`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceBuffer {
    value: f64,
    high_probability_ticks: u64,
}

impl EvidenceBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Probabilities seen above [`HIGH_PROBABILITY`].
    #[must_use]
    pub fn high_probability_ticks(&self) -> u64 {
        self.high_probability_ticks
    }

    /// Applies one probability.
    pub fn observe(&mut self, probability: f64, config: &EvidenceConfig) -> EvidenceUpdate {
        let old = self.value;
        if probability > HIGH_PROBABILITY {
            self.high_probability_ticks = self.high_probability_ticks.saturating_add(1);
            self.value += (probability - HIGH_PROBABILITY) * config.multiplier;
        } else if probability < LOW_PROBABILITY {
            self.value = (self.value - config.decrease).max(0.0);
        }
        let raised = self.value;

        let suspicious = raised > config.suspicious && old <= config.suspicious;
        let flagged = raised > config.flag;
        if flagged {
            self.value = config.reset_on_flag;
        }
        crate::debug_check_invariants!(self);

        EvidenceUpdate {
            old,
            raised,
            new: self.value,
            suspicious,
            flagged,
        }
    }

    /// Empties the buffer.
    pub fn clear(&mut self) {
        self.value = 0.0;
    }
}

impl InvariantChecker for EvidenceBuffer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.value.is_nan() || self.value < 0.0 {
            return Err(InvariantViolation::new(
                "EvidenceBuffer",
                "buffer must be a non-negative number",
            )
            .with_details(format!("value={}", self.value)));
        }
        Ok(())
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

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn high_probabilities_accumulate() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer::new();
        let levels: Vec<f64> = (0..3).map(|_| buffer.observe(0.95, &config).new).collect();

        assert!(close(levels[0], 5.0));
        assert!(close(levels[1], 10.0));
        assert!(close(levels[2], 15.0));
        assert_eq!(buffer.high_probability_ticks(), 3);
    }

    #[test]
    fn low_probability_decays() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer {
            value: 10.0,
            high_probability_ticks: 0,
        };
        let update = buffer.observe(0.05, &config);
        assert!(close(update.new, 9.75));
        assert_eq!(buffer.high_probability_ticks(), 0);
    }

    #[test]
    fn decay_floors_at_zero() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer {
            value: 0.1,
            high_probability_ticks: 0,
        };
        buffer.observe(0.0, &config);
        assert_eq!(buffer.value(), 0.0);
    }

    #[test]
    fn middle_probabilities_change_nothing() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer {
            value: 7.0,
            high_probability_ticks: 0,
        };
        assert_eq!(buffer.observe(0.5, &config).new, 7.0);
        assert_eq!(buffer.observe(0.9, &config).new, 7.0);
        assert_eq!(buffer.observe(0.1, &config).new, 7.0);
    }

    #[test]
    fn flag_resets_to_configured_level() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer {
            value: 48.0,
            high_probability_ticks: 0,
        };
        let update = buffer.observe(1.0, &config);
        assert!(update.flagged);
        assert!(close(update.raised, 58.0));
        assert_eq!(update.new, config.reset_on_flag);
        assert_eq!(buffer.value(), 25.0);
    }

    #[test]
    fn suspicion_fires_once_per_crossing() {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer {
            value: 22.0,
            high_probability_ticks: 0,
        };
        assert!(buffer.observe(0.95, &config).suspicious);
        assert!(!buffer.observe(0.95, &config).suspicious);

        buffer.value = 20.0;
        assert!(buffer.observe(0.99, &config).suspicious);
    }
}
