//! Damage reduction derived from the latest probability.

use crate::config::DamageConfig;

/// Multiplier applied to a player's outgoing damage.
///
/// `1.0` below the threshold, then falling linearly to `0.0` as the probability goes
/// from the threshold to `1.0` (scaled by `multiplier`). Always `1.0` when disabled.
#[must_use]
pub fn damage_multiplier(probability: f64, config: &DamageConfig) -> f64 {
    if !config.enabled || probability < config.threshold {
        return 1.0;
    }
    let span = 1.0 - config.threshold;
    if span <= 0.0 {
        return 0.0;
    }
    let reduction = ((probability - config.threshold) / span * config.multiplier).min(1.0);
    1.0 - reduction
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
    fn below_threshold_is_neutral() {
        let config = DamageConfig::default();
        assert_eq!(damage_multiplier(0.0, &config), 1.0);
        assert_eq!(damage_multiplier(0.899, &config), 1.0);
    }

    #[test]
    fn falls_linearly_above_threshold() {
        let config = DamageConfig::default();
        assert!(close(damage_multiplier(0.9, &config), 1.0));
        assert!(close(damage_multiplier(0.95, &config), 0.5));
        assert!(close(damage_multiplier(1.0, &config), 0.0));
    }

    #[test]
    fn steep_multiplier_bottoms_out() {
        let config = DamageConfig {
            multiplier: 4.0,
            ..DamageConfig::default()
        };
        assert!(close(damage_multiplier(0.95, &config), 0.0));
        assert!(close(damage_multiplier(0.92, &config), 0.2));
    }

    #[test]
    fn disabled_is_always_neutral() {
        assert_eq!(damage_multiplier(1.0, &DamageConfig::disabled()), 1.0);
    }
}
