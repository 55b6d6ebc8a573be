//! Configuration types for the aim analysis pipeline.
//!
//! Every struct here is plain data with a `Default`, a handful of presets and a
//! `validate()` method. They derive `serde::Deserialize` with `#[serde(default)]`, so a
//! host can load a partial document and get defaults for everything it leaves out.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `EstimatorConfig` | Sensitivity mode tracking | `responsive()` |
//! | `ReconcilerConfig` | Duplicate-packet filtering | `strict()`, `lenient()` |
//! | `WindowConfig` | Classification window shape | `high_frequency()` |
//! | `EvidenceConfig` | Evidence buffer thresholds | `conservative()`, `aggressive()` |
//! | `DamageConfig` | Damage reduction from probabilities | `disabled()` |
//! | `BackoffConfig` | Transport retry backoff | `patient()` |
//! | `TransportConfig` | Classification endpoint | none |
//! | `AimwatchConfig` | All of the above | none |
//!
//! # Example
//!
//! ```
//! use aimwatch::config::{AimwatchConfig, EvidenceConfig};
//!
//! let config = AimwatchConfig {
//!     evidence: EvidenceConfig::conservative(),
//!     ..AimwatchConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;
use web_time::Duration;

use crate::error::{AimwatchResult, ConfigErrorKind};

fn check_count(field: &'static str, value: usize, min: u64, max: u64) -> AimwatchResult<()> {
    let actual = value as u64;
    if actual < min || actual > max {
        return Err(ConfigErrorKind::CountOutOfRange {
            field,
            min,
            max,
            actual,
        }
        .into());
    }
    Ok(())
}

fn check_value(field: &'static str, value: f64, min: f64, max: f64) -> AimwatchResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigErrorKind::ValueOutOfRange {
            field,
            min,
            max,
            actual: value,
        }
        .into());
    }
    Ok(())
}

fn check_duration(
    field: &'static str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> AimwatchResult<()> {
    if value < Duration::from_millis(min_ms) || value > Duration::from_millis(max_ms) {
        return Err(ConfigErrorKind::DurationOutOfRange {
            field,
            min_ms,
            max_ms,
            actual_ms: value.as_millis() as u64,
        }
        .into());
    }
    Ok(())
}

/// Settings for the per-axis sensitivity estimator.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "EstimatorConfig has no effect unless passed to a Connection"]
pub struct EstimatorConfig {
    /// How many GCD observations each axis keeps.
    ///
    /// Default: 80
    pub capacity: usize,
    /// Observations (and occurrences of the mode) needed before a step is accepted.
    ///
    /// Default: 15
    pub significance: usize,
    /// Deltas at or above this many degrees are ignored.
    ///
    /// Default: 5.0
    pub max_delta_degrees: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            capacity: 80,
            significance: 15,
            max_delta_degrees: 5.0,
        }
    }
}

impl EstimatorConfig {
    /// Creates a new `EstimatorConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter history, so a sensitivity change is picked up sooner.
    pub fn responsive() -> Self {
        Self {
            capacity: 40,
            significance: 10,
            ..Self::default()
        }
    }

    /// Validates the estimator configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if any value is out of range, or if
    /// `significance` is not smaller than `capacity` (the mode could never be accepted).
    pub fn validate(&self) -> AimwatchResult<()> {
        check_count("capacity", self.capacity, 2, 4096)?;
        check_count("significance", self.significance, 1, 4095)?;
        if self.significance >= self.capacity {
            return Err(ConfigErrorKind::Ordering {
                lower: "significance",
                upper: "capacity",
            }
            .into());
        }
        check_value("max_delta_degrees", self.max_delta_degrees, 0.0, 360.0)
    }
}

/// Settings for duplicate-packet filtering in the movement reconciler.
///
/// Older clients send an extra movement packet that repeats a rotation alongside a tiny
/// position change. How close the position must be depends on the client's era.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "ReconcilerConfig has no effect unless passed to a Connection"]
pub struct ReconcilerConfig {
    /// Distance threshold for clients in [`ClientEra::Coarse`](crate::network::messages::ClientEra::Coarse).
    ///
    /// Default: 0.03
    pub coarse_duplicate_threshold: f64,
    /// Distance threshold for clients in [`ClientEra::Fine`](crate::network::messages::ClientEra::Fine).
    ///
    /// Default: 0.0002
    pub fine_duplicate_threshold: f64,
    /// Discard duplicate reports outright instead of only suppressing their rotation.
    ///
    /// Default: false
    pub cancel_duplicates: bool,
    /// Leave orientation untouched on duplicates. When false the duplicate's rotation is
    /// written into orientation state (still without producing a sample).
    ///
    /// Default: true
    pub ignore_duplicate_rotation: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            coarse_duplicate_threshold: 0.03,
            fine_duplicate_threshold: 0.0002,
            cancel_duplicates: false,
            ignore_duplicate_rotation: true,
        }
    }
}

impl ReconcilerConfig {
    /// Creates a new `ReconcilerConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops duplicate reports before anything else sees them.
    pub fn strict() -> Self {
        Self {
            cancel_duplicates: true,
            ..Self::default()
        }
    }

    /// Lets duplicate rotations update orientation state.
    pub fn lenient() -> Self {
        Self {
            ignore_duplicate_rotation: false,
            ..Self::default()
        }
    }

    /// Validates the reconciler configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if a threshold is negative or not finite.
    pub fn validate(&self) -> AimwatchResult<()> {
        check_value(
            "coarse_duplicate_threshold",
            self.coarse_duplicate_threshold,
            0.0,
            1.0,
        )?;
        check_value(
            "fine_duplicate_threshold",
            self.fine_duplicate_threshold,
            0.0,
            1.0,
        )
    }
}

/// Shape of the classification window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[must_use = "WindowConfig has no effect unless passed to a ClassificationService"]
pub struct WindowConfig {
    /// Ticks per window. The classifier may renegotiate this at runtime.
    ///
    /// Default: 40
    pub sequence: usize,
    /// Minimum ticks between two dispatches.
    ///
    /// Default: 10
    pub step: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            sequence: 40,
            step: 10,
        }
    }
}

impl WindowConfig {
    /// Creates a new `WindowConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch on every fifth tick.
    pub fn high_frequency() -> Self {
        Self {
            step: 5,
            ..Self::default()
        }
    }

    /// Validates the window configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if `sequence` or `step` is out of range.
    pub fn validate(&self) -> AimwatchResult<()> {
        check_count("sequence", self.sequence, 1, MAX_WINDOW_SEQUENCE as u64)?;
        check_count("step", self.step, 1, MAX_WINDOW_SEQUENCE as u64)
    }
}

/// Largest window size accepted from config or from renegotiation.
pub const MAX_WINDOW_SEQUENCE: usize = 1024;

/// Evidence buffer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "EvidenceConfig has no effect unless passed to a ClassificationService"]
pub struct EvidenceConfig {
    /// Buffer level above which a flag is raised.
    ///
    /// Default: 50.0
    pub flag: f64,
    /// Buffer level after a flag.
    ///
    /// Default: 25.0
    pub reset_on_flag: f64,
    /// Scale applied to the part of a probability above 0.90.
    ///
    /// Default: 100.0
    pub multiplier: f64,
    /// Amount removed when a probability is below 0.10.
    ///
    /// Default: 0.25
    pub decrease: f64,
    /// Buffer level whose upward crossing raises a suspicion notification.
    ///
    /// Default: 25.0
    pub suspicious: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            flag: 50.0,
            reset_on_flag: 25.0,
            multiplier: 100.0,
            decrease: 0.25,
            suspicious: 25.0,
        }
    }
}

impl EvidenceConfig {
    /// Creates a new `EvidenceConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Needs twice the evidence before flagging and forgets faster.
    pub fn conservative() -> Self {
        Self {
            flag: 100.0,
            reset_on_flag: 50.0,
            decrease: 0.5,
            suspicious: 50.0,
            ..Self::default()
        }
    }

    /// Flags on less evidence.
    pub fn aggressive() -> Self {
        Self {
            flag: 30.0,
            reset_on_flag: 15.0,
            suspicious: 15.0,
            ..Self::default()
        }
    }

    /// Validates the evidence configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if a value is negative or not finite, or if
    /// `reset_on_flag` exceeds `flag` (a flag would immediately re-trigger).
    pub fn validate(&self) -> AimwatchResult<()> {
        check_value("flag", self.flag, 0.0, 1e9)?;
        check_value("reset_on_flag", self.reset_on_flag, 0.0, 1e9)?;
        check_value("multiplier", self.multiplier, 0.0, 1e9)?;
        check_value("decrease", self.decrease, 0.0, 1e9)?;
        check_value("suspicious", self.suspicious, 0.0, 1e9)?;
        if self.reset_on_flag > self.flag {
            return Err(ConfigErrorKind::Ordering {
                lower: "reset_on_flag",
                upper: "flag",
            }
            .into());
        }
        Ok(())
    }
}

/// Damage reduction derived from classifier probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "DamageConfig has no effect unless passed to a ClassificationService"]
pub struct DamageConfig {
    /// Whether probabilities reduce damage at all.
    ///
    /// Default: true
    pub enabled: bool,
    /// Probability at which reduction starts.
    ///
    /// Default: 0.9
    pub threshold: f64,
    /// How steeply damage falls off above the threshold.
    ///
    /// Default: 1.0
    pub multiplier: f64,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.9,
            multiplier: 1.0,
        }
    }
}

impl DamageConfig {
    /// Creates a new `DamageConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Never reduces damage.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validates the damage configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if `threshold` is outside `[0, 1)` or
    /// `multiplier` is negative.
    pub fn validate(&self) -> AimwatchResult<()> {
        check_value("threshold", self.threshold, 0.0, 0.999_999)?;
        check_value("multiplier", self.multiplier, 0.0, 1e6)
    }
}

/// Exponential backoff for a failing classification endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "BackoffConfig has no effect unless passed to a GuardedTransport"]
pub struct BackoffConfig {
    /// Delay after the first failure.
    ///
    /// Default: 5s
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Delay never grows past this.
    ///
    /// Default: 60s
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    ///
    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Creates a new `BackoffConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backs off for up to five minutes.
    pub fn patient() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Validates the backoff configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if a delay is out of range, the multiplier
    /// is below 1.0, or `initial_delay` exceeds `max_delay`.
    pub fn validate(&self) -> AimwatchResult<()> {
        check_duration("initial_delay", self.initial_delay, 1, 3_600_000)?;
        check_duration("max_delay", self.max_delay, 1, 86_400_000)?;
        check_value("multiplier", self.multiplier, 1.0, 100.0)?;
        if self.initial_delay > self.max_delay {
            return Err(ConfigErrorKind::Ordering {
                lower: "initial_delay",
                upper: "max_delay",
            }
            .into());
        }
        Ok(())
    }
}

/// Where and how to reach the classification endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "TransportConfig has no effect unless used to build a transport"]
pub struct TransportConfig {
    /// Whether a transport should be installed at all.
    ///
    /// Default: false
    pub enabled: bool,
    /// Endpoint URL.
    ///
    /// Default: empty
    pub url: String,
    /// Value of the `X-API-Key` header.
    ///
    /// Default: `API-KEY` (a placeholder that keeps the transport disabled)
    pub api_key: String,
    /// Connect timeout.
    ///
    /// Default: 10s
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Whole-request timeout, enforced independently of backoff.
    ///
    /// Default: 5s
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Backoff applied after failures.
    pub backoff: BackoffConfig,
}

/// The api key value shipped in sample configs; never sent.
pub const PLACEHOLDER_API_KEY: &str = "API-KEY";

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: PLACEHOLDER_API_KEY.to_owned(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl TransportConfig {
    /// True when the config is enabled, names an endpoint and carries a real key.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.url.trim().is_empty() && self.api_key != PLACEHOLDER_API_KEY
    }

    /// Validates the transport configuration.
    ///
    /// # Errors
    ///
    /// Returns `AimwatchError::InvalidConfig` if a timeout or the backoff is out of range.
    pub fn validate(&self) -> AimwatchResult<()> {
        check_duration("connect_timeout", self.connect_timeout, 1, 120_000)?;
        check_duration("request_timeout", self.request_timeout, 1, 120_000)?;
        self.backoff.validate()
    }
}

/// Everything the classifier side needs, bundled for reloads.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "ClassifierConfig has no effect unless passed to a ClassificationService"]
pub struct ClassifierConfig {
    /// Window shape.
    pub window: WindowConfig,
    /// Evidence thresholds.
    pub evidence: EvidenceConfig,
    /// Damage reduction.
    pub damage: DamageConfig,
    /// Consult the region filter before dispatching.
    ///
    /// Default: true
    pub region_filter_enabled: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            evidence: EvidenceConfig::default(),
            damage: DamageConfig::default(),
            region_filter_enabled: true,
        }
    }
}

impl ClassifierConfig {
    /// Validates every nested config.
    ///
    /// # Errors
    ///
    /// Returns the first nested validation error.
    pub fn validate(&self) -> AimwatchResult<()> {
        self.window.validate()?;
        self.evidence.validate()?;
        self.damage.validate()
    }
}

/// The complete configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[must_use = "AimwatchConfig has no effect unless used to build the pipeline"]
pub struct AimwatchConfig {
    /// Sensitivity estimator.
    pub estimator: EstimatorConfig,
    /// Movement reconciler.
    pub reconciler: ReconcilerConfig,
    /// Window shape.
    pub window: WindowConfig,
    /// Evidence thresholds.
    pub evidence: EvidenceConfig,
    /// Damage reduction.
    pub damage: DamageConfig,
    /// Classification endpoint.
    pub transport: TransportConfig,
    /// Consult the region filter before dispatching.
    ///
    /// Default: true
    pub region_filter_enabled: bool,
}

impl Default for AimwatchConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            window: WindowConfig::default(),
            evidence: EvidenceConfig::default(),
            damage: DamageConfig::default(),
            transport: TransportConfig::default(),
            region_filter_enabled: true,
        }
    }
}

impl AimwatchConfig {
    /// The classifier-side subset of this config.
    pub fn classifier(&self) -> ClassifierConfig {
        ClassifierConfig {
            window: self.window,
            evidence: self.evidence,
            damage: self.damage,
            region_filter_enabled: self.region_filter_enabled,
        }
    }

    /// Validates every nested config.
    ///
    /// # Errors
    ///
    /// Returns the first nested validation error.
    pub fn validate(&self) -> AimwatchResult<()> {
        self.estimator.validate()?;
        self.reconciler.validate()?;
        self.classifier().validate()?;
        self.transport.validate()
    }
}

/// Durations are written as (fractional) seconds in config documents.
mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use web_time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
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
    use crate::error::AimwatchError;

    #[test]
    fn defaults_validate() {
        AimwatchConfig::default().validate().unwrap();
    }

    #[test]
    fn presets_validate() {
        EstimatorConfig::responsive().validate().unwrap();
        ReconcilerConfig::strict().validate().unwrap();
        ReconcilerConfig::lenient().validate().unwrap();
        WindowConfig::high_frequency().validate().unwrap();
        EvidenceConfig::conservative().validate().unwrap();
        EvidenceConfig::aggressive().validate().unwrap();
        DamageConfig::disabled().validate().unwrap();
        BackoffConfig::patient().validate().unwrap();
    }

    #[test]
    fn default_values_match_documented_defaults() {
        let window = WindowConfig::default();
        assert_eq!(window.sequence, 40);
        assert_eq!(window.step, 10);

        let evidence = EvidenceConfig::default();
        assert_eq!(evidence.flag, 50.0);
        assert_eq!(evidence.reset_on_flag, 25.0);
        assert_eq!(evidence.multiplier, 100.0);
        assert_eq!(evidence.decrease, 0.25);
        assert_eq!(evidence.suspicious, 25.0);

        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial_delay, Duration::from_secs(5));
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert_eq!(backoff.multiplier, 2.0);
    }

    #[test]
    fn zero_sequence_is_rejected() {
        let err = WindowConfig {
            sequence: 0,
            ..WindowConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(
            err,
            AimwatchError::InvalidConfig {
                kind: ConfigErrorKind::CountOutOfRange {
                    field: "sequence",
                    ..
                }
            }
        ));
    }

    #[test]
    fn reset_above_flag_is_rejected() {
        let err = EvidenceConfig {
            reset_on_flag: 60.0,
            ..EvidenceConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("reset_on_flag"));
    }

    #[test]
    fn nan_values_are_rejected() {
        assert!(EvidenceConfig {
            multiplier: f64::NAN,
            ..EvidenceConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn significance_must_be_below_capacity() {
        assert!(EstimatorConfig {
            capacity: 10,
            significance: 10,
            ..EstimatorConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn backoff_ordering_is_enforced() {
        assert!(BackoffConfig {
            initial_delay: Duration::from_secs(120),
            ..BackoffConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn placeholder_key_keeps_transport_unusable() {
        let config = TransportConfig {
            enabled: true,
            url: "https://classifier.invalid/v1/predict".to_owned(),
            ..TransportConfig::default()
        };
        assert!(!config.is_usable());

        let config = TransportConfig {
            api_key: "secret".to_owned(),
            ..config
        };
        assert!(config.is_usable());

        let config = TransportConfig {
            url: "   ".to_owned(),
            ..config
        };
        assert!(!config.is_usable());
    }

    #[test]
    fn partial_json_document_fills_in_defaults() {
        let config: AimwatchConfig = serde_json::from_str(
            r#"{
                "window": { "sequence": 20 },
                "evidence": { "flag": 80.0 },
                "transport": { "enabled": true, "url": "http://localhost", "request_timeout": 2.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.window.sequence, 20);
        assert_eq!(config.window.step, 10);
        assert_eq!(config.evidence.flag, 80.0);
        assert_eq!(config.evidence.reset_on_flag, 25.0);
        assert_eq!(config.transport.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.transport.connect_timeout, Duration::from_secs(10));
        assert!(config.region_filter_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn negative_duration_is_a_deserialize_error() {
        let result: Result<BackoffConfig, _> =
            serde_json::from_str(r#"{ "initial_delay": -1.0 }"#);
        assert!(result.is_err());
    }
}
