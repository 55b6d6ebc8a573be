//! Property-based tests for pipeline internals.
//!
//! These tests use proptest to check invariants under random inputs, reaching the
//! components directly through the `__internal` module.
//!
//! # Invariants Tested
//!
//! - GCD is symmetric for positive inputs, terminates, and never exceeds the larger input
//! - RunningMode never holds more than its capacity and its buckets account for every entry
//! - EvidenceBuffer never goes negative and lands exactly on the reset level after a flag
//! - ClassificationWindow never exceeds its capacity and is only ready on a full window
//! - Backoff delays grow monotonically up to the cap
//! - Deferred clock effects run once each, in transaction order

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use aimwatch::__internal::{gcd, Backoff, ClassificationWindow, EvidenceBuffer, RunningMode};
use aimwatch::telemetry::InvariantChecker;
use aimwatch::{BackoffConfig, EvidenceConfig, TickFeature, TransactionClock};
use parking_lot::Mutex;
use proptest::prelude::*;
use web_time::{Duration, Instant};

// ============================================================================
// Strategies
// ============================================================================

/// Rotation delta magnitudes in the range clients actually report.
fn delta_strategy() -> impl Strategy<Value = f64> {
    0.001f64..180.0
}

/// Probabilities as the endpoint returns them.
fn probability_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![0.0f64..=1.0, Just(0.0), Just(0.9), Just(1.0)]
}

fn backoff_config_strategy() -> impl Strategy<Value = BackoffConfig> {
    (1u64..10_000, 1u64..120_000, 1.5f64..5.0).prop_map(|(initial, max, multiplier)| {
        BackoffConfig {
            initial_delay: Duration::from_millis(initial.min(max)),
            max_delay: Duration::from_millis(max),
            multiplier,
        }
    })
}

// ============================================================================
// Math and estimator
// ============================================================================

proptest! {
    #[test]
    fn gcd_is_symmetric_and_bounded(a in delta_strategy(), b in delta_strategy()) {
        let forward = gcd(a, b);
        let backward = gcd(b, a);
        prop_assert_eq!(forward.to_bits(), backward.to_bits());
        prop_assert!(forward.is_finite());
        prop_assert!(forward > 0.0);
        prop_assert!(forward <= a.max(b));
    }

    #[test]
    fn gcd_of_zero_dividend_is_zero(b in delta_strategy()) {
        prop_assert_eq!(gcd(0.0, b), 0.0);
    }

    #[test]
    fn running_mode_stays_within_capacity(
        capacity in 1usize..64,
        values in prop::collection::vec(0.0f64..2.0, 0..300),
    ) {
        let mut mode = RunningMode::new(capacity);
        for value in values {
            mode.add(value);
            prop_assert!(mode.len() <= capacity);
            prop_assert_eq!(mode.total_count(), mode.len());
            prop_assert!(mode.bucket_count() <= mode.len());
            prop_assert!(mode.check_invariants().is_ok());
        }
        let reading = mode.update_mode();
        prop_assert!(reading.count <= mode.len());
    }
}

// ============================================================================
// Classifier state
// ============================================================================

proptest! {
    #[test]
    fn evidence_is_never_negative(probabilities in prop::collection::vec(probability_strategy(), 1..200)) {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer::new();
        for probability in probabilities {
            let update = buffer.observe(probability, &config);
            prop_assert!(buffer.value() >= 0.0);
            prop_assert!(buffer.value() <= config.flag);
            if update.flagged {
                prop_assert!(update.raised > config.flag);
                prop_assert_eq!(buffer.value(), config.reset_on_flag);
            } else {
                prop_assert_eq!(buffer.value(), update.raised);
            }
        }
    }

    #[test]
    fn middle_band_probabilities_leave_the_buffer_alone(
        start in prop::collection::vec(0.91f64..1.0, 0..5),
        middle in prop::collection::vec(0.1f64..=0.9, 1..50),
    ) {
        let config = EvidenceConfig::default();
        let mut buffer = EvidenceBuffer::new();
        for probability in start {
            let _ = buffer.observe(probability, &config);
        }
        let before = buffer.value();
        for probability in middle {
            let update = buffer.observe(probability, &config);
            prop_assert!(!update.flagged);
        }
        prop_assert_eq!(buffer.value(), before);
    }

    #[test]
    fn window_is_ready_only_when_full(
        capacity in 1usize..64,
        stride in 1usize..16,
        pushes in 0usize..200,
    ) {
        let mut window = ClassificationWindow::new(capacity, stride);
        for _ in 0..pushes {
            window.push(TickFeature::default());
            prop_assert!(window.len() <= capacity);
            if window.is_ready() {
                prop_assert_eq!(window.len(), capacity);
                prop_assert!(window.since_dispatch() >= stride);
                window.mark_dispatched();
                prop_assert!(!window.is_ready());
            }
        }
    }
}

// ============================================================================
// Backoff and transaction clock
// ============================================================================

proptest! {
    #[test]
    fn backoff_grows_monotonically_to_the_cap(
        config in backoff_config_strategy(),
        failures in 1usize..30,
    ) {
        let backoff = Backoff::new(config);
        let now = Instant::now();
        let mut previous = backoff.current_delay();
        for _ in 0..failures {
            backoff.record_failure_at(now);
            let delay = backoff.current_delay();
            prop_assert!(delay >= previous);
            prop_assert!(delay <= config.max_delay);
            prop_assert!(backoff.is_waiting_at(now));
            previous = delay;
        }
        backoff.record_success();
        prop_assert!(!backoff.is_waiting_at(now));
        prop_assert_eq!(backoff.current_delay(), config.initial_delay);
    }

    #[test]
    fn deferred_effects_run_once_in_order(
        markers in 1u32..40,
        picks in prop::collection::vec(0.0f64..1.0, 0..60),
    ) {
        let clock = TransactionClock::new();
        let stamps: Vec<_> = (0..markers).map(|_| clock.send_marker()).collect();

        let mut transactions: Vec<u32> = picks
            .iter()
            .map(|pick| 1 + (pick * f64::from(markers)) as u32 % markers)
            .collect();
        transactions.sort_unstable();

        let ran = Arc::new(Mutex::new(Vec::new()));
        for (order, transaction) in transactions.iter().enumerate() {
            let ran = Arc::clone(&ran);
            let transaction = *transaction;
            clock.defer_effect(transaction, Box::new(move || ran.lock().push((transaction, order))));
        }
        prop_assert_eq!(clock.pending_effects(), transactions.len());

        for stamp in &stamps {
            prop_assert!(clock.on_acknowledgment(stamp.id));
        }

        let ran = ran.lock();
        prop_assert_eq!(ran.len(), transactions.len());
        prop_assert!(ran.windows(2).all(|pair| pair[0].1 < pair[1].1));
        prop_assert_eq!(clock.pending_effects(), 0);
        prop_assert_eq!(clock.outstanding(), 0);
    }
}
