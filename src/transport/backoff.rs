//! Exponential backoff shared by every request to one endpoint.

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::config::BackoffConfig;

#[derive(Debug)]
struct BackoffState {
    current_delay: Duration,
    next_attempt: Option<Instant>,
}

/// Tracks when the next request may be attempted.
///
/// After a failure, requests are refused until the current delay has passed, and the
/// delay grows by the configured multiplier up to `max_delay`. A success resets it.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    state: Mutex<BackoffState>,
}

impl Backoff {
    /// Creates a backoff that allows requests immediately.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BackoffState {
                current_delay: config.initial_delay,
                next_attempt: None,
            }),
        }
    }

    /// True while requests should be refused.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.is_waiting_at(Instant::now())
    }

    /// [`is_waiting`](Self::is_waiting) against an explicit clock reading.
    #[must_use]
    pub fn is_waiting_at(&self, now: Instant) -> bool {
        self.state
            .lock()
            .next_attempt
            .is_some_and(|next| now < next)
    }

    /// Time left until requests are allowed again.
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.state
            .lock()
            .next_attempt
            .map_or(Duration::ZERO, |next| next.saturating_duration_since(now))
    }

    /// Resets the delay after a successful request.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.current_delay = self.config.initial_delay;
        state.next_attempt = None;
    }

    /// Starts a backoff period and grows the delay for the next failure.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock reading.
    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let delay = state.current_delay;
        state.next_attempt = Some(now + delay);

        let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max_delay);
        state.current_delay = grown.clamp(
            self.config.initial_delay.min(self.config.max_delay),
            self.config.max_delay,
        );
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            next_delay_ms = state.current_delay.as_millis() as u64,
            "classification endpoint backing off"
        );
    }

    /// The delay the next failure will impose.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.state.lock().current_delay
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

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn fresh_backoff_allows_requests() {
        let backoff = Backoff::new(config());
        assert!(!backoff.is_waiting());
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
    }

    #[test]
    fn failure_blocks_for_the_current_delay() {
        let backoff = Backoff::new(config());
        let start = Instant::now();
        backoff.record_failure_at(start);

        assert!(backoff.is_waiting_at(start + Duration::from_secs(4)));
        assert!(!backoff.is_waiting_at(start + Duration::from_secs(5)));
        assert_eq!(backoff.remaining_at(start + Duration::from_secs(1)), Duration::from_secs(4));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let backoff = Backoff::new(config());
        let now = Instant::now();
        let delays: Vec<u64> = (0..5)
            .map(|_| {
                backoff.record_failure_at(now);
                backoff.current_delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![10, 20, 30, 30, 30]);
    }

    #[test]
    fn success_resets() {
        let backoff = Backoff::new(config());
        let now = Instant::now();
        backoff.record_failure_at(now);
        backoff.record_failure_at(now);
        backoff.record_success();

        assert!(!backoff.is_waiting_at(now));
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
    }

    #[test]
    fn absurd_multiplier_saturates_at_max() {
        let backoff = Backoff::new(BackoffConfig {
            multiplier: f64::INFINITY,
            ..config()
        });
        backoff.record_failure_at(Instant::now());
        assert_eq!(backoff.current_delay(), Duration::from_secs(30));
    }
}
