//! Bounded-history mode tracker for float observations.

use std::collections::VecDeque;

use crate::telemetry::{InvariantChecker, InvariantViolation};

/// Observations closer than this share a bucket.
pub const MODE_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bucket {
    value: f64,
    count: usize,
}

/// The most frequent bucket and how often it occurs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModeReading {
    /// Representative value of the bucket.
    pub value: f64,
    /// Occurrences currently held for it.
    pub count: usize,
}

/// Keeps the last `capacity` observations and counts them by bucket.
///
/// An observation joins the first existing bucket within [`MODE_EPSILON`] of it; the
/// history records that bucket's representative value, so evicting the observation later
/// decrements the right bucket. Buckets are kept in creation order, which makes ties in
/// [`update_mode`](Self::update_mode) resolve to the oldest bucket.
///
/// # Examples
///
/// ```
/// use aimwatch::__internal::RunningMode;
///
/// let mut mode = RunningMode::new(4);
/// for value in [0.15, 0.1502, 0.3, 0.15] {
///     mode.add(value);
/// }
/// let reading = mode.update_mode();
/// assert_eq!(reading.value, 0.15);
/// assert_eq!(reading.count, 3);
/// ```
#[derive(Debug, Clone)]
pub struct RunningMode {
    history: VecDeque<f64>,
    buckets: Vec<Bucket>,
    capacity: usize,
    mode: ModeReading,
}

impl RunningMode {
    /// Creates an empty tracker holding at most `capacity` observations (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            buckets: Vec::new(),
            capacity,
            mode: ModeReading::default(),
        }
    }

    /// Records an observation, evicting the oldest one if full.
    pub fn add(&mut self, value: f64) {
        if self.history.len() >= self.capacity {
            if let Some(oldest) = self.history.pop_front() {
                self.release(oldest);
            }
        }

        let key = match self
            .buckets
            .iter_mut()
            .find(|bucket| (bucket.value - value).abs() < MODE_EPSILON)
        {
            Some(bucket) => {
                bucket.count += 1;
                bucket.value
            },
            None => {
                self.buckets.push(Bucket { value, count: 1 });
                value
            },
        };
        self.history.push_back(key);

        crate::debug_check_invariants!(self);
    }

    fn release(&mut self, key: f64) {
        let Some(index) = self
            .buckets
            .iter()
            .position(|bucket| bucket.value.to_bits() == key.to_bits())
        else {
            return;
        };
        let bucket = &mut self.buckets[index];
        bucket.count -= 1;
        if bucket.count == 0 {
            self.buckets.remove(index);
        }
    }

    /// Recomputes and returns the most frequent bucket.
    pub fn update_mode(&mut self) -> ModeReading {
        let mut best = ModeReading::default();
        for bucket in &self.buckets {
            if bucket.count > best.count {
                best = ModeReading {
                    value: bucket.value,
                    count: bucket.count,
                };
            }
        }
        self.mode = best;
        best
    }

    /// The reading from the last [`update_mode`](Self::update_mode) call.
    #[must_use]
    pub fn mode(&self) -> ModeReading {
        self.mode
    }

    /// Number of observations held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True when nothing has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Maximum number of observations held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of all bucket counts. Always equals [`len`](Self::len).
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }

    /// Number of distinct buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Forgets every observation.
    pub fn clear(&mut self) {
        self.history.clear();
        self.buckets.clear();
        self.mode = ModeReading::default();
    }
}

impl InvariantChecker for RunningMode {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.history.len() > self.capacity {
            return Err(
                InvariantViolation::new("RunningMode", "history exceeds capacity").with_details(
                    format!("len={}, capacity={}", self.history.len(), self.capacity),
                ),
            );
        }
        let total = self.total_count();
        if total != self.history.len() {
            return Err(
                InvariantViolation::new("RunningMode", "bucket counts disagree with history")
                    .with_details(format!("total={}, len={}", total, self.history.len())),
            );
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

    #[test]
    fn close_values_share_a_bucket() {
        let mut mode = RunningMode::new(10);
        mode.add(0.5);
        mode.add(0.5005);
        mode.add(0.4999);
        assert_eq!(mode.bucket_count(), 1);
        assert_eq!(mode.update_mode(), ModeReading { value: 0.5, count: 3 });
    }

    #[test]
    fn distant_values_get_their_own_buckets() {
        let mut mode = RunningMode::new(10);
        mode.add(0.5);
        mode.add(0.502);
        assert_eq!(mode.bucket_count(), 2);
    }

    #[test]
    fn eviction_decrements_the_bucket_it_joined() {
        let mut mode = RunningMode::new(3);
        mode.add(1.0);
        mode.add(1.0004);
        mode.add(2.0);
        mode.add(2.0);
        // the first 1.0 was evicted; one 1.0-bucket entry remains
        assert_eq!(mode.len(), 3);
        assert_eq!(mode.total_count(), 3);
        assert_eq!(mode.update_mode(), ModeReading { value: 2.0, count: 2 });

        mode.add(3.0);
        // the 1.0004 entry (recorded under key 1.0) goes, removing the bucket
        assert_eq!(mode.bucket_count(), 2);
        mode.check_invariants().unwrap();
    }

    #[test]
    fn ties_resolve_to_the_oldest_bucket() {
        let mut mode = RunningMode::new(10);
        mode.add(0.3);
        mode.add(0.6);
        mode.add(0.6);
        mode.add(0.3);
        assert_eq!(mode.update_mode().value, 0.3);
    }

    #[test]
    fn empty_tracker_reports_zero_mode() {
        let mut mode = RunningMode::new(5);
        assert!(mode.is_empty());
        assert_eq!(mode.update_mode(), ModeReading::default());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut mode = RunningMode::new(0);
        mode.add(1.0);
        mode.add(2.0);
        assert_eq!(mode.capacity(), 1);
        assert_eq!(mode.len(), 1);
        assert_eq!(mode.update_mode().value, 2.0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut mode = RunningMode::new(5);
        mode.add(1.0);
        mode.update_mode();
        mode.clear();
        assert!(mode.is_empty());
        assert_eq!(mode.bucket_count(), 0);
        assert_eq!(mode.mode(), ModeReading::default());
    }
}
