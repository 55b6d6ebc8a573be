//! The classification window and the states it moves through.

use std::collections::VecDeque;

use crate::sampler::TickFeature;
use crate::telemetry::{InvariantChecker, InvariantViolation};

/// Where a connection's classifier is in its dispatch cycle.
///
/// ```text
///            push (window not full, or stride not elapsed)
///            ┌──────┐
///            ▼      │
///         ┌──────────┐  full and stride elapsed  ┌─────────────┐
///  ──────►│   Idle   │──────────────────────────►│ WindowReady │
///         └──────────┘                           └──────┬──────┘
///              ▲  ▲   region disabled / no transport    │
///              │  └─────────────────────────────────────┤
///              │                                        │ dispatch
///              │  response resumed on main context ┌────▼───────┐
///              └───────────────────────────────────│ Dispatched │
///                                                  └────────────┘
/// ```
///
/// The window keeps filling while a request is in flight: the stride counter is reset at
/// dispatch, not at resolution, so a slow response can be overtaken by the next window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassifierState {
    /// Collecting ticks.
    Idle,
    /// Full and due for dispatch.
    WindowReady,
    /// A request is in flight.
    Dispatched,
}

/// A sliding window of the most recent ticks plus a stride counter.
#[derive(Debug, Clone)]
pub struct ClassificationWindow {
    ticks: VecDeque<TickFeature>,
    capacity: usize,
    stride: usize,
    since_dispatch: usize,
}

impl ClassificationWindow {
    /// A window of `capacity` ticks that dispatches at most every `stride` ticks.
    #[must_use]
    pub fn new(capacity: usize, stride: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ticks: VecDeque::with_capacity(capacity),
            capacity,
            stride: stride.max(1),
            since_dispatch: 0,
        }
    }

    /// Appends a tick, dropping the oldest once full, and advances the stride counter.
    pub fn push(&mut self, tick: TickFeature) {
        self.ticks.push_back(tick);
        while self.ticks.len() > self.capacity {
            self.ticks.pop_front();
        }
        self.since_dispatch = self.since_dispatch.saturating_add(1);
    }

    /// Full, and at least `stride` ticks since the last dispatch.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ticks.len() == self.capacity && self.since_dispatch >= self.stride
    }

    /// Restarts the stride counter.
    pub fn mark_dispatched(&mut self) {
        self.since_dispatch = 0;
    }

    /// Drops every tick and restarts the stride counter.
    pub fn reset(&mut self) {
        self.ticks.clear();
        self.since_dispatch = 0;
    }

    /// Changes the window shape. Changing the capacity drops the collected ticks.
    pub fn resize(&mut self, capacity: usize, stride: usize) {
        let capacity = capacity.max(1);
        if capacity != self.capacity {
            self.ticks = VecDeque::with_capacity(capacity);
            self.capacity = capacity;
            self.since_dispatch = 0;
        }
        self.stride = stride.max(1);
    }

    /// Ticks currently held, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TickFeature> {
        self.ticks.iter()
    }

    /// Ticks currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// True when no ticks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Ticks per window.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Minimum ticks between dispatches.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Ticks pushed since the last dispatch or reset.
    #[must_use]
    pub fn since_dispatch(&self) -> usize {
        self.since_dispatch
    }
}

impl InvariantChecker for ClassificationWindow {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.ticks.len() > self.capacity {
            return Err(InvariantViolation::new(
                "ClassificationWindow",
                "window holds more ticks than its capacity",
            )
            .with_details(format!("len={}, capacity={}", self.ticks.len(), self.capacity)));
        }
        if self.capacity == 0 || self.stride == 0 {
            return Err(InvariantViolation::new(
                "ClassificationWindow",
                "capacity and stride must be positive",
            ));
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

    fn tick(yaw: f32) -> TickFeature {
        TickFeature {
            delta_yaw: yaw,
            ..TickFeature::default()
        }
    }

    #[test]
    fn ready_needs_full_window_and_stride() {
        let mut window = ClassificationWindow::new(4, 2);
        for i in 0..3 {
            window.push(tick(i as f32));
            assert!(!window.is_ready());
        }
        window.push(tick(3.0));
        assert!(window.is_ready());

        window.mark_dispatched();
        window.push(tick(4.0));
        assert!(!window.is_ready());
        window.push(tick(5.0));
        assert!(window.is_ready());
        window.check_invariants().unwrap();
    }

    #[test]
    fn oldest_ticks_slide_out() {
        let mut window = ClassificationWindow::new(3, 1);
        for i in 0..5 {
            window.push(tick(i as f32));
        }
        let yaws: Vec<f32> = window.iter().map(|t| t.delta_yaw).collect();
        assert_eq!(yaws, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn reset_clears_everything() {
        let mut window = ClassificationWindow::new(2, 1);
        window.push(tick(1.0));
        window.push(tick(2.0));
        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.since_dispatch(), 0);
    }

    #[test]
    fn resize_drops_ticks_only_when_capacity_changes() {
        let mut window = ClassificationWindow::new(2, 1);
        window.push(tick(1.0));
        window.resize(2, 5);
        assert_eq!(window.len(), 1);
        assert_eq!(window.stride(), 5);

        window.resize(3, 5);
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 3);
    }

    #[test]
    fn zero_shape_is_clamped() {
        let window = ClassificationWindow::new(0, 0);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.stride(), 1);
    }
}
