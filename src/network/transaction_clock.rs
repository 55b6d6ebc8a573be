//! Round-trip markers that order server-side effects against client acknowledgment.
//!
//! The server interleaves lightweight probe messages ("markers") with the rest of its
//! outbound traffic. The client answers each marker in the order it processed them, so
//! once a marker comes back the server knows the client has seen everything sent before
//! it. Effects that must line up with what the client has seen are deferred until the
//! matching acknowledgment arrives.
//!
//! # Counters
//!
//! Two monotonically increasing counters are kept per connection:
//!
//! - **sent**: markers issued so far. The `n`-th marker is transaction `n`.
//! - **acknowledged**: markers the client has passed. Every marker popped off the sent
//!   queue by an acknowledgment counts, including markers that were skipped over.
//!
//! # Draining deferred effects
//!
//! After an acknowledgment brings the counter to `r`, deferred effects are walked in
//! insertion order:
//!
//! | Effect transaction | Action                              |
//! |--------------------|-------------------------------------|
//! | `<= r`             | run and remove                      |
//! | `== r + 1`         | keep (visible one round trip later) |
//! | `> r + 1`          | stop walking                        |
//!
//! Effects run after the queue lock has been released, in insertion order.
//!
//! # Threads
//!
//! [`send_marker`](TransactionClock::send_marker) and
//! [`defer_effect`](TransactionClock::defer_effect) run on the network-send path;
//! [`on_acknowledgment`](TransactionClock::on_acknowledgment) on the network-receive path.
//! The clock is shared between them behind an `Arc`; each queue has its own short-lived
//! lock and the counters are atomics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use web_time::Instant;

use crate::telemetry::{
    report_to_observer, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};

/// Work to run once the client has caught up to a transaction.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one outbound marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionStamp {
    /// Wire id, drawn from `0, -1, -2, ..., -32767` and wrapping.
    pub id: i16,
    /// Nanoseconds since the clock was created, when the marker was issued.
    pub issued_at_nanos: u64,
}

struct DeferredEffect {
    transaction: u32,
    task: DeferredTask,
}

/// Per-connection marker bookkeeping.
pub struct TransactionClock {
    epoch: Instant,
    id_counter: AtomicU32,
    sent_count: AtomicU32,
    acknowledged: AtomicU32,
    sent: Mutex<VecDeque<TransactionStamp>>,
    deferred: Mutex<VecDeque<DeferredEffect>>,
    observer: RwLock<Option<Arc<dyn ViolationObserver>>>,
}

impl TransactionClock {
    /// Creates a clock with nothing sent or acknowledged.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            id_counter: AtomicU32::new(0),
            sent_count: AtomicU32::new(0),
            acknowledged: AtomicU32::new(0),
            sent: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(VecDeque::new()),
            observer: RwLock::new(None),
        }
    }

    /// Routes skipped-marker reports to `observer` instead of the tracing log.
    pub fn set_observer(&self, observer: Arc<dyn ViolationObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Allocates a marker. The caller must send it to the client as a round-trip probe.
    pub fn send_marker(&self) -> TransactionStamp {
        self.send_numbered_marker().0
    }

    /// Allocates a marker and returns it with its transaction number.
    pub(crate) fn send_numbered_marker(&self) -> (TransactionStamp, u32) {
        let raw = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let stamp = TransactionStamp {
            id: -((raw & 0x7FFF) as i16),
            issued_at_nanos: self.epoch.elapsed().as_nanos() as u64,
        };
        let mut sent = self.sent.lock();
        sent.push_back(stamp);
        let transaction = self.sent_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        (stamp, transaction)
    }

    /// Handles a marker answer from the client.
    ///
    /// Returns `true` when `id` belonged to an outstanding marker, in which case the host
    /// should swallow the packet. Unknown ids leave all state untouched.
    pub fn on_acknowledgment(&self, id: i16) -> bool {
        let (acknowledged, skipped) = {
            let mut sent = self.sent.lock();
            if !sent.iter().any(|stamp| stamp.id == id) {
                return false;
            }
            let mut popped = 0u32;
            while let Some(stamp) = sent.pop_front() {
                popped += 1;
                if stamp.id == id {
                    break;
                }
            }
            let acknowledged = self
                .acknowledged
                .fetch_add(popped, Ordering::AcqRel)
                .wrapping_add(popped);
            (acknowledged, popped - 1)
        };

        if skipped > 0 {
            self.report_skipped(id, skipped);
        }

        self.run_ready(acknowledged);
        true
    }

    fn report_skipped(&self, id: i16, skipped: u32) {
        let violation = Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::Transaction,
            format!("acknowledgment {id} passed over {skipped} unanswered markers"),
            concat!(file!(), ":", line!()),
        )
        .with_context("id", id.to_string())
        .with_context("skipped", skipped.to_string());
        report_to_observer(self.observer.read().as_ref(), &violation);
    }

    fn run_ready(&self, acknowledged: u32) {
        let boundary = u64::from(acknowledged) + 1;
        let ready: SmallVec<[DeferredTask; 4]> = {
            let mut deferred = self.deferred.lock();
            let mut ready = SmallVec::new();
            let mut index = 0;
            while index < deferred.len() {
                let transaction = u64::from(deferred[index].transaction);
                if transaction > boundary {
                    break;
                }
                if transaction == boundary {
                    index += 1;
                    continue;
                }
                if let Some(effect) = deferred.remove(index) {
                    ready.push(effect.task);
                }
            }
            ready
        };

        for task in ready {
            task();
        }
    }

    /// Runs `task` once the client has acknowledged `transaction`.
    ///
    /// If it already has, the task runs inline before this returns. Tasks sharing a
    /// transaction run in insertion order.
    pub fn defer_effect(&self, transaction: u32, task: DeferredTask) {
        {
            let mut deferred = self.deferred.lock();
            if self.acknowledged.load(Ordering::Acquire) < transaction {
                deferred.push_back(DeferredEffect { transaction, task });
                return;
            }
        }
        task();
    }

    /// Runs `task` once the client acknowledges the next marker to be sent.
    pub fn defer_to_next_marker(&self, task: DeferredTask) {
        self.defer_effect(self.last_sent().wrapping_add(1), task);
    }

    /// Markers sent so far.
    #[must_use]
    pub fn last_sent(&self) -> u32 {
        self.sent_count.load(Ordering::Acquire)
    }

    /// Markers the client has passed.
    #[must_use]
    pub fn acknowledged(&self) -> u32 {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Markers sent but not yet answered.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.sent.lock().len()
    }

    /// Deferred effects still waiting.
    #[must_use]
    pub fn pending_effects(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Issue time of the oldest unanswered marker, in nanoseconds since the clock was
    /// created.
    #[must_use]
    pub fn oldest_outstanding_nanos(&self) -> Option<u64> {
        self.sent.lock().front().map(|stamp| stamp.issued_at_nanos)
    }
}

impl Default for TransactionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionClock")
            .field("last_sent", &self.last_sent())
            .field("acknowledged", &self.acknowledged())
            .field("outstanding", &self.outstanding())
            .field("pending_effects", &self.pending_effects())
            .finish()
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
    use crate::telemetry::CollectingObserver;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> DeferredTask) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: u32| -> DeferredTask {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(tag))
        };
        (log, make)
    }

    #[test]
    fn marker_ids_count_down_from_zero() {
        let clock = TransactionClock::new();
        let ids: Vec<i16> = (0..4).map(|_| clock.send_marker().id).collect();
        assert_eq!(ids, vec![0, -1, -2, -3]);
        assert_eq!(clock.last_sent(), 4);
        assert_eq!(clock.outstanding(), 4);
    }

    #[test]
    fn marker_ids_wrap_after_the_negative_range() {
        let clock = TransactionClock::new();
        clock.id_counter.store(0x7FFF, Ordering::Relaxed);
        assert_eq!(clock.send_marker().id, -0x7FFF);
        assert_eq!(clock.send_marker().id, 0);
    }

    #[test]
    fn unknown_ids_are_not_ours() {
        let clock = TransactionClock::new();
        clock.send_marker();
        assert!(!clock.on_acknowledgment(42));
        assert_eq!(clock.acknowledged(), 0);
        assert_eq!(clock.outstanding(), 1);
    }

    #[test]
    fn acknowledgment_pops_intervening_markers() {
        let clock = TransactionClock::new();
        let _first = clock.send_marker();
        let _second = clock.send_marker();
        let third = clock.send_marker();

        assert!(clock.on_acknowledgment(third.id));
        assert_eq!(clock.acknowledged(), 3);
        assert_eq!(clock.outstanding(), 0);
    }

    #[test]
    fn skipped_markers_are_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let clock = TransactionClock::new();
        clock.set_observer(observer.clone());
        let first = clock.send_marker();
        let _second = clock.send_marker();
        let _third = clock.send_marker();
        let fourth = clock.send_marker();

        assert!(clock.on_acknowledgment(first.id));
        assert!(observer.is_empty());

        assert!(clock.on_acknowledgment(fourth.id));
        let reported = observer.violations_of_kind(ViolationKind::Transaction);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].severity, ViolationSeverity::Warning);
        assert_eq!(reported[0].context.get("skipped").map(String::as_str), Some("2"));
        assert_eq!(reported[0].context.get("id").map(String::as_str), Some("-3"));
    }

    #[test]
    fn defer_runs_inline_once_acknowledged() {
        let clock = TransactionClock::new();
        let stamp = clock.send_marker();
        clock.on_acknowledgment(stamp.id);

        let (log, task) = recorder();
        clock.defer_effect(1, task(1));
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(clock.pending_effects(), 0);
    }

    #[test]
    fn effect_one_past_the_acknowledgment_waits() {
        let clock = TransactionClock::new();
        let (log, task) = recorder();
        let first = clock.send_marker();
        let second = clock.send_marker();
        clock.defer_effect(1, task(1));
        clock.defer_effect(2, task(2));

        clock.on_acknowledgment(first.id);
        assert_eq!(*log.lock(), vec![1]);

        clock.on_acknowledgment(second.id);
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn boundary_effect_does_not_block_later_ready_effects() {
        let clock = TransactionClock::new();
        let (log, task) = recorder();
        for _ in 0..3 {
            clock.send_marker();
        }
        // queued out of order: the transaction-2 effect sits in front of a ready one
        clock.defer_effect(2, task(2));
        clock.defer_effect(1, task(1));

        assert!(clock.on_acknowledgment(0));
        assert_eq!(clock.acknowledged(), 1);
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(clock.pending_effects(), 1);
    }

    #[test]
    fn walk_stops_past_the_boundary() {
        let clock = TransactionClock::new();
        let (log, task) = recorder();
        let first = clock.send_marker();
        clock.send_marker();
        clock.send_marker();
        clock.defer_effect(3, task(3));
        clock.defer_effect(1, task(1));

        clock.on_acknowledgment(first.id);
        // transaction 3 > 1 + 1 ends the walk before reaching transaction 1
        assert!(log.lock().is_empty());
        assert_eq!(clock.pending_effects(), 2);
    }

    #[test]
    fn shared_transaction_runs_in_insertion_order() {
        let clock = TransactionClock::new();
        let (log, task) = recorder();
        let stamp = clock.send_marker();
        clock.send_marker();
        clock.defer_effect(1, task(10));
        clock.defer_effect(1, task(11));
        clock.defer_effect(1, task(12));

        clock.on_acknowledgment(stamp.id);
        assert_eq!(*log.lock(), vec![10, 11, 12]);
    }

    #[test]
    fn defer_to_next_marker_targets_the_upcoming_transaction() {
        let clock = TransactionClock::new();
        let (log, task) = recorder();
        clock.defer_to_next_marker(task(1));
        let stamp = clock.send_marker();
        assert!(log.lock().is_empty());

        // the effect is exactly one past acknowledged=0 until this ack arrives
        clock.on_acknowledgment(stamp.id);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn tasks_may_reenter_the_clock() {
        let clock = Arc::new(TransactionClock::new());
        let stamp = clock.send_marker();
        let inner = clock.clone();
        let (log, task) = recorder();
        let follow_up = task(2);
        clock.defer_effect(
            1,
            Box::new(move || {
                inner.defer_effect(1, follow_up);
            }),
        );
        clock.on_acknowledgment(stamp.id);
        assert_eq!(*log.lock(), vec![2]);
    }
}
