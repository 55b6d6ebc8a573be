//! Execution contexts the pipeline hands work to.
//!
//! The host owns a single "main" context where per-connection classifier state is
//! mutated, plus a pool for blocking or slow work. [`Scheduler`] is the seam: the
//! classifier dispatches requests with [`run_async`](Scheduler::run_async) and resumes
//! their outcome with [`run_on_main_now`](Scheduler::run_on_main_now).
//!
//! [`TokioScheduler`] is the bundled implementation. Async work runs on a tokio runtime;
//! main-context work is queued on a [`MainQueue`] that the host drains from its own
//! loop (once per server tick, typically).
//!
//! ```
//! use aimwatch::scheduler::{MainQueue, Scheduler, TokioScheduler};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
//! let main = Arc::new(MainQueue::new());
//! let scheduler = TokioScheduler::new(runtime.handle().clone(), Arc::clone(&main));
//!
//! let ran = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&ran);
//! scheduler.run_on_main_now(Box::new(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! assert_eq!(main.drain(), 1);
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use web_time::Duration;

/// Work for the main context.
pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Work the main context runs once per period.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Work for the async pool.
pub type AsyncTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Cancels a delayed or repeating task.
///
/// Cancelling is best effort: a run already queued on the main context is skipped, a run
/// already executing finishes.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Creates a live handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops future runs.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Where the pipeline schedules its work.
pub trait Scheduler: Send + Sync {
    /// Queues `task` on the main context.
    fn run_on_main_now(&self, task: MainTask);

    /// Queues `task` on the main context after `delay`.
    fn run_on_main_later(&self, delay: Duration, task: MainTask) -> TaskHandle;

    /// Runs `task` on the main context after `delay`, then every `period`.
    fn run_on_main_repeating(
        &self,
        delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle;

    /// Runs `task` off the main context.
    fn run_async(&self, task: AsyncTask);
}

/// Main-context tasks waiting for the host to run them.
#[derive(Default)]
pub struct MainQueue {
    tasks: Mutex<VecDeque<MainTask>>,
}

impl MainQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task.
    pub fn push(&self, task: MainTask) {
        self.tasks.lock().push_back(task);
    }

    /// Tasks waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Runs every task queued so far, in order, and returns how many ran.
    ///
    /// Tasks queued while draining wait for the next call.
    pub fn drain(&self) -> usize {
        let batch = std::mem::take(&mut *self.tasks.lock());
        let count = batch.len();
        for task in batch {
            task();
        }
        count
    }
}

impl std::fmt::Debug for MainQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainQueue")
            .field("queued", &self.len())
            .finish()
    }
}

/// A [`Scheduler`] backed by a tokio runtime and a host-drained [`MainQueue`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    main: Arc<MainQueue>,
}

impl TokioScheduler {
    /// Schedules async work on `handle` and main work on `main`.
    #[must_use]
    pub fn new(handle: Handle, main: Arc<MainQueue>) -> Self {
        Self { handle, main }
    }

    /// Uses the runtime the caller is running inside, if any.
    #[must_use]
    pub fn try_current(main: Arc<MainQueue>) -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self::new(handle, main))
    }

    /// The queue main-context work lands on.
    #[must_use]
    pub fn main_queue(&self) -> &Arc<MainQueue> {
        &self.main
    }
}

impl Scheduler for TokioScheduler {
    fn run_on_main_now(&self, task: MainTask) {
        self.main.push(task);
    }

    fn run_on_main_later(&self, delay: Duration, task: MainTask) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancelled = handle.clone();
        let main = Arc::clone(&self.main);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if cancelled.is_cancelled() {
                return;
            }
            main.push(Box::new(move || {
                if !cancelled.is_cancelled() {
                    task();
                }
            }));
        });
        handle
    }

    fn run_on_main_repeating(
        &self,
        delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancelled = handle.clone();
        let main = Arc::clone(&self.main);
        let task = Arc::new(Mutex::new(task));
        // tokio rejects a zero period
        let period = period.max(Duration::from_millis(1));
        self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if cancelled.is_cancelled() {
                    break;
                }
                let task = Arc::clone(&task);
                let cancelled = cancelled.clone();
                main.push(Box::new(move || {
                    if !cancelled.is_cancelled() {
                        let mut run = task.lock();
                        (*run)();
                    }
                }));
            }
        });
        handle
    }

    fn run_async(&self, task: AsyncTask) {
        self.handle.spawn(task);
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
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Arc<AtomicUsize>, impl Fn() -> MainTask) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        (count, move || {
            let shared = Arc::clone(&shared);
            Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn scheduler() -> (TokioScheduler, Arc<MainQueue>) {
        let main = Arc::new(MainQueue::new());
        let scheduler = TokioScheduler::try_current(Arc::clone(&main)).unwrap();
        (scheduler, main)
    }

    async fn advance(by: Duration) {
        tokio::time::sleep(by).await;
        // let spawned timers push before the caller drains
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn drain_runs_in_order_and_defers_new_work() {
        let main = Arc::new(MainQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            let requeue = Arc::clone(&main);
            main.push(Box::new(move || {
                order.lock().push(i);
                if i == 0 {
                    requeue.push(Box::new(|| {}));
                }
            }));
        }

        assert_eq!(main.drain(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(main.len(), 1);
        assert_eq!(main.drain(), 1);
        assert!(main.is_empty());
    }

    #[test]
    fn try_current_outside_a_runtime_is_none() {
        assert!(TokioScheduler::try_current(Arc::new(MainQueue::new())).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn later_waits_for_the_delay() {
        let (scheduler, main) = scheduler();
        let (count, task) = counting();
        let _handle = scheduler.run_on_main_later(Duration::from_secs(2), task());

        advance(Duration::from_secs(1)).await;
        assert_eq!(main.drain(), 0);
        advance(Duration::from_secs(2)).await;
        assert_eq!(main.drain(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_later_never_runs() {
        let (scheduler, main) = scheduler();
        let (count, task) = counting();
        let handle = scheduler.run_on_main_later(Duration::from_secs(1), task());
        handle.cancel();

        advance(Duration::from_secs(2)).await;
        main.drain();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_runs_each_period_until_cancelled() {
        let (scheduler, main) = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let handle = scheduler.run_on_main_repeating(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            }),
        );

        advance(Duration::from_millis(3500)).await;
        main.drain();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        advance(Duration::from_secs(3)).await;
        main.drain();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn async_work_can_resume_on_main() {
        let (scheduler, main) = scheduler();
        let (count, task) = counting();
        let resume = Arc::new(scheduler.clone());
        let task = task();
        scheduler.run_async(Box::pin(async move {
            resume.run_on_main_now(task);
        }));

        for _ in 0..8 {
            tokio::task::yield_now().await;
            if main.drain() > 0 {
                break;
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
