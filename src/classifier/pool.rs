//! Reusable buffers for window snapshots and their encoded payloads.
//!
//! Each dispatch copies the window into a snapshot that travels to the worker doing the
//! request, and the worker encodes it into a payload buffer. Both come from a
//! [`SnapshotPool`] and go back to it when their guards drop, so a busy server settles
//! into a fixed set of allocations shared by every worker.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sampler::TickFeature;

/// Snapshots kept per pool before extras are freed.
pub const DEFAULT_POOL_LIMIT: usize = 64;

#[derive(Debug)]
struct PoolInner {
    snapshots: Mutex<Vec<Vec<TickFeature>>>,
    payloads: Mutex<Vec<Vec<u8>>>,
    limit: usize,
}

impl PoolInner {
    fn give_back<T>(idle: &Mutex<Vec<Vec<T>>>, limit: usize, mut buffer: Vec<T>) {
        buffer.clear();
        let mut idle = idle.lock();
        if idle.len() < limit {
            idle.push(buffer);
        }
    }
}

/// A shared pool of snapshot buffers.
#[derive(Debug, Clone)]
pub struct SnapshotPool {
    inner: Arc<PoolInner>,
}

impl SnapshotPool {
    /// A pool holding at most `limit` idle snapshots.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                snapshots: Mutex::new(Vec::new()),
                payloads: Mutex::new(Vec::new()),
                limit,
            }),
        }
    }

    /// Takes an empty snapshot buffer.
    #[must_use]
    pub fn snapshot(&self) -> PooledSnapshot {
        let ticks = self.inner.snapshots.lock().pop().unwrap_or_default();
        PooledSnapshot {
            ticks,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Takes an empty payload buffer.
    #[must_use]
    pub fn payload(&self) -> PooledPayload {
        let bytes = self.inner.payloads.lock().pop().unwrap_or_default();
        PooledPayload {
            bytes,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Idle snapshot buffers.
    #[must_use]
    pub fn idle_snapshots(&self) -> usize {
        self.inner.snapshots.lock().len()
    }

    /// Idle payload buffers.
    #[must_use]
    pub fn idle_payloads(&self) -> usize {
        self.inner.payloads.lock().len()
    }
}

impl Default for SnapshotPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_LIMIT)
    }
}

/// A snapshot buffer on loan from a [`SnapshotPool`].
#[derive(Debug)]
pub struct PooledSnapshot {
    ticks: Vec<TickFeature>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSnapshot {
    type Target = Vec<TickFeature>;

    fn deref(&self) -> &Self::Target {
        &self.ticks
    }
}

impl DerefMut for PooledSnapshot {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ticks
    }
}

impl Drop for PooledSnapshot {
    fn drop(&mut self) {
        let ticks = std::mem::take(&mut self.ticks);
        PoolInner::give_back(&self.pool.snapshots, self.pool.limit, ticks);
    }
}

/// An encoded window on its way to the endpoint.
///
/// Payloads taken from a [`SnapshotPool`] return to it on drop. Payloads built from a
/// plain `Vec<u8>` are simply freed.
#[derive(Debug)]
pub struct PooledPayload {
    bytes: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl From<Vec<u8>> for PooledPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes, pool: None }
    }
}

impl Deref for PooledPayload {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PooledPayload {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl Drop for PooledPayload {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let bytes = std::mem::take(&mut self.bytes);
            PoolInner::give_back(&pool.payloads, pool.limit, bytes);
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

    #[test]
    fn buffers_return_empty_with_capacity() {
        let pool = SnapshotPool::new(4);
        {
            let mut snapshot = pool.snapshot();
            snapshot.extend(std::iter::repeat(TickFeature::default()).take(40));
        }
        assert_eq!(pool.idle_snapshots(), 1);

        let snapshot = pool.snapshot();
        assert!(snapshot.is_empty());
        assert!(snapshot.capacity() >= 40);
        assert_eq!(pool.idle_snapshots(), 0);
    }

    #[test]
    fn payloads_return_empty_with_capacity() {
        let pool = SnapshotPool::new(4);
        {
            let mut payload = pool.payload();
            payload.extend_from_slice(&[0u8; 264]);
        }
        assert_eq!(pool.idle_payloads(), 1);

        let payload = pool.payload();
        assert!(payload.is_empty());
        assert!(payload.capacity() >= 264);
        assert_eq!(pool.idle_payloads(), 0);
    }

    #[test]
    fn detached_payloads_skip_the_pool() {
        let pool = SnapshotPool::new(4);
        let payload = PooledPayload::from(vec![1, 2, 3]);
        assert_eq!(payload.as_slice(), &[1, 2, 3]);
        drop(payload);
        assert_eq!(pool.idle_payloads(), 0);
    }

    #[test]
    fn idle_buffers_are_capped() {
        let pool = SnapshotPool::new(2);
        let loans: Vec<_> = (0..5).map(|_| pool.snapshot()).collect();
        drop(loans);
        assert_eq!(pool.idle_snapshots(), 2);
    }

    #[test]
    fn clones_share_buffers() {
        let pool = SnapshotPool::default();
        let other = pool.clone();
        drop(pool.snapshot());
        assert_eq!(other.idle_snapshots(), 1);
    }

    #[test]
    fn loans_move_across_threads() {
        let pool = SnapshotPool::new(8);
        let mut snapshot = pool.snapshot();
        snapshot.push(TickFeature::default());
        std::thread::spawn(move || assert_eq!(snapshot.len(), 1))
            .join()
            .unwrap();
        assert_eq!(pool.idle_snapshots(), 1);
    }
}
