//! Rotating per-second buckets used to estimate consumption speed.
//!
//! Each dimension key owns [`RATE_BUCKETS`] buckets indexed by the wall-clock
//! second modulo the bucket count. On every sync pass the current bucket
//! receives the pending count and the next one is zeroed, so one bucket is
//! always being prepared and only the remaining ones are settled seconds.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::dimensions::Dimensions;
use crate::storage::CounterStorage;

/// Number of rotating buckets per dimension key.
pub const RATE_BUCKETS: u64 = 5;

/// Buckets that represent complete seconds at any point in time.
pub const SETTLED_BUCKETS: i64 = RATE_BUCKETS as i64 - 1;

/// Bucket written during `second`.
pub fn bucket_index(second: u64) -> u64 {
    second % RATE_BUCKETS
}

/// Bucket zeroed during `second`, ahead of its reuse.
pub fn next_bucket_index(second: u64) -> u64 {
    (second + 1) % RATE_BUCKETS
}

/// Storage dimensions for one bucket of `dims`.
pub fn bucket_dimensions(dims: &Dimensions, index: u64) -> Dimensions {
    dims.child(index.to_string())
}

/// Storage dimensions for all buckets of `dims`.
pub fn bucket_group(dims: &Dimensions) -> Vec<Dimensions> {
    (0..RATE_BUCKETS).map(|i| bucket_dimensions(dims, i)).collect()
}

/// Average units per second from the sum over all buckets.
pub fn estimate_speed(bucket_sum: i64) -> i64 {
    bucket_sum / SETTLED_BUCKETS
}

/// Per-process accumulator of un-flushed consumption, by dimension key.
///
/// Keys stay registered across drains so their estimate keeps being refreshed
/// after traffic stops, until [`evict_idle`](Self::evict_idle) drops them.
#[derive(Debug, Default)]
pub struct PendingCounts {
    counts: Mutex<HashMap<Dimensions, i64>>,
}

impl PendingCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` to the pending total for `dims`, registering it if unseen.
    pub fn record(&self, dims: &Dimensions, count: i64) {
        let mut counts = self.counts.lock();
        match counts.get_mut(dims) {
            Some(pending) => *pending = pending.saturating_add(count),
            None => {
                counts.insert(dims.clone(), count);
            }
        }
    }

    /// Take every pending count, leaving the keys registered at zero.
    pub fn drain(&self) -> Vec<(Dimensions, i64)> {
        let mut counts = self.counts.lock();
        counts
            .iter_mut()
            .map(|(dims, pending)| (dims.clone(), std::mem::take(pending)))
            .collect()
    }

    pub fn pending(&self, dims: &Dimensions) -> Option<i64> {
        self.counts.lock().get(dims).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    /// Unregister `dims` if nothing was recorded for it since the last drain.
    pub fn evict_idle(&self, dims: &Dimensions) -> bool {
        let mut counts = self.counts.lock();
        match counts.get(dims).copied() {
            Some(0) => {
                counts.remove(dims);
                true
            }
            _ => false,
        }
    }
}

/// Flushes pending counts into storage buckets and caches the resulting speed.
///
/// Shared between a [`RateCounter`](super::RateCounter) and its background
/// sync task; the task is the only writer of `speeds`.
pub struct RateTracker {
    counter: String,
    storage: Arc<dyn CounterStorage>,
    pending: PendingCounts,
    speeds: DashMap<Dimensions, i64>,
}

impl RateTracker {
    /// `counter` is the storage counter name holding the buckets.
    pub fn new(counter: impl Into<String>, storage: Arc<dyn CounterStorage>) -> Self {
        Self {
            counter: counter.into(),
            storage,
            pending: PendingCounts::new(),
            speeds: DashMap::new(),
        }
    }

    /// Buffer `count` units for `dims`. Never touches storage.
    pub fn record(&self, dims: &Dimensions, count: i64) {
        self.pending.record(dims, count);
    }

    /// Last computed speed for `dims`, 0 if none yet.
    pub fn speed(&self, dims: &Dimensions) -> i64 {
        self.speeds.get(dims).map(|speed| *speed).unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.pending.len()
    }

    /// Run one aggregation pass as of wall-clock `second`.
    ///
    /// A key with nothing pending whose buckets all read zero is dropped
    /// from the tracker; its next recorded call registers it again.
    pub async fn sync_at(&self, second: u64) {
        let index = bucket_index(second);
        let next = next_bucket_index(second);

        for (dims, count) in self.pending.drain() {
            if count != 0 {
                let bucket = bucket_dimensions(&dims, index);
                if let Err(e) = self.storage.increase(&self.counter, count, 0, &bucket).await {
                    warn!(
                        counter = %self.counter,
                        dimensions = %dims,
                        error = %e,
                        "Failed to flush rate bucket"
                    );
                    self.pending.record(&dims, count);
                }
            }

            let next_bucket = bucket_dimensions(&dims, next);
            if let Err(e) = self.storage.set_value(&self.counter, 0, &next_bucket).await {
                warn!(
                    counter = %self.counter,
                    dimensions = %dims,
                    error = %e,
                    "Failed to reset next rate bucket"
                );
            }

            match self.storage.get_sum_value(&self.counter, &bucket_group(&dims)).await {
                Ok(0) if count == 0 && self.pending.evict_idle(&dims) => {
                    trace!(counter = %self.counter, dimensions = %dims, "Idle key evicted");
                    self.speeds.remove(&dims);
                }
                Ok(sum) => {
                    let speed = estimate_speed(sum);
                    trace!(counter = %self.counter, dimensions = %dims, sum, speed, "Rate refreshed");
                    self.speeds.insert(dims, speed);
                }
                Err(e) => {
                    warn!(
                        counter = %self.counter,
                        dimensions = %dims,
                        error = %e,
                        "Failed to read rate buckets"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::counter::CounterOption;
    use crate::error::{StorageError, StorageResult};
    use crate::storage::MemoryCounterStorage;

    #[test]
    fn test_bucket_rotation() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(7), 2);
        assert_eq!(next_bucket_index(7), 3);
        assert_eq!(next_bucket_index(4), 0);
    }

    #[test]
    fn test_bucket_group() {
        let group = bucket_group(&Dimensions::from(["shoes", "oid-001"]));

        assert_eq!(group.len(), 5);
        assert_eq!(group[0].to_string_key(), "shoes:oid-001:0");
        assert_eq!(group[4].to_string_key(), "shoes:oid-001:4");
    }

    #[test]
    fn test_estimate_uses_settled_buckets() {
        // [3, 5, 2, 0, 0]
        assert_eq!(estimate_speed(10), 2);
        assert_eq!(estimate_speed(3), 0);
        assert_eq!(estimate_speed(400), 100);
    }

    #[test]
    fn test_pending_counts_drain() {
        let pending = PendingCounts::new();
        let dims = Dimensions::from(["a"]);

        pending.record(&dims, 2);
        pending.record(&dims, 3);
        pending.record(&Dimensions::empty(), 0);

        let mut drained = pending.drain();
        drained.sort();
        assert_eq!(drained, vec![(Dimensions::empty(), 0), (dims.clone(), 5)]);

        // keys stay registered at zero
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.pending(&dims), Some(0));
    }

    #[tokio::test]
    async fn test_sync_flushes_and_prezeroes() {
        let storage = Arc::new(MemoryCounterStorage::new());
        let tracker = RateTracker::new("_qps_:test", storage.clone());
        let dims = Dimensions::from(["k"]);

        storage.set_value("_qps_:test", 9, &dims.child("3")).await.unwrap();
        tracker.record(&dims, 8);
        tracker.sync_at(12).await;

        // second 12 writes bucket 2 and clears bucket 3
        assert_eq!(storage.get_value("_qps_:test", &dims.child("2")).await.unwrap(), Some(8));
        assert_eq!(storage.get_value("_qps_:test", &dims.child("3")).await.unwrap(), Some(0));
        assert_eq!(tracker.speed(&dims), 2);
        assert_eq!(tracker.pending.pending(&dims), Some(0));
    }

    #[tokio::test]
    async fn test_speed_decays_as_buckets_rotate() {
        let storage = Arc::new(MemoryCounterStorage::new());
        let tracker = RateTracker::new("_qps_:test", storage);
        let dims = Dimensions::from(["k"]);

        tracker.record(&dims, 40);
        tracker.sync_at(0).await;
        assert_eq!(tracker.speed(&dims), 10);

        for second in 1..=4 {
            tracker.sync_at(second).await;
        }
        // bucket 0 was cleared during second 4, so the key is idle and dropped
        assert_eq!(tracker.speed(&dims), 0);
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_idle_keys_are_evicted() {
        let storage = Arc::new(MemoryCounterStorage::new());
        let tracker = RateTracker::new("_qps_:test", storage);
        let busy = Dimensions::from(["shoes", "busy"]);

        for i in 0..1000 {
            tracker.record(&Dimensions::from(vec!["shoes".to_string(), format!("oid-{}", i)]), 0);
        }
        tracker.record(&busy, 4);
        assert_eq!(tracker.tracked_keys(), 1001);

        tracker.sync_at(0).await;
        assert_eq!(tracker.tracked_keys(), 1);
        assert_eq!(tracker.speed(&busy), 1);

        // the busy key is kept until its buckets have rotated out
        for second in 1..=3 {
            tracker.sync_at(second).await;
            assert_eq!(tracker.tracked_keys(), 1);
        }
        tracker.sync_at(4).await;
        assert_eq!(tracker.tracked_keys(), 0);
        assert_eq!(tracker.speed(&busy), 0);
    }

    #[test]
    fn test_evict_idle_keeps_pending_keys() {
        let pending = PendingCounts::new();
        let dims = Dimensions::from(["a"]);

        pending.record(&dims, 3);
        assert!(!pending.evict_idle(&dims));
        pending.drain();
        assert!(pending.evict_idle(&dims));
        assert_eq!(pending.pending(&dims), None);
        assert!(!pending.evict_idle(&dims));
    }

    /// Memory storage whose next `increase` fails.
    struct FailNextIncrease {
        inner: MemoryCounterStorage,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CounterStorage for FailNextIncrease {
        async fn increase(&self, c: &str, n: i64, m: i64, d: &Dimensions) -> StorageResult<()> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(StorageError::RetriesExhausted {
                    key: c.to_string(),
                    attempts: 1,
                    last_error: None,
                });
            }
            self.inner.increase(c, n, m, d).await
        }
        async fn delete(&self, c: &str, d: &Dimensions) -> StorageResult<()> {
            self.inner.delete(c, d).await
        }
        async fn set_value(&self, c: &str, v: i64, d: &Dimensions) -> StorageResult<()> {
            self.inner.set_value(c, v, d).await
        }
        async fn get_value(&self, c: &str, d: &Dimensions) -> StorageResult<Option<i64>> {
            self.inner.get_value(c, d).await
        }
        async fn get_sum_value(&self, c: &str, g: &[Dimensions]) -> StorageResult<i64> {
            self.inner.get_sum_value(c, g).await
        }
        async fn get_options(&self, c: &str, k: &Dimensions) -> StorageResult<Option<Vec<CounterOption>>> {
            self.inner.get_options(c, k).await
        }
        async fn set_options(&self, c: &str, k: &Dimensions, o: &[CounterOption]) -> StorageResult<()> {
            self.inner.set_options(c, k, o).await
        }
    }

    #[tokio::test]
    async fn test_failed_flush_is_requeued() {
        let storage = Arc::new(FailNextIncrease {
            inner: MemoryCounterStorage::new(),
            fail: AtomicBool::new(true),
        });
        let tracker = RateTracker::new("_qps_:test", storage.clone());
        let dims = Dimensions::from(["k"]);

        storage.set_value("_qps_:test", 9, &dims.child("3")).await.unwrap();
        tracker.record(&dims, 8);
        tracker.sync_at(12).await;

        // nothing landed, but the count is back and the pass still rotated
        assert_eq!(tracker.pending.pending(&dims), Some(8));
        assert_eq!(storage.get_value("_qps_:test", &dims.child("2")).await.unwrap(), None);
        assert_eq!(storage.get_value("_qps_:test", &dims.child("3")).await.unwrap(), Some(0));
        assert_eq!(tracker.speed(&dims), 0);
        assert_eq!(tracker.tracked_keys(), 1);

        tracker.sync_at(13).await;
        assert_eq!(storage.get_value("_qps_:test", &dims.child("3")).await.unwrap(), Some(8));
        assert_eq!(tracker.pending.pending(&dims), Some(0));
        assert_eq!(tracker.speed(&dims), 2);
    }

    #[tokio::test]
    async fn test_unknown_key_has_zero_speed() {
        let tracker = RateTracker::new("_qps_:test", Arc::new(MemoryCounterStorage::new()));
        assert_eq!(tracker.speed(&Dimensions::from(["nobody"])), 0);
    }
}
