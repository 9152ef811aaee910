//! Process-local counter storage.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::CounterStorage;
use crate::counter::{CounterOption, Dimensions};
use crate::error::{StorageError, StorageResult};

/// Counter storage backed by guarded in-process maps.
///
/// Counter values and options sit behind separate locks so option reads
/// never wait on increments.
#[derive(Debug, Default)]
pub struct MemoryCounterStorage {
    counters: Mutex<HashMap<String, HashMap<Dimensions, i64>>>,
    options: Mutex<HashMap<(String, Dimensions), Vec<CounterOption>>>,
}

impl MemoryCounterStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStorage for MemoryCounterStorage {
    async fn increase(
        &self,
        counter: &str,
        count: i64,
        max: i64,
        dims: &Dimensions,
    ) -> StorageResult<()> {
        let mut counters = self.counters.lock();
        let values = counters.entry(counter.to_string()).or_default();
        let current = values.get(dims).copied().unwrap_or(0);

        let total = match current.checked_add(count) {
            Some(total) if max <= 0 || total <= max => total,
            _ => {
                trace!(counter, dimensions = %dims, current, count, max, "Rejecting increase");
                return Err(StorageError::QuotaExceeded {
                    counter: counter.to_string(),
                    dimensions: dims.to_string_key(),
                });
            }
        };

        values.insert(dims.clone(), total);
        Ok(())
    }

    async fn delete(&self, counter: &str, dims: &Dimensions) -> StorageResult<()> {
        let mut counters = self.counters.lock();
        if dims.is_empty() {
            counters.remove(counter);
        } else if let Some(values) = counters.get_mut(counter) {
            values.remove(dims);
        }
        Ok(())
    }

    async fn set_value(&self, counter: &str, value: i64, dims: &Dimensions) -> StorageResult<()> {
        let mut counters = self.counters.lock();
        counters
            .entry(counter.to_string())
            .or_default()
            .insert(dims.clone(), value);
        Ok(())
    }

    async fn get_value(&self, counter: &str, dims: &Dimensions) -> StorageResult<Option<i64>> {
        let counters = self.counters.lock();
        Ok(counters
            .get(counter)
            .and_then(|values| values.get(dims))
            .copied())
    }

    async fn get_sum_value(&self, counter: &str, group: &[Dimensions]) -> StorageResult<i64> {
        let counters = self.counters.lock();
        let Some(values) = counters.get(counter) else {
            return Ok(0);
        };
        Ok(group
            .iter()
            .map(|dims| values.get(dims).copied().unwrap_or(0))
            .sum())
    }

    async fn get_options(
        &self,
        counter: &str,
        key: &Dimensions,
    ) -> StorageResult<Option<Vec<CounterOption>>> {
        let options = self.options.lock();
        Ok(options.get(&(counter.to_string(), key.clone())).cloned())
    }

    async fn set_options(
        &self,
        counter: &str,
        key: &Dimensions,
        opts: &[CounterOption],
    ) -> StorageResult<()> {
        if opts.is_empty() {
            return Ok(());
        }
        let mut options = self.options.lock();
        options.insert((counter.to_string(), key.clone()), opts.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn dims(tokens: &[&str]) -> Dimensions {
        Dimensions::from(tokens)
    }

    #[tokio::test]
    async fn test_increase_and_get_value() {
        let storage = MemoryCounterStorage::new();
        let key = dims(&["shoes", "oid-001"]);

        assert_eq!(storage.get_value("test", &key).await.unwrap(), None);

        storage.increase("test", 3, 0, &key).await.unwrap();
        storage.increase("test", 4, 0, &key).await.unwrap();

        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(7));
        assert_eq!(storage.get_value("other", &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bounded_increase_is_all_or_nothing() {
        let storage = MemoryCounterStorage::new();
        let key = dims(&["a"]);

        storage.increase("test", 8, 10, &key).await.unwrap();

        let err = storage.increase("test", 3, 10, &key).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(8));

        // exactly at the ceiling is allowed
        storage.increase("test", 2, 10, &key).await.unwrap();
        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_increase_that_would_overflow_is_rejected() {
        let storage = MemoryCounterStorage::new();
        let key = dims(&["a"]);

        storage.increase("test", 5, 10, &key).await.unwrap();
        let err = storage.increase("test", i64::MAX, 10, &key).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(5));

        // unbounded increases cannot wrap either
        storage.set_value("test", i64::MAX - 1, &key).await.unwrap();
        let err = storage.increase("test", 2, 0, &key).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(i64::MAX - 1));
    }

    #[tokio::test]
    async fn test_delete_single_key_and_namespace() {
        let storage = MemoryCounterStorage::new();
        storage.set_value("test", 1, &dims(&["a"])).await.unwrap();
        storage.set_value("test", 2, &dims(&["b"])).await.unwrap();

        storage.delete("test", &dims(&["a"])).await.unwrap();
        assert_eq!(storage.get_value("test", &dims(&["a"])).await.unwrap(), None);
        assert_eq!(storage.get_value("test", &dims(&["b"])).await.unwrap(), Some(2));

        storage.delete("test", &Dimensions::empty()).await.unwrap();
        assert_eq!(storage.get_value("test", &dims(&["b"])).await.unwrap(), None);

        // idempotent
        storage.delete("test", &dims(&["a"])).await.unwrap();
        storage.delete("missing", &Dimensions::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_sum_value_treats_missing_as_zero() {
        let storage = MemoryCounterStorage::new();
        storage.set_value("qps", 3, &dims(&["k", "0"])).await.unwrap();
        storage.set_value("qps", 5, &dims(&["k", "1"])).await.unwrap();

        let group = vec![dims(&["k", "0"]), dims(&["k", "1"]), dims(&["k", "2"])];
        assert_eq!(storage.get_sum_value("qps", &group).await.unwrap(), 8);
        assert_eq!(storage.get_sum_value("none", &group).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_options_round_trip() {
        let storage = MemoryCounterStorage::new();
        let key = dims(&["shoes"]);

        assert_eq!(storage.get_options("test", &key).await.unwrap(), None);

        let opts = vec![CounterOption::limit_quota(10), CounterOption::limit_qps(2)];
        storage.set_options("test", &key, &opts).await.unwrap();
        assert_eq!(storage.get_options("test", &key).await.unwrap(), Some(opts.clone()));

        // empty set leaves the stored options alone
        storage.set_options("test", &key, &[]).await.unwrap();
        assert_eq!(storage.get_options("test", &key).await.unwrap(), Some(opts));
    }

    #[tokio::test]
    async fn test_concurrent_bounded_increase_never_overshoots() {
        let storage = Arc::new(MemoryCounterStorage::new());
        let key = dims(&["hot"]);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let storage = storage.clone();
                let key = key.clone();
                tokio::spawn(async move { storage.increase("test", 1, 20, &key).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 20);
        assert_eq!(storage.get_value("test", &key).await.unwrap(), Some(20));
    }
}
