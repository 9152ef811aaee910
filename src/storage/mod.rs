//! Counter storage contract and its backends.

mod memory;
mod redis;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use memory::MemoryCounterStorage;
pub use redis::RedisCounterStorage;
pub use retry::{RetryExhausted, RetryPolicy};

use crate::config::StorageConfig;
use crate::counter::{CounterOption, Dimensions};
use crate::error::StorageResult;

/// Trait for counter storage backends.
///
/// Dimension keys are opaque to implementations. Nothing above this trait
/// knows whether the state is process-local or shared.
#[async_trait]
pub trait CounterStorage: Send + Sync {
    /// Atomically add `count` to the value of `(counter, dims)`.
    ///
    /// When `max > 0` and the result would exceed `max`, nothing is applied
    /// and [`StorageError::QuotaExceeded`](crate::error::StorageError::QuotaExceeded)
    /// is returned.
    async fn increase(
        &self,
        counter: &str,
        count: i64,
        max: i64,
        dims: &Dimensions,
    ) -> StorageResult<()>;

    /// Remove the value for `dims`, or the whole counter when `dims` is empty.
    ///
    /// Missing keys are not an error.
    async fn delete(&self, counter: &str, dims: &Dimensions) -> StorageResult<()>;

    /// Unconditionally overwrite the value for `dims`.
    async fn set_value(&self, counter: &str, value: i64, dims: &Dimensions) -> StorageResult<()>;

    /// Read the value for `dims`; `None` when it was never written.
    async fn get_value(&self, counter: &str, dims: &Dimensions) -> StorageResult<Option<i64>>;

    /// Sum the values of several keys. Missing keys count as zero.
    async fn get_sum_value(&self, counter: &str, group: &[Dimensions]) -> StorageResult<i64>;

    /// Read the options stored for `(counter, key)`.
    async fn get_options(
        &self,
        counter: &str,
        key: &Dimensions,
    ) -> StorageResult<Option<Vec<CounterOption>>>;

    /// Replace the options stored for `(counter, key)`. An empty set is a no-op.
    async fn set_options(
        &self,
        counter: &str,
        key: &Dimensions,
        opts: &[CounterOption],
    ) -> StorageResult<()>;
}

/// Whether adding `count` to `current` lands above `max`.
///
/// A sum that does not fit in an `i64` is over any ceiling.
pub(crate) fn exceeds_ceiling(current: i64, count: i64, max: i64) -> bool {
    current.checked_add(count).map_or(true, |total| total > max)
}

/// Build the backend selected by `config`.
pub fn connect(config: &StorageConfig) -> StorageResult<Arc<dyn CounterStorage>> {
    match config {
        StorageConfig::Memory => {
            info!("Using in-memory counter storage");
            Ok(Arc::new(MemoryCounterStorage::new()))
        }
        StorageConfig::Redis(redis_config) => {
            Ok(Arc::new(RedisCounterStorage::new(redis_config.clone())?))
        }
    }
}
