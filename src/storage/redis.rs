//! Counter storage shared through Redis.
//!
//! Keys are laid out under the configured prefix as
//! `<prefix>:<counter>:<dims>` for values and
//! `<prefix>:_config_:<counter>:<dims>` for options. The rate counter
//! namespaces its own counter names (`_counter_:<name>`, `_qps_:<name>`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::{exceeds_ceiling, CounterStorage};
use crate::config::RedisStorageConfig;
use crate::counter::{CounterOption, Dimensions, DIMENSION_SEPARATOR};
use crate::error::{StorageError, StorageResult};

const CONFIG_NAMESPACE: &str = "_config_";
const SCAN_BATCH: usize = 100;

/// Outcome of one optimistic bounded-increase attempt that did not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundedIncrease {
    Applied,
    OverCeiling,
}

/// Counter storage over a pooled Redis client.
///
/// Each operation checks out one connection for its duration. Bounded
/// increases use WATCH/MULTI/EXEC when `transaction` is enabled and are
/// retried according to `consistent_retry`.
pub struct RedisCounterStorage {
    config: RedisStorageConfig,
    pool: Pool,
    retry: RetryPolicy,
    reaper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RedisCounterStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStorage")
            .field("address", &self.config.address)
            .field("db", &self.config.db)
            .field("prefix", &self.config.prefix)
            .field("transaction", &self.config.transaction)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RedisCounterStorage {
    /// Create the storage and its connection pool.
    ///
    /// Connections are opened lazily. When called inside a tokio runtime an
    /// idle-connection reaper is spawned for the lifetime of the storage.
    pub fn new(config: RedisStorageConfig) -> StorageResult<Self> {
        let mut pool_config = Config::from_url(config.connection_url());
        pool_config.pool = Some(PoolConfig::new(config.max_active()));
        let pool = pool_config.create_pool(Some(Runtime::Tokio1))?;

        let retry = RetryPolicy::new(config.consistent_retry, config.retry_backoff());

        let reaper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            handle.spawn(reap_idle_connections(
                pool.clone(),
                config.idle_timeout(),
                config.max_idle(),
            ))
        });

        info!(
            address = %config.address,
            db = config.db,
            max_active = config.max_active(),
            transaction = config.transaction,
            consistent_retry = config.consistent_retry,
            "Redis counter storage initialized"
        );

        Ok(Self {
            config,
            pool,
            retry,
            reaper,
        })
    }

    async fn connection(&self) -> StorageResult<Connection> {
        Ok(self.pool.get().await?)
    }

    fn namespaced(&self, parts: &[&str]) -> String {
        let mut key = String::new();
        if !self.config.prefix.is_empty() {
            key.push_str(&self.config.prefix);
        }
        for part in parts {
            if !key.is_empty() {
                key.push_str(DIMENSION_SEPARATOR);
            }
            key.push_str(part);
        }
        key
    }

    /// `<prefix>:<counter>` for the empty key, `<prefix>:<counter>:<dims>` otherwise.
    fn value_key(&self, counter: &str, dims: &Dimensions) -> String {
        if dims.is_empty() {
            self.namespaced(&[counter])
        } else {
            self.namespaced(&[counter, &dims.to_string_key()])
        }
    }

    fn options_key(&self, counter: &str, key: &Dimensions) -> String {
        if key.is_empty() {
            self.namespaced(&[CONFIG_NAMESPACE, counter])
        } else {
            self.namespaced(&[CONFIG_NAMESPACE, counter, &key.to_string_key()])
        }
    }

    /// One WATCH / GET / check / MULTI-SET-EXEC round on a fresh connection.
    ///
    /// `Ok(None)` means the watched key changed and EXEC was aborted.
    async fn try_bounded_increase(
        &self,
        key: &str,
        count: i64,
        max: i64,
    ) -> StorageResult<Option<BoundedIncrease>> {
        let mut conn = self.connection().await?;

        let _: () = redis::cmd("WATCH").arg(key).query_async(&mut conn).await?;

        let current: Option<i64> = match conn.get(key).await {
            Ok(current) => current,
            Err(e) => {
                unwatch(&mut conn).await;
                return Err(e.into());
            }
        };
        let current = current.unwrap_or(0);

        if exceeds_ceiling(current, count, max) {
            unwatch(&mut conn).await;
            return Ok(Some(BoundedIncrease::OverCeiling));
        }

        let committed: Option<(i64,)> = redis::pipe()
            .atomic()
            .set(key, current + count)
            .ignore()
            .get(key)
            .query_async(&mut conn)
            .await?;

        Ok(committed.map(|_| BoundedIncrease::Applied))
    }

    async fn scan_keys(&self, conn: &mut Connection, pattern: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

impl Drop for RedisCounterStorage {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Escape the characters SCAN MATCH treats as glob syntax.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

async fn unwatch(conn: &mut Connection) {
    let result: redis::RedisResult<()> = redis::cmd("UNWATCH").query_async(conn).await;
    if let Err(e) = result {
        debug!(error = %e, "UNWATCH failed");
    }
}

/// Periodically drop connections idle past `idle_timeout`, keeping at most `max_idle`.
async fn reap_idle_connections(pool: Pool, idle_timeout: Duration, max_idle: usize) {
    let mut interval = tokio::time::interval(idle_timeout);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let kept = AtomicUsize::new(0);
        pool.retain(|_, metrics| {
            metrics.last_used() < idle_timeout && kept.fetch_add(1, Ordering::Relaxed) < max_idle
        });
    }
}

#[async_trait]
impl CounterStorage for RedisCounterStorage {
    async fn increase(
        &self,
        counter: &str,
        count: i64,
        max: i64,
        dims: &Dimensions,
    ) -> StorageResult<()> {
        let key = self.value_key(counter, dims);

        if max <= 0 || !self.config.transaction {
            let mut conn = self.connection().await?;
            let _: i64 = conn.incr(&key, count).await?;
            return Ok(());
        }

        let outcome = self
            .retry
            .run(|_| self.try_bounded_increase(&key, count, max))
            .await
            .map_err(|exhausted| {
                warn!(
                    key = %key,
                    attempts = exhausted.attempts,
                    "Bounded increase gave up"
                );
                StorageError::RetriesExhausted {
                    key: key.clone(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error.map(Box::new),
                }
            })?;

        match outcome {
            BoundedIncrease::Applied => Ok(()),
            BoundedIncrease::OverCeiling => Err(StorageError::QuotaExceeded {
                counter: counter.to_string(),
                dimensions: dims.to_string_key(),
            }),
        }
    }

    async fn delete(&self, counter: &str, dims: &Dimensions) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let key = self.value_key(counter, dims);

        let mut keys = vec![key.clone()];
        if dims.is_empty() {
            let pattern = format!("{}{}*", escape_glob(&key), DIMENSION_SEPARATOR);
            keys.extend(self.scan_keys(&mut conn, &pattern).await?);
        }

        let _: i64 = conn.del(&keys).await?;
        Ok(())
    }

    async fn set_value(&self, counter: &str, value: i64, dims: &Dimensions) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(self.value_key(counter, dims), value).await?;
        Ok(())
    }

    async fn get_value(&self, counter: &str, dims: &Dimensions) -> StorageResult<Option<i64>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(self.value_key(counter, dims)).await?)
    }

    async fn get_sum_value(&self, counter: &str, group: &[Dimensions]) -> StorageResult<i64> {
        if group.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = group.iter().map(|dims| self.value_key(counter, dims)).collect();
        let mut conn = self.connection().await?;
        let values: Vec<Option<i64>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        Ok(values.into_iter().flatten().sum())
    }

    async fn get_options(
        &self,
        counter: &str,
        key: &Dimensions,
    ) -> StorageResult<Option<Vec<CounterOption>>> {
        let mut conn = self.connection().await?;
        let blob: Option<String> = conn.get(self.options_key(counter, key)).await?;

        match blob {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
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

        let json = serde_json::to_string(opts)?;
        let mut conn = self.connection().await?;
        let _: () = conn.set(self.options_key(counter, key), json).await?;
        Ok(())
    }
}
