//! The rate counter: quota and QPS admission over a pluggable storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::dimensions::Dimensions;
use super::options::{qps_ceiling, quota_ceiling, CacheLookup, CounterOption, OptionsCache};
use super::rate::RateTracker;
use crate::config::CounterConfig;
use crate::error::{LimiterError, Result, StorageError};
use crate::storage::{exceeds_ceiling, CounterStorage};

const CONSUME_NAMESPACE: &str = "_counter_";
const QPS_NAMESPACE: &str = "_qps_";

/// A named counter enforcing `limit_quota` and `limit_qps` per dimension key.
///
/// Safe to share across tasks behind an `Arc`. Options are cached with a
/// soft TTL and written through on update. Consumption speed comes from a
/// background task that flushes locally buffered counts into storage once
/// per interval; that task is aborted when the counter is dropped.
pub struct RateCounter {
    name: String,
    consume_counter: String,
    storage: Arc<dyn CounterStorage>,
    options: OptionsCache,
    rates: Arc<RateTracker>,
    sync_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateCounter")
            .field("name", &self.name)
            .field("options_ttl", &self.options.ttl())
            .field("background_sync", &self.sync_task.is_some())
            .finish()
    }
}

impl RateCounter {
    /// Create a counter with the default configuration.
    pub fn new(name: impl Into<String>, storage: Arc<dyn CounterStorage>) -> Self {
        Self::with_config(name, storage, &CounterConfig::default())
    }

    /// Create a counter and, if enabled, start its rate sync task.
    ///
    /// The sync task needs a tokio runtime; without one it is skipped and
    /// [`sync_rate_buckets`](Self::sync_rate_buckets) must be driven manually.
    pub fn with_config(
        name: impl Into<String>,
        storage: Arc<dyn CounterStorage>,
        config: &CounterConfig,
    ) -> Self {
        let name = name.into();
        let rates = Arc::new(RateTracker::new(
            format!("{}:{}", QPS_NAMESPACE, name),
            storage.clone(),
        ));

        let sync_task = if config.background_sync {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(run_rate_sync(rates.clone(), config.sync_interval()))),
                Err(_) => {
                    warn!(counter = %name, "No tokio runtime, rate sync task not started");
                    None
                }
            }
        } else {
            None
        };

        info!(
            counter = %name,
            options_ttl_secs = config.options_ttl_secs,
            background_sync = sync_task.is_some(),
            "Rate counter created"
        );

        Self {
            consume_counter: format!("{}:{}", CONSUME_NAMESPACE, name),
            name,
            storage,
            options: OptionsCache::new(config.options_ttl()),
            rates,
            sync_task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit `count` units for `dims`, or explain why not.
    ///
    /// The rate ceiling is checked first, then the quota. The quota is
    /// enforced again inside storage so concurrent callers cannot overshoot.
    /// `count` must not be negative; zero is admitted without changing the
    /// stored total.
    pub async fn consume(&self, count: i64, dims: &[&str]) -> Result<()> {
        if count < 0 {
            return Err(LimiterError::InvalidCount {
                counter: self.name.clone(),
                count,
            });
        }

        let dims = Dimensions::from(dims);
        let opts = self.options_for(&dims).await.unwrap_or_default();

        if self.is_rate_exceeded(&dims, &opts) {
            self.rates.record(&dims, 0);
            return Err(self.rate_exceeded(&dims));
        }

        let quota = quota_ceiling(&opts);
        if let Some(quota) = quota {
            let current = self
                .storage
                .get_value(&self.consume_counter, &dims)
                .await
                .map_err(|e| self.increase_failed(e))?
                .unwrap_or(0);

            if exceeds_ceiling(current, count, quota) {
                self.rates.record(&dims, 0);
                return Err(self.quota_exceeded(&dims, quota));
            }
        }

        match self
            .storage
            .increase(&self.consume_counter, count, quota.unwrap_or(0), &dims)
            .await
        {
            Ok(()) => {
                trace!(counter = %self.name, dimensions = %dims, count, "Consumed");
                self.rates.record(&dims, count);
                Ok(())
            }
            Err(StorageError::QuotaExceeded { .. }) => {
                self.rates.record(&dims, 0);
                Err(self.quota_exceeded(&dims, quota.unwrap_or(0)))
            }
            Err(e) => {
                warn!(counter = %self.name, dimensions = %dims, error = %e, "Increase failed");
                Err(self.increase_failed(e))
            }
        }
    }

    /// Whether `consume(count, dims)` would currently be admitted.
    ///
    /// Never changes stored consumption, but registers `dims` with the rate
    /// tracker so its speed is observed.
    pub async fn is_can_consume(&self, count: i64, dims: &[&str]) -> bool {
        if count < 0 {
            return false;
        }

        let dims = Dimensions::from(dims);
        let opts = self.options_for(&dims).await.unwrap_or_default();
        self.rates.record(&dims, 0);

        if self.is_rate_exceeded(&dims, &opts) {
            return false;
        }

        let Some(quota) = quota_ceiling(&opts) else {
            return true;
        };

        match self.storage.get_value(&self.consume_counter, &dims).await {
            Ok(current) => !exceeds_ceiling(current.unwrap_or(0), count, quota),
            Err(e) => {
                warn!(counter = %self.name, dimensions = %dims, error = %e, "Failed to read consumption");
                false
            }
        }
    }

    /// Drop the consumption total for `dims`. Options and rate history stay.
    ///
    /// With no dimensions every total of this counter is removed.
    pub async fn reset(&self, dims: &[&str]) -> Result<()> {
        let dims = Dimensions::from(dims);
        self.storage
            .delete(&self.consume_counter, &dims)
            .await
            .map_err(|e| self.reset_failed(e))?;

        debug!(counter = %self.name, dimensions = %dims, "Consumption reset");
        Ok(())
    }

    /// Overwrite the consumption total for `dims` with `consumed`.
    pub async fn reset_to(&self, consumed: i64, dims: &[&str]) -> Result<()> {
        let dims = Dimensions::from(dims);
        self.storage
            .set_value(&self.consume_counter, consumed, &dims)
            .await
            .map_err(|e| self.reset_failed(e))?;

        debug!(counter = %self.name, dimensions = %dims, consumed, "Consumption reset");
        Ok(())
    }

    /// Current consumption for `dims` as stored, 0 if never consumed.
    pub async fn consumed(&self, dims: &[&str]) -> Result<i64> {
        let dims = Dimensions::from(dims);
        self.storage
            .get_value(&self.consume_counter, &dims)
            .await
            .map(|value| value.unwrap_or(0))
            .map_err(|e| self.increase_failed(e))
    }

    /// Estimated units per second for `dims`. Reads the local cache only.
    pub fn consume_speed(&self, dims: &[&str]) -> i64 {
        self.rates.speed(&Dimensions::from(dims))
    }

    /// Persist `opts` for `dims` and update the local cache.
    pub async fn update_options(&self, opts: &[CounterOption], dims: &[&str]) -> Result<()> {
        let dims = Dimensions::from(dims);
        if opts.is_empty() {
            return Ok(());
        }

        self.storage
            .set_options(&self.name, &dims, opts)
            .await
            .map_err(|e| LimiterError::UpdateOptionsFailed {
                counter: self.name.clone(),
                source: e,
            })?;

        self.options.store(&dims, Some(opts.to_vec()));
        info!(counter = %self.name, dimensions = %dims, options = ?opts, "Options updated");
        Ok(())
    }

    /// Options for `dims`, from cache while fresh, else from storage.
    ///
    /// A stale cached value is returned when storage cannot provide one.
    pub async fn get_options(&self, dims: &[&str]) -> Result<Vec<CounterOption>> {
        let dims = Dimensions::from(dims);
        self.options_for(&dims)
            .await
            .ok_or_else(|| LimiterError::GetOptionsFailed {
                counter: self.name.clone(),
                dimensions: dims.to_string_key(),
            })
    }

    /// Run one rate aggregation pass now.
    pub async fn sync_rate_buckets(&self) {
        self.rates.sync_at(current_second()).await;
    }

    /// Run one rate aggregation pass as if the wall clock read `second`.
    pub async fn sync_rate_buckets_at(&self, second: u64) {
        self.rates.sync_at(second).await;
    }

    async fn options_for(&self, dims: &Dimensions) -> Option<Vec<CounterOption>> {
        let cached = match self.options.lookup(dims) {
            CacheLookup::Fresh(options) => return options,
            CacheLookup::Stale(options) => options,
            CacheLookup::Missing => None,
        };

        match self.storage.get_options(&self.name, dims).await {
            Ok(Some(options)) => {
                self.options.store(dims, Some(options.clone()));
                Some(options)
            }
            Ok(None) if cached.is_none() => {
                self.options.store(dims, None);
                None
            }
            Ok(None) => {
                self.options.touch(dims);
                cached
            }
            Err(e) => {
                warn!(
                    counter = %self.name,
                    dimensions = %dims,
                    error = %e,
                    "Failed to refresh options, serving cached value"
                );
                self.options.touch(dims);
                cached
            }
        }
    }

    fn is_rate_exceeded(&self, dims: &Dimensions, opts: &[CounterOption]) -> bool {
        match qps_ceiling(opts) {
            Some(limit) => self.rates.speed(dims) > limit,
            None => false,
        }
    }

    fn rate_exceeded(&self, dims: &Dimensions) -> LimiterError {
        debug!(
            counter = %self.name,
            dimensions = %dims,
            speed = self.rates.speed(dims),
            "QPS limit exceeded"
        );
        LimiterError::RateLimitExceeded {
            counter: self.name.clone(),
            dimensions: dims.to_string_key(),
        }
    }

    fn quota_exceeded(&self, dims: &Dimensions, quota: i64) -> LimiterError {
        debug!(
            counter = %self.name,
            dimensions = %dims,
            quota,
            "Quota limit exceeded"
        );
        LimiterError::QuotaLimitExceeded {
            counter: self.name.clone(),
            dimensions: dims.to_string_key(),
        }
    }

    fn increase_failed(&self, source: StorageError) -> LimiterError {
        LimiterError::IncreaseFailed {
            counter: self.name.clone(),
            source,
        }
    }

    fn reset_failed(&self, source: StorageError) -> LimiterError {
        LimiterError::ResetFailed {
            counter: self.name.clone(),
            source,
        }
    }
}

impl Drop for RateCounter {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
    }
}

fn current_second() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

async fn run_rate_sync(rates: Arc<RateTracker>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        rates.sync_at(current_second()).await;
    }
}
