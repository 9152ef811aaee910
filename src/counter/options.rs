//! Counter options and the per-counter options cache.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::dimensions::Dimensions;

/// Maximum cumulative consumption for a dimension key. `-1` means unlimited.
pub const LIMIT_QUOTA_OPTION: &str = "limit_quota";
/// Maximum trailing average rate for a dimension key. `0` means unlimited.
pub const LIMIT_QPS_OPTION: &str = "limit_qps";

/// Sentinel for an unlimited quota.
pub const UNLIMITED_QUOTA: i64 = -1;

/// A single named option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOption {
    pub name: String,
    pub value: String,
}

impl CounterOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn limit_quota(quota: i64) -> Self {
        Self::new(LIMIT_QUOTA_OPTION, quota.to_string())
    }

    pub fn limit_qps(qps: i64) -> Self {
        Self::new(LIMIT_QPS_OPTION, qps.to_string())
    }
}

/// Look up an option by name and parse it as an integer.
///
/// The last occurrence wins. Unparseable values read as absent.
fn int_option(opts: &[CounterOption], name: &str) -> Option<i64> {
    opts.iter()
        .rev()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.trim().parse().ok())
}

/// The quota ceiling, or `None` when unlimited.
pub fn quota_ceiling(opts: &[CounterOption]) -> Option<i64> {
    match int_option(opts, LIMIT_QUOTA_OPTION) {
        Some(quota) if quota != UNLIMITED_QUOTA && quota >= 0 => Some(quota),
        _ => None,
    }
}

/// The rate ceiling, or `None` when unlimited.
pub fn qps_ceiling(opts: &[CounterOption]) -> Option<i64> {
    int_option(opts, LIMIT_QPS_OPTION).filter(|qps| *qps > 0)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` records that storage had nothing for this key.
    options: Option<Vec<CounterOption>>,
    fetched_at: Instant,
}

/// Lookup result from [`OptionsCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Entry is within the TTL.
    Fresh(Option<Vec<CounterOption>>),
    /// Entry exists but is older than the TTL.
    Stale(Option<Vec<CounterOption>>),
    Missing,
}

/// Soft-TTL cache of options keyed by dimension prefix.
///
/// Stale entries stay readable so callers can fall back on them when the
/// backend cannot be reached.
#[derive(Debug)]
pub struct OptionsCache {
    ttl: Duration,
    entries: Mutex<HashMap<Dimensions, CacheEntry>>,
}

impl OptionsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lookup(&self, dims: &Dimensions) -> CacheLookup {
        let entries = self.entries.lock();
        match entries.get(dims) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                CacheLookup::Fresh(entry.options.clone())
            }
            Some(entry) => CacheLookup::Stale(entry.options.clone()),
            None => CacheLookup::Missing,
        }
    }

    /// Store a fetched (or written) value, stamped now.
    pub fn store(&self, dims: &Dimensions, options: Option<Vec<CounterOption>>) {
        let mut entries = self.entries.lock();
        entries.insert(
            dims.clone(),
            CacheEntry {
                options,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Restamp an existing entry without changing its value.
    pub fn touch(&self, dims: &Dimensions) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(dims) {
            entry.fetched_at = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_constructors() {
        assert_eq!(CounterOption::limit_quota(15000), CounterOption::new("limit_quota", "15000"));
        assert_eq!(CounterOption::limit_qps(1000), CounterOption::new("limit_qps", "1000"));
    }

    #[test]
    fn test_quota_ceiling() {
        assert_eq!(quota_ceiling(&[CounterOption::limit_quota(10)]), Some(10));
        assert_eq!(quota_ceiling(&[CounterOption::limit_quota(0)]), Some(0));
        assert_eq!(quota_ceiling(&[CounterOption::limit_quota(UNLIMITED_QUOTA)]), None);
        assert_eq!(quota_ceiling(&[CounterOption::limit_qps(10)]), None);
        assert_eq!(quota_ceiling(&[CounterOption::new(LIMIT_QUOTA_OPTION, "lots")]), None);
        assert_eq!(quota_ceiling(&[]), None);
    }

    #[test]
    fn test_qps_ceiling() {
        assert_eq!(qps_ceiling(&[CounterOption::limit_qps(100)]), Some(100));
        assert_eq!(qps_ceiling(&[CounterOption::limit_qps(0)]), None);
        assert_eq!(qps_ceiling(&[CounterOption::limit_quota(100)]), None);
    }

    #[test]
    fn test_last_option_wins() {
        let opts = vec![CounterOption::limit_qps(5), CounterOption::limit_qps(7)];
        assert_eq!(qps_ceiling(&opts), Some(7));
    }

    #[test]
    fn test_option_json_shape() {
        let json = serde_json::to_string(&vec![CounterOption::limit_quota(3)]).unwrap();
        assert_eq!(json, r#"[{"name":"limit_quota","value":"3"}]"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_goes_stale_after_ttl() {
        let cache = OptionsCache::new(Duration::from_secs(10));
        let dims = Dimensions::from(["shoes"]);

        assert_eq!(cache.lookup(&dims), CacheLookup::Missing);

        cache.store(&dims, Some(vec![CounterOption::limit_qps(1)]));
        assert_eq!(
            cache.lookup(&dims),
            CacheLookup::Fresh(Some(vec![CounterOption::limit_qps(1)]))
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            cache.lookup(&dims),
            CacheLookup::Stale(Some(vec![CounterOption::limit_qps(1)]))
        );

        cache.touch(&dims);
        assert!(matches!(cache.lookup(&dims), CacheLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn test_cache_negative_entry() {
        let cache = OptionsCache::new(Duration::from_secs(10));
        let dims = Dimensions::empty();

        cache.store(&dims, None);
        assert_eq!(cache.lookup(&dims), CacheLookup::Fresh(None));
        assert_eq!(cache.len(), 1);
    }
}
