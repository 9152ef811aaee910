//! Error types for the access limiter.

use thiserror::Error;

/// Errors surfaced by [`RateCounter`](crate::counter::RateCounter) operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The trailing average rate is above `limit_qps`.
    #[error("qps reached upper limit, counter: {counter}, dimensions: {dimensions}")]
    RateLimitExceeded { counter: String, dimensions: String },

    /// The requested consumption would push the total above `limit_quota`.
    #[error("quota reached upper limit, counter: {counter}, dimensions: {dimensions}")]
    QuotaLimitExceeded { counter: String, dimensions: String },

    #[error("invalid consume count {count}, counter: {counter}")]
    InvalidCount { counter: String, count: i64 },

    /// The backend could not apply the increment. No consumption happened.
    #[error("increase counter failed, counter: {counter}, err: {source}")]
    IncreaseFailed {
        counter: String,
        #[source]
        source: StorageError,
    },

    #[error("reset counter failed, counter: {counter}, err: {source}")]
    ResetFailed {
        counter: String,
        #[source]
        source: StorageError,
    },

    /// Neither storage nor the local cache holds options for the key.
    #[error("get options failed, counter: {counter}, dimensions: {dimensions}")]
    GetOptionsFailed { counter: String, dimensions: String },

    #[error("update options failed, counter: {counter}, err: {source}")]
    UpdateOptionsFailed {
        counter: String,
        #[source]
        source: StorageError,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this is one of the expected admission rejections rather than a failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            LimiterError::RateLimitExceeded { .. } | LimiterError::QuotaLimitExceeded { .. }
        )
    }
}

/// Errors returned by [`CounterStorage`](crate::storage::CounterStorage) backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A bounded increase was rejected because it would exceed the ceiling.
    #[error("quota reached upper limit, counter: {counter}, dimensions: {dimensions}")]
    QuotaExceeded { counter: String, dimensions: String },

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("connection pool config error: {0}")]
    PoolConfig(#[from] deadpool_redis::CreatePoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The optimistic lock kept failing; the outcome of the increase is unknown.
    #[error("gave up on {key} after {attempts} attempts{}", last_error_suffix(.last_error))]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: Option<Box<StorageError>>,
    },
}

fn last_error_suffix(last_error: &Option<Box<StorageError>>) -> String {
    match last_error {
        Some(e) => format!(", last error: {}", e),
        None => String::new(),
    }
}

/// Result type alias for counter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_classification() {
        let rate = LimiterError::RateLimitExceeded {
            counter: "test".to_string(),
            dimensions: "shoes:oid-001".to_string(),
        };
        let quota = LimiterError::QuotaLimitExceeded {
            counter: "test".to_string(),
            dimensions: String::new(),
        };
        let failed = LimiterError::GetOptionsFailed {
            counter: "test".to_string(),
            dimensions: String::new(),
        };

        assert!(rate.is_limit_exceeded());
        assert!(quota.is_limit_exceeded());
        assert!(!failed.is_limit_exceeded());
    }

    #[test]
    fn test_retries_exhausted_message() {
        let err = StorageError::RetriesExhausted {
            key: "_counter_:test".to_string(),
            attempts: 4,
            last_error: None,
        };
        assert_eq!(err.to_string(), "gave up on _counter_:test after 4 attempts");

        let err = StorageError::RetriesExhausted {
            key: "_counter_:test".to_string(),
            attempts: 2,
            last_error: Some(Box::new(StorageError::QuotaExceeded {
                counter: "test".to_string(),
                dimensions: "a".to_string(),
            })),
        };
        assert!(err.to_string().ends_with("last error: quota reached upper limit, counter: test, dimensions: a"));
    }
}
