//! Access Limiter - quota and QPS admission control
//!
//! This crate implements a named, dimensioned counter that enforces a
//! consumption quota and an average-rate ceiling per resource key. State
//! lives behind a pluggable storage backend, either in-process or in a
//! shared Redis instance, so several processes can share one limiter.

pub mod config;
pub mod counter;
pub mod error;
pub mod storage;

pub use counter::{CounterOption, Dimensions, RateCounter};
pub use error::{LimiterError, Result, StorageError};
pub use storage::{CounterStorage, MemoryCounterStorage, RedisCounterStorage};
