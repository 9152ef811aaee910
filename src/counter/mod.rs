//! Admission control: quota and rate ceilings per dimension key.

mod dimensions;
mod options;
mod rate;
mod rate_counter;

pub use dimensions::{Dimensions, DIMENSION_SEPARATOR};
pub use options::{
    qps_ceiling, quota_ceiling, CounterOption, LIMIT_QPS_OPTION, LIMIT_QUOTA_OPTION,
    UNLIMITED_QUOTA,
};
pub use rate::{RateTracker, RATE_BUCKETS};
pub use rate_counter::RateCounter;
