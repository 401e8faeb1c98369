//! Shared store backends.
//!
//! The Redis backend lets every process pointed at the same server count
//! into the same window buckets.

mod redis;

pub use self::redis::{RedisBackend, RedisLimitCounter};
