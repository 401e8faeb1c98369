//! Ratewindow - Distributed Request Counter
//!
//! This crate implements the counter behind a two-window rate limiter. Each
//! rate limit key gets one self-expiring integer per fixed time window in a
//! shared store, so any number of server processes can count into the same
//! windows using only atomic increment and read.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::CounterConfig;
pub use error::{BackendError, Phase, RateWindowError, Result};
pub use ratelimit::{LimitCounter, WindowCounter, WindowCounts, WindowLength};
pub use store::RedisLimitCounter;
