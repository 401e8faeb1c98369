//! Fixed window arithmetic and bucket key derivation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{RateWindowError, Result};

/// Prefix used by [`derive_window_key`].
pub const DEFAULT_KEY_PREFIX: &str = "httprate";

/// Length of one fixed rate limit window.
///
/// Always at least one second, so two distinct window starts never share the
/// same whole-second timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowLength(Duration);

impl WindowLength {
    /// Shortest accepted window.
    pub const MIN: Duration = Duration::from_secs(1);

    /// Create a window length from whole seconds.
    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::try_from(Duration::from_secs(secs))
    }

    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        self.0
    }

    fn as_millis(&self) -> i64 {
        i64::try_from(self.0.as_millis()).unwrap_or(i64::MAX)
    }

    /// Time-to-live applied to a bucket on every increment: three window
    /// lengths, truncated to whole seconds.
    pub fn ttl_secs(&self) -> u64 {
        (self.0.as_secs_f64() * 3.0) as u64
    }

    /// Index of the window containing `instant`, counted from the Unix epoch.
    pub fn window_index(&self, instant: DateTime<Utc>) -> i64 {
        instant.timestamp_millis().div_euclid(self.as_millis())
    }

    /// Start of the window containing `instant`.
    pub fn window_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let start_ms = self.window_index(instant).saturating_mul(self.as_millis());
        Utc.timestamp_millis_opt(start_ms)
            .single()
            .unwrap_or(instant)
    }

    /// Start of the window immediately before the one containing `instant`.
    pub fn previous_window_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let start_ms = (self.window_index(instant) - 1).saturating_mul(self.as_millis());
        Utc.timestamp_millis_opt(start_ms)
            .single()
            .unwrap_or(instant)
    }
}

impl Default for WindowLength {
    fn default() -> Self {
        Self(Duration::from_secs(60))
    }
}

impl TryFrom<Duration> for WindowLength {
    type Error = RateWindowError;

    fn try_from(value: Duration) -> Result<Self> {
        if value < Self::MIN {
            return Err(RateWindowError::Config(format!(
                "window length must be at least one second, got {:?}",
                value
            )));
        }
        Ok(Self(value))
    }
}

/// Derives bucket keys under a fixed prefix.
#[derive(Debug, Clone)]
pub struct WindowKeys {
    prefix: Arc<str>,
}

impl WindowKeys {
    /// Create a key deriver for `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: Arc::from(prefix),
        }
    }

    /// The prefix prepended to every key.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key of the bucket holding `instant` for `key`.
    ///
    /// The key is `{prefix}:{xxh64(key ++ window_start_unix_secs)}`. With the
    /// default prefix and whole-second windows this is the same key the Go
    /// `httprate` Redis counter writes.
    pub fn derive(&self, key: &str, instant: DateTime<Utc>, window: WindowLength) -> String {
        let window_start = window.window_start(instant).timestamp();

        let mut hasher = Xxh64::new(0);
        hasher.update(key.as_bytes());
        hasher.update(window_start.to_string().as_bytes());

        format!("{}:{}", self.prefix, hasher.digest())
    }
}

impl Default for WindowKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Storage key of the bucket holding `instant` for `key`, under the default
/// prefix.
pub fn derive_window_key(key: &str, instant: DateTime<Utc>, window: WindowLength) -> String {
    WindowKeys::default().derive(key, instant, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn minute() -> WindowLength {
        WindowLength::from_secs(60).unwrap()
    }

    #[test]
    fn test_window_length_rejects_sub_second() {
        assert!(WindowLength::try_from(Duration::from_millis(999)).is_err());
        assert!(WindowLength::from_secs(0).is_err());
        assert!(WindowLength::try_from(Duration::from_millis(1500)).is_ok());
    }

    #[test]
    fn test_ttl_is_three_windows_truncated() {
        assert_eq!(minute().ttl_secs(), 180);
        assert_eq!(WindowLength::from_secs(1).unwrap().ttl_secs(), 3);

        let odd = WindowLength::try_from(Duration::from_millis(1300)).unwrap();
        assert_eq!(odd.ttl_secs(), 3);
    }

    #[test]
    fn test_window_start() {
        let window = minute();

        assert_eq!(window.window_start(at(10)), at(0));
        assert_eq!(window.window_start(at(59)), at(0));
        assert_eq!(window.window_start(at(60)), at(60));
        assert_eq!(window.previous_window_start(at(65)), at(0));
    }

    #[test]
    fn test_window_start_before_epoch() {
        let window = minute();

        assert_eq!(window.window_start(at(-1)), at(-60));
        assert_eq!(window.window_index(at(-1)), -1);
    }

    #[test]
    fn test_same_window_same_key() {
        let window = minute();

        let a = derive_window_key("user1", at(120), window);
        let b = derive_window_key("user1", at(179), window);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_windows_different_keys() {
        let window = minute();

        let a = derive_window_key("user1", at(179), window);
        let b = derive_window_key("user1", at(180), window);
        let c = derive_window_key("user1", at(240), window);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_different_keys_different_buckets() {
        let window = minute();

        assert_ne!(
            derive_window_key("user1", at(10), window),
            derive_window_key("user2", at(10), window)
        );
    }

    #[test]
    fn test_key_format() {
        let key = derive_window_key("user1", at(10), minute());

        let digest = key.strip_prefix("httprate:").unwrap();
        assert!(digest.parse::<u64>().is_ok());
    }

    #[test]
    fn test_key_matches_xxh64_of_key_and_window_start() {
        let key = derive_window_key("10.0.0.1", at(125), minute());

        let expected = xxhash_rust::xxh64::xxh64(b"10.0.0.1120", 0);
        assert_eq!(key, format!("httprate:{}", expected));
    }

    #[test]
    fn test_custom_prefix() {
        let keys = WindowKeys::new("api");
        let key = keys.derive("user1", at(10), minute());

        assert!(key.starts_with("api:"));
        assert_eq!(keys.prefix(), "api");
    }

    #[test]
    fn test_fractional_windows_get_distinct_keys() {
        let window = WindowLength::try_from(Duration::from_millis(1500)).unwrap();
        let keys: Vec<String> = (0..8)
            .map(|i| {
                let instant = at(0) + chrono::Duration::milliseconds(i * 1500);
                derive_window_key("k", instant, window)
            })
            .collect();

        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
