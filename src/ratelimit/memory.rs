//! In-process backend with per-key expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::error::BackendError;

use super::backend::{Backend, BatchReplies, Command, Reply};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// How often [`MemoryBackend`] sweeps expired keys while serving batches.
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// A [`Backend`] that keeps counters in process memory.
///
/// Counts are only shared between counters holding the same instance, so
/// this suits single-process deployments and tests. Expired keys are
/// dropped on access, by a sweep that runs from [`execute`](Backend::execute)
/// at most once per purge interval, or by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    started: Instant,
    last_purge_ms: AtomicU64,
    purge_interval: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            started: Instant::now(),
            last_purge_ms: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum time between sweeps of expired keys.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired window counters");
        }
        removed
    }

    /// Sweep if the purge interval has passed since the last sweep. Only the
    /// caller that wins the timestamp swap sweeps.
    fn maybe_purge(&self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.started).as_millis() as u64;
        let last_ms = self.last_purge_ms.load(Ordering::Relaxed);
        let interval_ms = self.purge_interval.as_millis() as u64;

        if elapsed_ms.saturating_sub(last_ms) < interval_ms {
            return;
        }
        if self
            .last_purge_ms
            .compare_exchange(last_ms, elapsed_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_at(now);
        }
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn apply(&self, command: &Command, now: Instant) -> Result<Reply, BackendError> {
        self.evict_if_expired(command.key(), now);

        match command {
            Command::Incr { key } => {
                let mut entry = self.entries.entry(key.clone()).or_insert(Entry {
                    value: 0,
                    expires_at: None,
                });
                entry.value = entry.value.checked_add(1).ok_or_else(|| {
                    BackendError::Server("increment would overflow".to_string())
                })?;
                Ok(Reply::Integer(entry.value))
            }
            Command::Expire { key, seconds } => {
                if *seconds == 0 {
                    return Ok(Reply::Integer(
                        self.entries.remove(key.as_str()).is_some() as i64,
                    ));
                }
                match self.entries.get_mut(key.as_str()) {
                    Some(mut entry) => {
                        entry.expires_at = Some(now + Duration::from_secs(*seconds));
                        Ok(Reply::Integer(1))
                    }
                    None => Ok(Reply::Integer(0)),
                }
            }
            Command::Get { key } => Ok(self
                .entries
                .get(key.as_str())
                .map(|entry| Reply::Integer(entry.value))
                .unwrap_or(Reply::Nil)),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&self, commands: &[Command]) -> Result<BatchReplies, BackendError> {
        let now = Instant::now();
        self.maybe_purge(now);

        Ok(commands
            .iter()
            .map(|command| self.apply(command, now))
            .collect())
    }

    async fn shutdown(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incr(key: &str) -> Command {
        Command::Incr {
            key: key.to_string(),
        }
    }

    fn get(key: &str) -> Command {
        Command::Get {
            key: key.to_string(),
        }
    }

    fn expire(key: &str, seconds: u64) -> Command {
        Command::Expire {
            key: key.to_string(),
            seconds,
        }
    }

    fn values(replies: BatchReplies) -> Vec<Reply> {
        replies.into_iter().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_incr_creates_at_one() {
        let backend = MemoryBackend::new();

        let replies = backend.execute(&[incr("k"), incr("k"), get("k")]).await.unwrap();
        assert_eq!(
            values(replies),
            vec![Reply::Integer(1), Reply::Integer(2), Reply::Integer(2)]
        );
    }

    #[tokio::test]
    async fn test_get_absent_is_nil() {
        let backend = MemoryBackend::new();

        let replies = backend.execute(&[get("missing")]).await.unwrap();
        assert_eq!(values(replies), vec![Reply::Nil]);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let backend = MemoryBackend::new();

        let replies = backend.execute(&[expire("missing", 10)]).await.unwrap();
        assert_eq!(values(replies), vec![Reply::Integer(0)]);
    }

    #[tokio::test]
    async fn test_expire_zero_deletes() {
        let backend = MemoryBackend::new();

        backend.execute(&[incr("k")]).await.unwrap();
        let replies = backend.execute(&[expire("k", 0), get("k")]).await.unwrap();
        assert_eq!(values(replies), vec![Reply::Integer(1), Reply::Nil]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_restarts_from_one() {
        let backend = MemoryBackend::new();

        backend.execute(&[incr("k"), incr("k"), expire("k", 3)]).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let replies = backend.execute(&[get("k"), incr("k")]).await.unwrap();
        assert_eq!(values(replies), vec![Reply::Nil, Reply::Integer(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();

        backend
            .execute(&[incr("short"), expire("short", 1), incr("long"), expire("long", 60)])
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sweeps_other_expired_keys() {
        let backend = MemoryBackend::new().with_purge_interval(Duration::from_secs(5));

        backend.execute(&[incr("old"), expire("old", 1)]).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // Interval not reached yet: "old" is expired but still stored.
        backend.execute(&[get("other")]).await.unwrap();
        assert_eq!(backend.len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        backend.execute(&[get("other")]).await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_keys_stay_bounded_across_windows() {
        let backend = MemoryBackend::new();

        for i in 0..1000 {
            let key = format!("bucket{i}");
            backend.execute(&[incr(&key), expire(&key, 3)]).await.unwrap();
            backend.execute(&[get(&key)]).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert!(backend.len() <= 5, "{} keys stored", backend.len());
    }

    #[tokio::test]
    async fn test_shutdown_clears() {
        let backend = MemoryBackend::new();

        backend.execute(&[incr("k")]).await.unwrap();
        backend.shutdown().await;
        assert!(backend.is_empty());
    }
}
