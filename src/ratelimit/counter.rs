//! Two-window request counter over a shared backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CounterConfig;
use crate::error::{BackendError, Phase, RateWindowError, Result};

use super::backend::{Backend, BatchReplies, Command, Reply};
use super::window::{WindowKeys, WindowLength};

/// Request counts for the current and the previous fixed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    /// Requests recorded in the current window
    pub current: u64,
    /// Requests recorded in the window before it
    pub previous: u64,
}

/// Trait for counter implementations consumed by rate limiting middleware.
///
/// The middleware passes the start of the current window (and of the
/// previous one on reads) and decides from the returned counts whether a
/// request is allowed.
#[async_trait]
pub trait LimitCounter: Send + Sync {
    /// Set the window length used for bucketing and expiry.
    ///
    /// `request_limit` is accepted for interface compatibility; the counter
    /// only reports counts.
    fn configure(&mut self, request_limit: u64, window_length: WindowLength);

    /// Record one request for `key` in the window containing `current_window`.
    async fn increment(&self, key: &str, current_window: DateTime<Utc>) -> Result<()>;

    /// Read the counts for `key` in both windows.
    async fn get(
        &self,
        key: &str,
        current_window: DateTime<Utc>,
        previous_window: DateTime<Utc>,
    ) -> Result<WindowCounts>;

    /// Like [`increment`](Self::increment), failing once `deadline` passes.
    async fn increment_until(
        &self,
        key: &str,
        current_window: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<()> {
        tokio::time::timeout_at(deadline, self.increment(key, current_window))
            .await
            .map_err(|_| {
                RateWindowError::backend(Phase::Increment, BackendError::DeadlineExceeded)
            })?
    }

    /// Like [`get`](Self::get), failing once `deadline` passes.
    async fn get_until(
        &self,
        key: &str,
        current_window: DateTime<Utc>,
        previous_window: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<WindowCounts> {
        tokio::time::timeout_at(deadline, self.get(key, current_window, previous_window))
            .await
            .map_err(|_| RateWindowError::backend(Phase::Read, BackendError::DeadlineExceeded))?
    }
}

/// A [`LimitCounter`] storing one self-expiring integer per window.
///
/// Each increment issues `INCR` and `EXPIRE` together; each read issues two
/// `GET`s together. All synchronization is left to the backend's atomic
/// increment, so the counter holds no locks and no cached counts.
pub struct WindowCounter<B> {
    backend: B,
    keys: WindowKeys,
    window: WindowLength,
    request_limit: Option<u64>,
    command_timeout: Option<Duration>,
}

impl<B: Backend> WindowCounter<B> {
    /// Create a counter over `backend` with the default prefix and a 60 second
    /// window.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            keys: WindowKeys::default(),
            window: WindowLength::default(),
            request_limit: None,
            command_timeout: None,
        }
    }

    /// Create a counter over `backend` using the prefix, window length and
    /// command timeout from `config`.
    pub fn with_config(backend: B, config: &CounterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(backend)
            .with_key_prefix(&config.key_prefix)
            .with_window_length(config.window_length()?)
            .with_command_timeout(config.command_timeout()))
    }

    /// Use `prefix` for every bucket key.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.keys = WindowKeys::new(prefix);
        self
    }

    /// Set the initial window length.
    pub fn with_window_length(mut self, window: WindowLength) -> Self {
        self.window = window;
        self
    }

    /// Bound every batch round trip by `timeout`.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Get the configured window length.
    pub fn window_length(&self) -> WindowLength {
        self.window
    }

    /// The request limit last passed to `configure`, if any.
    pub fn request_limit(&self) -> Option<u64> {
        self.request_limit
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Storage key of the bucket holding `instant` for `key`.
    pub fn bucket_key(&self, key: &str, instant: DateTime<Utc>) -> String {
        self.keys.derive(key, instant, self.window)
    }

    /// Release the backend.
    pub async fn shutdown(self) {
        self.backend.shutdown().await;
    }

    async fn run(&self, phase: Phase, commands: &[Command]) -> Result<BatchReplies> {
        let batch = self.backend.execute(commands);
        let outcome = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, batch)
                .await
                .map_err(|_| RateWindowError::backend(phase, BackendError::Timeout(limit)))?,
            None => batch.await,
        };

        let replies = outcome.map_err(|e| {
            debug!(phase = %phase, error = %e, "Backend batch failed");
            RateWindowError::backend(phase, e)
        })?;

        if replies.len() != commands.len() {
            return Err(RateWindowError::backend(
                phase,
                BackendError::UnexpectedReply(format!(
                    "expected {} replies, got {}",
                    commands.len(),
                    replies.len()
                )),
            ));
        }

        Ok(replies)
    }
}

fn read_count(reply: std::result::Result<Reply, BackendError>) -> Result<u64> {
    match reply {
        Ok(Reply::Nil) => Ok(0),
        Ok(Reply::Integer(value)) => u64::try_from(value).map_err(|_| {
            RateWindowError::backend(
                Phase::Read,
                BackendError::UnexpectedReply(format!("negative count {}", value)),
            )
        }),
        Err(e) => Err(RateWindowError::backend(Phase::Read, e)),
    }
}

#[async_trait]
impl<B: Backend> LimitCounter for WindowCounter<B> {
    fn configure(&mut self, request_limit: u64, window_length: WindowLength) {
        debug!(
            request_limit = request_limit,
            window = ?window_length.duration(),
            "Configuring window counter"
        );
        self.request_limit = Some(request_limit);
        self.window = window_length;
    }

    async fn increment(&self, key: &str, current_window: DateTime<Utc>) -> Result<()> {
        let bucket = self.bucket_key(key, current_window);
        let ttl = self.window.ttl_secs();

        trace!(key = %key, bucket = %bucket, ttl = ttl, "Incrementing window counter");

        let commands = [
            Command::Incr {
                key: bucket.clone(),
            },
            Command::Expire {
                key: bucket,
                seconds: ttl,
            },
        ];
        let replies = self.run(Phase::Increment, &commands).await?;

        for (phase, reply) in [Phase::Increment, Phase::Expire].into_iter().zip(replies) {
            match reply {
                Ok(Reply::Integer(_)) => {}
                Ok(Reply::Nil) => {
                    return Err(RateWindowError::backend(
                        phase,
                        BackendError::UnexpectedReply("nil".to_string()),
                    ))
                }
                Err(e) => {
                    debug!(key = %key, phase = %phase, error = %e, "Window increment failed");
                    return Err(RateWindowError::backend(phase, e));
                }
            }
        }

        Ok(())
    }

    async fn get(
        &self,
        key: &str,
        current_window: DateTime<Utc>,
        previous_window: DateTime<Utc>,
    ) -> Result<WindowCounts> {
        let current = self.bucket_key(key, current_window);
        let previous = self.bucket_key(key, previous_window);

        trace!(key = %key, current = %current, previous = %previous, "Reading window counters");

        let commands = [Command::Get { key: current }, Command::Get { key: previous }];
        let mut replies = self.run(Phase::Read, &commands).await?.into_iter();

        let mut next = || {
            replies.next().ok_or_else(|| {
                RateWindowError::backend(
                    Phase::Read,
                    BackendError::UnexpectedReply("missing reply".to_string()),
                )
            })
        };
        let current = read_count(next()?)?;
        let previous = read_count(next()?)?;

        Ok(WindowCounts { current, previous })
    }
}
