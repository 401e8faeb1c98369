//! Redis backend built on a multiplexed connection manager.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{ConnectionInfo, IntoConnectionInfo, RedisError, Value};
use tracing::{debug, info, warn};

use crate::config::CounterConfig;
use crate::error::{BackendError, RateWindowError, Result};
use crate::ratelimit::{Backend, BatchReplies, Command, Reply, WindowCounter};

/// A window counter running against Redis.
pub type RedisLimitCounter = WindowCounter<RedisBackend>;

impl WindowCounter<RedisBackend> {
    /// Connect to Redis and build a counter from `config`.
    ///
    /// Fails if the configuration is invalid or no address accepts a
    /// connection, so a returned counter has been able to reach the server.
    pub async fn connect(config: &CounterConfig) -> Result<Self> {
        let backend = RedisBackend::connect(config).await?;
        WindowCounter::with_config(backend, config)
    }
}

/// A [`Backend`] sending command batches to Redis as pipelines.
///
/// The connection manager is cloned per batch; clones share one multiplexed
/// connection and reconnect on failure.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    address: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("address", &self.address)
            .finish()
    }
}

impl RedisBackend {
    /// Connect to the first reachable address in `config`.
    ///
    /// With more than one address the order is shuffled so processes spread
    /// their initial connections.
    pub async fn connect(config: &CounterConfig) -> Result<Self> {
        config.validate()?;

        let mut addresses = config.resolved_addresses();
        if addresses.len() > 1 {
            addresses.shuffle(&mut rand::thread_rng());
        }

        let mut failures = Vec::new();
        for address in addresses {
            debug!(address = %address, db = config.db_index, "Connecting to Redis");

            match Self::open(&address, config).await {
                Ok(connection) => {
                    info!(address = %address, db = config.db_index, "Connected to Redis");
                    return Ok(Self {
                        connection,
                        address,
                    });
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to connect to Redis");
                    failures.push(format!("{}: {}", address, e));
                }
            }
        }

        Err(RateWindowError::Config(format!(
            "unable to connect to redis ({})",
            failures.join("; ")
        )))
    }

    async fn open(
        address: &str,
        config: &CounterConfig,
    ) -> std::result::Result<ConnectionManager, BackendError> {
        let info = connection_info(address, config)?;
        let client = redis::Client::open(info)?;
        let timeout = config.connect_timeout();

        tokio::time::timeout(timeout, async {
            let mut connection = client.get_connection_manager().await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, BackendError>(connection)
        })
        .await
        .map_err(|_| BackendError::Timeout(timeout))?
    }

    /// The address this backend connected to.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Build connection details for `address`, which is either `host:port` or a
/// full `redis://` URL. Password and database from `config` take precedence.
fn connection_info(
    address: &str,
    config: &CounterConfig,
) -> std::result::Result<ConnectionInfo, BackendError> {
    let url = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    };

    let mut info = url.as_str().into_connection_info()?;
    info.redis.db = config.db_index;
    if let Some(password) = &config.password {
        info.redis.password = Some(password.clone());
    }
    Ok(info)
}

/// Connection loss and refusal mean the server cannot be reached right now;
/// everything else keeps the client's error.
fn batch_error(err: RedisError) -> BackendError {
    if err.is_connection_dropped() || err.is_connection_refusal() {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Redis(err)
    }
}

fn reply_from_value(value: Value) -> std::result::Result<Reply, BackendError> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Int(n) => Ok(Reply::Integer(n)),
        Value::BulkString(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Reply::Integer)
            .ok_or_else(|| {
                BackendError::UnexpectedReply(String::from_utf8_lossy(&bytes).into_owned())
            }),
        Value::SimpleString(s) => match s.parse::<i64>() {
            Ok(n) => Ok(Reply::Integer(n)),
            Err(_) => Err(BackendError::UnexpectedReply(s)),
        },
        Value::ServerError(err) => Err(BackendError::Server(match err.details() {
            Some(details) => format!("{} {}", err.code(), details),
            None => err.code().to_string(),
        })),
        other => Err(BackendError::UnexpectedReply(format!("{:?}", other))),
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn execute(
        &self,
        commands: &[Command],
    ) -> std::result::Result<BatchReplies, BackendError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();

        for command in commands {
            match command {
                Command::Incr { key } => {
                    pipe.cmd("INCR").arg(key);
                }
                Command::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds);
                }
                Command::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
            }
        }

        // Raw replies keep a failing command as its own `ServerError` value;
        // `Pipeline::query_async` would fold it into one error for the batch.
        let mut connection = self.connection.clone();
        let values = connection
            .req_packed_commands(&pipe, 0, commands.len())
            .await
            .map_err(|e| {
                debug!(address = %self.address, error = %e, "Redis pipeline failed");
                batch_error(e)
            })?;

        Ok(values.into_iter().map(reply_from_value).collect())
    }

    async fn shutdown(&self) {
        info!(address = %self.address, "Closing Redis connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_from_host_port() {
        let mut config = CounterConfig::with_addresses(["cache.internal:6380"]);
        config.db_index = 3;
        config.password = Some("hunter2".to_string());

        let info = connection_info("cache.internal:6380", &config).unwrap();
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("hunter2"));
        assert!(matches!(
            info.addr,
            redis::ConnectionAddr::Tcp(ref host, 6380) if host == "cache.internal"
        ));
    }

    #[test]
    fn test_connection_info_from_url() {
        let config = CounterConfig::default();

        let info = connection_info("redis://127.0.0.1:6379/", &config).unwrap();
        assert_eq!(info.redis.db, 0);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn test_reply_from_value() {
        assert_eq!(reply_from_value(Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(reply_from_value(Value::Int(7)).unwrap(), Reply::Integer(7));
        assert_eq!(
            reply_from_value(Value::BulkString(b"42".to_vec())).unwrap(),
            Reply::Integer(42)
        );
        assert!(matches!(
            reply_from_value(Value::BulkString(b"not a number".to_vec())),
            Err(BackendError::UnexpectedReply(_))
        ));
        assert!(matches!(
            reply_from_value(Value::Okay),
            Err(BackendError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_batch_error_classification() {
        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(batch_error(refused), BackendError::Unavailable(_)));

        let reset = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(matches!(batch_error(reset), BackendError::Unavailable(_)));

        let protocol = RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(batch_error(protocol), BackendError::Redis(_)));
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_config_error() {
        let mut config = CounterConfig::with_addresses(["127.0.0.1:1"]);
        config.connect_timeout_ms = 500;

        let result = RedisLimitCounter::connect(&config).await;
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = CounterConfig::default();
        config.db_index = -1;

        let result = RedisBackend::connect(&config).await;
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }
}
