//! Redis pub/sub transport.
//!
//! [`PubSubTransport`] is the narrow seam between [`RedisBroker`] and the
//! network: connect, ping, publish raw payloads, and open a payload stream
//! per subscription. The broker owns retries, reconnects and decoding;
//! the transport only moves strings.
//!
//! [`RedisBroker`]: super::RedisBroker

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::ports::BusError;

/// Raw message payloads for one subscription. Ends when the connection drops.
pub type PayloadStream = BoxStream<'static, String>;

/// Whether a subscription key is an exact channel or a glob pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

/// Network operations the Redis broker depends on.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// (Re-)establishes the command connection and verifies it with PING.
    async fn connect(&self) -> Result<(), BusError>;

    /// Round-trips a PING on the current command connection.
    async fn ping(&self) -> Result<(), BusError>;

    /// Publishes one payload to one channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Opens a dedicated subscription connection.
    async fn subscribe(&self, key: &str, kind: SubscriptionKind) -> Result<PayloadStream, BusError>;

    /// Drops the command connection.
    async fn close(&self);
}

/// Timeouts applied to Redis operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for RedisTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(3),
            write: Duration::from_secs(3),
        }
    }
}

/// [`PubSubTransport`] backed by the `redis` crate.
///
/// Commands share one multiplexed connection; each subscription gets its
/// own pub/sub connection, as the Redis protocol requires.
pub struct RedisTransport {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    timeouts: RedisTimeouts,
}

impl RedisTransport {
    /// Parses the URL. Does not connect.
    pub fn new(url: &str, timeouts: RedisTimeouts) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e: redis::RedisError| {
            BusError::connection(format!("failed to parse Redis URL: {}", e))
        })?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            timeouts,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BusError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::connection("not connected"))
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

fn redis_error(e: redis::RedisError) -> BusError {
    BusError::connection(e.to_string())
}

async fn ping_connection(
    conn: &mut MultiplexedConnection,
    limit: Duration,
) -> Result<(), BusError> {
    timeout(limit, redis::cmd("PING").query_async::<_, String>(conn))
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(redis_error)?;
    Ok(())
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn connect(&self) -> Result<(), BusError> {
        let mut conn = timeout(
            self.timeouts.connect,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(|e| BusError::connection(format!("failed to connect to Redis: {}", e)))?;

        ping_connection(&mut conn, self.timeouts.connect).await?;

        *self.conn.write().await = Some(conn);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        ping_connection(&mut conn, self.timeouts.read).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        timeout(self.timeouts.write, conn.publish::<_, _, i64>(channel, payload))
            .await
            .map_err(|_| BusError::Timeout)?
            .map_err(redis_error)?;
        Ok(())
    }

    async fn subscribe(&self, key: &str, kind: SubscriptionKind) -> Result<PayloadStream, BusError> {
        let mut pubsub = timeout(self.timeouts.connect, async {
            Ok::<_, redis::RedisError>(self.client.get_async_connection().await?.into_pubsub())
        })
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(redis_error)?;

        match kind {
            SubscriptionKind::Channel => pubsub.subscribe(key).await,
            SubscriptionKind::Pattern => pubsub.psubscribe(key).await,
        }
        .map_err(redis_error)?;

        let key = key.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(
                        subscription = %key,
                        channel = %msg.get_channel_name(),
                        error = %e,
                        "Dropping non-text pub/sub payload"
                    );
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.conn.write().await.take();
    }
}
