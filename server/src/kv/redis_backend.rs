use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;

use super::{PresenceBackend, PubSub, RecencyBackend, Subscription};
use crate::error::BackendError;

/// Redis-backed recency sets, presence flags and pub/sub.
///
/// Commands share one multiplexed connection; every subscription opens its
/// own pub/sub connection.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { client, conn })
    }
}

fn presence_key(user_id: &str) -> String {
    format!("user:{}:online", user_id)
}

#[async_trait]
impl RecencyBackend for RedisBackend {
    async fn push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        // MULTI/EXEC so concurrent writers never observe an untrimmed set
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(0)
            .arg(-(cap as i64) - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn latest(&self, key: &str, limit: usize) -> Result<Vec<String>, BackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }
}

#[async_trait]
impl PresenceBackend for RedisBackend {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(presence_key(user_id))
            .arg(if online { "1" } else { "0" })
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<Option<bool>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|v| v == "1"))
    }
}

#[async_trait]
impl PubSub for RedisBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| {
            let payload = msg.get_payload::<String>();
            if let Err(e) = &payload {
                tracing::warn!(channel = %msg.get_channel_name(), error = %e, "Dropping non-text pub/sub payload");
            }
            futures_util::future::ready(payload.ok())
        });
        Ok(Box::pin(stream))
    }
}
