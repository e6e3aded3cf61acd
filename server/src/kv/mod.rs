//! Fast external key-value services consumed by the delivery core.
//!
//! Three narrow traits cover what the core needs from the outside world:
//! an ordered recency set per conversation, a presence flag per user and a
//! pub/sub bus. Redis implements all three; the in-process implementations
//! serve single-node deployments without Redis.

pub mod memory;
pub mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::BackendError;

/// Ordered, capped set of serialized entries per key.
#[async_trait]
pub trait RecencyBackend: Send + Sync {
    /// Insert `member` at `score`, keep only the `cap` highest-scored members
    /// and reset the key's expiry to `ttl`, as one atomic step.
    async fn push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    /// Up to `limit` members, highest score first.
    async fn latest(&self, key: &str, limit: usize) -> Result<Vec<String>, BackendError>;
}

/// Online flag per user.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), BackendError>;

    /// `None` when nothing was ever recorded for the user.
    async fn is_online(&self, user_id: &str) -> Result<Option<bool>, BackendError>;
}

/// Payloads received on one subscribed channel.
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError>;
}

/// Channel carrying direct messages for a user connected to another node.
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}:messages", user_id)
}

/// Channel carrying messages posted to a room.
pub fn room_channel(room_id: &str) -> String {
    format!("room:{}:messages", room_id)
}

/// The set of backends the server runs against.
#[derive(Clone)]
pub struct Backends {
    pub recency: Arc<dyn RecencyBackend>,
    pub presence: Arc<dyn PresenceBackend>,
    pub pubsub: Arc<dyn PubSub>,
}

impl Backends {
    /// In-process backends; nothing leaves this node.
    pub fn in_memory() -> Self {
        Self {
            recency: Arc::new(memory::MemoryRecency::default()),
            presence: Arc::new(memory::MemoryPresence::default()),
            pubsub: Arc::new(memory::MemoryPubSub::default()),
        }
    }

    /// Connect to Redis when a URL is configured, otherwise run in-process.
    pub async fn connect(redis_url: Option<&str>) -> Result<Self, BackendError> {
        match redis_url {
            Some(url) => {
                let backend = Arc::new(redis_backend::RedisBackend::connect(url).await?);
                tracing::info!("Connected to Redis");
                Ok(Self {
                    recency: backend.clone(),
                    presence: backend.clone(),
                    pubsub: backend,
                })
            }
            None => {
                tracing::warn!("No redis_url configured, using in-process cache, presence and pub/sub");
                Ok(Self::in_memory())
            }
        }
    }
}
