//! Per-conversation recency cache in front of the message store.
//!
//! Entries are JSON-serialized messages scored by timestamp (nanoseconds).
//! A partition keeps the newest `capacity` entries and expires `ttl` after
//! its last write. Failures never surface: the store is authoritative.

use std::sync::Arc;
use std::time::Duration;

use crate::chat::conversation::Conversation;
use crate::chat::models::Message;
use crate::config::CacheConfig;
use crate::error::BackendError;
use crate::kv::RecencyBackend;

#[derive(Clone)]
pub struct RecencyCache {
    backend: Arc<dyn RecencyBackend>,
    capacity: usize,
    ttl: Duration,
}

impl RecencyCache {
    pub fn new(backend: Arc<dyn RecencyBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            capacity: config.capacity,
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache a message that is already durable. Logs and swallows failures.
    pub async fn put(&self, message: &Message) {
        if let Err(e) = self.try_put(message).await {
            tracing::warn!(
                message_id = message.id,
                error = %e,
                "Failed to cache message"
            );
        }
    }

    async fn try_put(&self, message: &Message) -> Result<(), BackendError> {
        // The read flag mutates after append; leaving it out of the member
        // keeps re-caching the same message idempotent.
        let entry = Message {
            is_read: false,
            ..message.clone()
        };
        let member = serde_json::to_string(&entry)?;
        let key = Conversation::of(message).cache_key();
        self.backend
            .push(&key, message.score(), &member, self.capacity, self.ttl)
            .await
    }

    /// Up to `limit` most recent messages of a conversation, oldest first.
    ///
    /// Entries that no longer deserialize are skipped. Scores are f64, so
    /// timestamps closer than a few hundred nanoseconds can share one; the
    /// page is re-sorted on (timestamp, id) instead of trusting member order.
    pub async fn get(&self, conversation: &Conversation, limit: usize) -> Result<Vec<Message>, BackendError> {
        let key = conversation.cache_key();
        let members = self.backend.latest(&key, limit).await?;

        let mut messages: Vec<Message> = members
            .iter()
            .filter_map(|member| match serde_json::from_str::<Message>(member) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable cache entry");
                    None
                }
            })
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(messages)
    }
}
