//! In-process backends for single-node deployments and tests.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{PresenceBackend, PubSub, RecencyBackend, Subscription};
use crate::error::BackendError;

/// Buffered payloads per pub/sub channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 1024;

struct Partition {
    /// Ascending by (score, member), like a Redis sorted set.
    entries: Vec<(f64, String)>,
    expires_at: Instant,
}

fn entry_order(a: &(f64, String), b: &(f64, String)) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1))
}

#[derive(Default)]
pub struct MemoryRecency {
    partitions: Mutex<HashMap<String, Partition>>,
}

#[async_trait]
impl RecencyBackend for MemoryRecency {
    async fn push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut partitions = self.partitions.lock().map_err(|_| BackendError::Poisoned)?;
        let now = Instant::now();
        let partition = partitions.entry(key.to_string()).or_insert_with(|| Partition {
            entries: Vec::new(),
            expires_at: now + ttl,
        });
        if partition.expires_at <= now {
            partition.entries.clear();
        }

        // Sorted-set semantics: re-adding a member only moves it
        partition.entries.retain(|(_, m)| m != member);
        let entry = (score, member.to_string());
        let at = partition
            .entries
            .partition_point(|e| entry_order(e, &entry) == Ordering::Less);
        partition.entries.insert(at, entry);

        if partition.entries.len() > cap {
            let excess = partition.entries.len() - cap;
            partition.entries.drain(..excess);
        }
        partition.expires_at = now + ttl;
        Ok(())
    }

    async fn latest(&self, key: &str, limit: usize) -> Result<Vec<String>, BackendError> {
        let mut partitions = self.partitions.lock().map_err(|_| BackendError::Poisoned)?;
        let expired = match partitions.get(key) {
            Some(partition) => partition.expires_at <= Instant::now(),
            None => return Ok(Vec::new()),
        };
        if expired {
            partitions.remove(key);
            return Ok(Vec::new());
        }
        Ok(partitions
            .get(key)
            .map(|p| {
                p.entries
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryPresence {
    flags: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl PresenceBackend for MemoryPresence {
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), BackendError> {
        self.flags
            .lock()
            .map_err(|_| BackendError::Poisoned)?
            .insert(user_id.to_string(), online);
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<Option<bool>, BackendError> {
        Ok(self
            .flags
            .lock()
            .map_err(|_| BackendError::Poisoned)?
            .get(user_id)
            .copied())
    }
}

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Fan-out over `tokio::sync::broadcast`, one sender per channel.
///
/// A channel lives as long as it has subscribers.
#[derive(Default)]
pub struct MemoryPubSub {
    channels: ChannelMap,
}

impl MemoryPubSub {
    /// Channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// One subscriber's receiver. Dropping the last one removes the channel.
struct Listener {
    rx: Option<broadcast::Receiver<String>>,
    channel: String,
    channels: ChannelMap,
}

impl Listener {
    async fn recv(&mut self) -> Option<String> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "Pub/sub subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Receivers are only created and released under the map lock, so
        // the count checked here can't race another subscribe.
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        drop(self.rx.take());
        let unused = channels
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if unused {
            channels.remove(&self.channel);
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let channels = self.channels.lock().map_err(|_| BackendError::Poisoned)?;
        if let Some(sender) = channels.get(channel) {
            // No receivers left means the last listener is mid-drop
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let rx = self
            .channels
            .lock()
            .map_err(|_| BackendError::Poisoned)?
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let listener = Listener {
            rx: Some(rx),
            channel: channel.to_string(),
            channels: self.channels.clone(),
        };
        let stream = futures_util::stream::unfold(listener, |mut listener| async move {
            let payload = listener.recv().await?;
            Some((payload, listener))
        });
        Ok(Box::pin(stream))
    }
}
