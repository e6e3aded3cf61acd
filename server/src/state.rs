use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::chat::cache::RecencyCache;
use crate::chat::dispatch::Dispatcher;
use crate::chat::history::History;
use crate::chat::presence::PresenceTracker;
use crate::config::{CacheConfig, SessionConfig};
use crate::db::store::MessageStore;
use crate::kv::{Backends, PubSub};
use crate::ws::registry::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Durable message log
    pub store: Arc<dyn MessageStore>,
    /// Cache-aside reads over the store
    pub history: History,
    pub presence: PresenceTracker,
    /// Live sessions on this node
    pub hub: Hub,
    pub dispatcher: Dispatcher,
    pub pubsub: Arc<dyn PubSub>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub session: SessionConfig,
}

impl AppState {
    /// Wire the delivery core together and start its background actors.
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn MessageStore>,
        backends: Backends,
        verifier: Arc<dyn IdentityVerifier>,
        session: SessionConfig,
        cache: &CacheConfig,
    ) -> Self {
        let recency = RecencyCache::new(backends.recency, cache);
        let history = History::new(store.clone(), recency.clone());
        let presence = PresenceTracker::spawn(backends.presence);
        let hub = Hub::spawn(history.clone(), presence.clone(), cache.history_limit);
        let dispatcher = Dispatcher::new(store.clone(), recency, hub.clone(), backends.pubsub.clone());

        Self {
            store,
            history,
            presence,
            hub,
            dispatcher,
            pubsub: backends.pubsub,
            verifier,
            session,
        }
    }
}
