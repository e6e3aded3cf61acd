//! The hub: one actor that owns every live session on this node.
//!
//! Register, unregister, broadcast and unicast are intents processed one at
//! a time from a FIFO queue, so every session sees broadcasts in the order
//! they were issued. The only state shared outside the actor is the
//! identity index, which the actor alone writes.
//!
//! Delivery never blocks: a payload is offered to a session's bounded
//! outbound queue with `try_send`, and a session whose queue is full is
//! evicted on the spot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use crate::auth::Identity;
use crate::chat::conversation::Conversation;
use crate::chat::history::History;
use crate::chat::presence::PresenceTracker;
use crate::ws::protocol::{Outbound, Payload};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session as seen by the hub. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Registered,
    Unregistering,
    Closed,
}

impl SessionState {
    /// The state after `next`, or `None` if that would move backwards.
    pub fn advance(self, next: SessionState) -> Option<SessionState> {
        (next > self).then_some(next)
    }
}

/// What a connection hands to the hub when it registers.
pub struct SessionHandle {
    pub id: SessionId,
    pub identity: Identity,
    outbound: mpsc::Sender<Payload>,
}

impl SessionHandle {
    /// A fresh session with a bounded outbound queue of `capacity` payloads.
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = SessionHandle {
            id: SessionId::next(),
            identity,
            outbound: tx,
        };
        (handle, rx)
    }
}

/// Outcome of offering a payload to one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// No session for the user on this node.
    Offline,
    /// The user's session could not keep up and was dropped.
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSnapshot {
    pub sessions: usize,
    pub online: Vec<Identity>,
}

enum Intent {
    Register(SessionHandle),
    Unregister(SessionId),
    Broadcast(Payload),
    Unicast {
        user_id: String,
        payload: Payload,
        reply: Option<oneshot::Sender<Delivery>>,
    },
    Deliver {
        session: SessionId,
        payloads: Vec<Payload>,
    },
    Snapshot(oneshot::Sender<HubSnapshot>),
}

#[derive(Debug, Clone)]
struct IndexEntry {
    session: SessionId,
    identity: Identity,
}

/// Cloneable handle to the hub actor.
#[derive(Clone)]
pub struct Hub {
    intents: mpsc::UnboundedSender<Intent>,
    index: Arc<DashMap<String, IndexEntry>>,
}

impl Hub {
    /// Start the hub actor. Must be called inside a tokio runtime.
    ///
    /// Newly registered sessions are sent the latest `history_limit`
    /// global messages.
    pub fn spawn(history: History, presence: PresenceTracker, history_limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = Arc::new(DashMap::new());
        let actor = HubActor {
            sessions: BTreeMap::new(),
            index: index.clone(),
            departed: Vec::new(),
            history,
            presence,
            history_limit,
            intents: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Hub { intents: tx, index }
    }

    fn submit(&self, intent: Intent) -> bool {
        if self.intents.send(intent).is_err() {
            tracing::warn!("Hub stopped, intent dropped");
            return false;
        }
        true
    }

    pub fn register(&self, handle: SessionHandle) {
        self.submit(Intent::Register(handle));
    }

    /// Idempotent; unknown or already removed sessions are ignored.
    pub fn unregister(&self, session: SessionId) {
        self.submit(Intent::Unregister(session));
    }

    /// Offer a payload to every registered session.
    pub fn broadcast(&self, payload: Payload) {
        self.submit(Intent::Broadcast(payload));
    }

    /// Offer a payload to the user's session and report what happened.
    pub async fn unicast(&self, user_id: &str, payload: Payload) -> Delivery {
        let (tx, rx) = oneshot::channel();
        let intent = Intent::Unicast {
            user_id: user_id.to_string(),
            payload,
            reply: Some(tx),
        };
        if !self.submit(intent) {
            return Delivery::Offline;
        }
        rx.await.unwrap_or(Delivery::Offline)
    }

    /// Fire-and-forget unicast for ephemeral events.
    pub fn send(&self, user_id: &str, payload: Payload) {
        self.submit(Intent::Unicast {
            user_id: user_id.to_string(),
            payload,
            reply: None,
        });
    }

    /// Offer a payload to one specific session.
    pub fn deliver(&self, session: SessionId, payload: Payload) {
        self.submit(Intent::Deliver {
            session,
            payloads: vec![payload],
        });
    }

    /// Sessions and online identities as of every intent queued before this call.
    pub async fn snapshot(&self) -> HubSnapshot {
        let (tx, rx) = oneshot::channel();
        if !self.submit(Intent::Snapshot(tx)) {
            return HubSnapshot {
                sessions: 0,
                online: Vec::new(),
            };
        }
        rx.await.unwrap_or(HubSnapshot {
            sessions: 0,
            online: Vec::new(),
        })
    }

    /// Whether the user holds a session on this node.
    pub fn is_local(&self, user_id: &str) -> bool {
        self.index.contains_key(user_id)
    }

    /// Identities with a session on this node, sorted by user id.
    pub fn online(&self) -> Vec<Identity> {
        online_from(&self.index)
    }
}

fn online_from(index: &DashMap<String, IndexEntry>) -> Vec<Identity> {
    let mut online: Vec<Identity> = index.iter().map(|e| e.value().identity.clone()).collect();
    online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    online
}

struct SessionEntry {
    identity: Identity,
    outbound: mpsc::Sender<Payload>,
    state: SessionState,
}

impl SessionEntry {
    fn transition(&mut self, id: SessionId, next: SessionState) {
        match self.state.advance(next) {
            Some(state) => {
                tracing::debug!(session = %id, from = ?self.state, to = ?state, "Session state change");
                self.state = state;
            }
            None => {
                tracing::warn!(session = %id, from = ?self.state, to = ?next, "Rejected backwards session transition");
            }
        }
    }
}

/// A session removed from the hub whose departure is not yet announced.
struct Departure {
    user_id: String,
    /// The user has no other session left here.
    last_session: bool,
}

struct HubActor {
    /// Ordered by id, so broadcasts visit sessions in registration order.
    sessions: BTreeMap<SessionId, SessionEntry>,
    index: Arc<DashMap<String, IndexEntry>>,
    departed: Vec<Departure>,
    history: History,
    presence: PresenceTracker,
    history_limit: usize,
    intents: mpsc::WeakUnboundedSender<Intent>,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Intent>) {
        tracing::debug!("Hub started");
        while let Some(intent) = rx.recv().await {
            self.handle(intent);
            self.announce_departures();
        }
        tracing::debug!("Hub stopped");
    }

    fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Register(handle) => self.register(handle),
            Intent::Unregister(session) => self.unregister(session),
            Intent::Broadcast(payload) => self.broadcast(&payload),
            Intent::Unicast {
                user_id,
                payload,
                reply,
            } => {
                let delivery = match self.index.get(&user_id).map(|e| e.session) {
                    Some(session) => self.offer(session, &payload),
                    None => Delivery::Offline,
                };
                if let Some(reply) = reply {
                    let _ = reply.send(delivery);
                }
            }
            Intent::Deliver { session, payloads } => {
                for payload in &payloads {
                    if self.offer(session, payload) != Delivery::Queued {
                        break;
                    }
                }
            }
            Intent::Snapshot(reply) => {
                let _ = reply.send(HubSnapshot {
                    sessions: self.sessions.len(),
                    online: online_from(&self.index),
                });
            }
        }
    }

    fn register(&mut self, handle: SessionHandle) {
        let SessionHandle {
            id,
            identity,
            outbound,
        } = handle;
        if self.sessions.contains_key(&id) {
            tracing::warn!(session = %id, "Session registered twice, ignoring");
            return;
        }

        let mut entry = SessionEntry {
            identity: identity.clone(),
            outbound,
            state: SessionState::Connecting,
        };
        entry.transition(id, SessionState::Registered);
        self.sessions.insert(id, entry);

        // The newest session owns the identity
        let previous = self.index.insert(
            identity.user_id.clone(),
            IndexEntry {
                session: id,
                identity: identity.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                user_id = %identity.user_id,
                previous = %previous.session,
                session = %id,
                "Identity moved to newer session"
            );
        }
        self.presence.set(&identity.user_id, true);

        tracing::info!(
            user_id = %identity.user_id,
            session = %id,
            sessions = self.sessions.len(),
            "Session registered"
        );

        if let Some(status) = Outbound::status(&identity.user_id, true).encode() {
            self.broadcast(&status);
        }
        self.broadcast_users();
        self.replay_history(id);
    }

    fn unregister(&mut self, id: SessionId) {
        match self.remove(id) {
            Some(departure) => {
                tracing::info!(
                    user_id = %departure.user_id,
                    session = %id,
                    sessions = self.sessions.len(),
                    "Session unregistered"
                );
                self.departed.push(departure);
            }
            None => tracing::debug!(session = %id, "Unregister for unknown session ignored"),
        }
    }

    /// Drop a session: close its queue and release its identity.
    fn remove(&mut self, id: SessionId) -> Option<Departure> {
        let mut entry = self.sessions.remove(&id)?;
        entry.transition(id, SessionState::Unregistering);

        let user_id = entry.identity.user_id.clone();
        let mut last_session = false;
        if self.index.remove_if(&user_id, |_, e| e.session == id).is_some() {
            // Hand the identity to the newest remaining session of the user
            let successor = self
                .sessions
                .iter()
                .filter(|(_, s)| s.identity.user_id == user_id)
                .max_by_key(|(sid, _)| **sid)
                .map(|(sid, s)| IndexEntry {
                    session: *sid,
                    identity: s.identity.clone(),
                });
            match successor {
                Some(successor) => {
                    self.index.insert(user_id.clone(), successor);
                }
                None => {
                    last_session = true;
                    self.presence.set(&user_id, false);
                }
            }
        }

        entry.transition(id, SessionState::Closed);
        // Dropping the entry drops the sender, which closes the queue
        drop(entry);
        Some(Departure { user_id, last_session })
    }

    fn offer(&mut self, id: SessionId, payload: &Payload) -> Delivery {
        let Some(entry) = self.sessions.get(&id) else {
            return Delivery::Offline;
        };
        match entry.outbound.try_send(payload.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %entry.identity.user_id,
                    session = %id,
                    "Outbound queue full, evicting slow session"
                );
                self.evict(id);
                Delivery::Evicted
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session = %id, "Outbound queue closed, evicting session");
                self.evict(id);
                Delivery::Evicted
            }
        }
    }

    fn evict(&mut self, id: SessionId) {
        if let Some(departure) = self.remove(id) {
            self.departed.push(departure);
        }
    }

    fn broadcast(&mut self, payload: &Payload) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.offer(id, payload);
        }
    }

    fn broadcast_users(&mut self) {
        if let Some(users) = Outbound::Users(online_from(&self.index)).encode() {
            self.broadcast(&users);
        }
    }

    /// Tell everyone about sessions removed while handling the last intent,
    /// in removal order. Announcing can evict further sessions; those are
    /// announced after the current batch.
    fn announce_departures(&mut self) {
        while !self.departed.is_empty() {
            for departure in std::mem::take(&mut self.departed) {
                if departure.last_session {
                    if let Some(status) = Outbound::status(&departure.user_id, false).encode() {
                        self.broadcast(&status);
                    }
                }
                self.broadcast_users();
            }
        }
    }

    /// Load recent global history off the actor and hand it back as a
    /// delivery to the new session.
    fn replay_history(&self, session: SessionId) {
        if self.history_limit == 0 {
            return;
        }
        let history = self.history.clone();
        let intents = self.intents.clone();
        let limit = self.history_limit as u32;
        tokio::spawn(async move {
            let messages = match history.recent(&Conversation::Global, limit, 0).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "Failed to load history for new session");
                    return;
                }
            };
            if messages.is_empty() {
                return;
            }
            let payloads: Vec<Payload> = messages
                .into_iter()
                .filter_map(|m| Outbound::Message(m).encode())
                .collect();
            if let Some(intents) = intents.upgrade() {
                let _ = intents.send(Intent::Deliver { session, payloads });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_moves_forward() {
        assert_eq!(
            SessionState::Connecting.advance(SessionState::Registered),
            Some(SessionState::Registered)
        );
        assert_eq!(
            SessionState::Registered.advance(SessionState::Closed),
            Some(SessionState::Closed)
        );
        assert_eq!(SessionState::Closed.advance(SessionState::Registered), None);
        assert_eq!(SessionState::Unregistering.advance(SessionState::Unregistering), None);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
    }
}
