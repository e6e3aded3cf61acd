//! Dispatcher routing against a registered hub, without sockets.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use murmur_server::auth::Identity;
use murmur_server::chat::conversation::Conversation;
use murmur_server::chat::dispatch::SessionContext;
use murmur_server::chat::models::{Message, NewMessage, Target};
use murmur_server::config::SessionConfig;
use murmur_server::db::store::MessageStore;
use murmur_server::error::StoreError;
use murmur_server::kv::user_channel;
use murmur_server::state::AppState;
use murmur_server::ws::protocol::{self, Outbound, Payload};
use murmur_server::ws::registry::SessionHandle;
use tokio::sync::mpsc;

use common::{app_state_with, display_name, drain_queue, test_state};

/// Store whose writes always fail.
struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn append(&self, _message: NewMessage) -> Result<Message, StoreError> {
        Err(StoreError::Poisoned)
    }
    async fn get(&self, _id: i64) -> Result<Option<Message>, StoreError> {
        Ok(None)
    }
    async fn between(&self, _a: &str, _b: &str, _limit: u32, _offset: u32) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }
    async fn for_room(&self, _room_id: &str, _limit: u32, _offset: u32) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }
    async fn global(&self, _limit: u32, _offset: u32) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }
    async fn mark_read(&self, _id: i64) -> Result<bool, StoreError> {
        Err(StoreError::Poisoned)
    }
    async fn read_among(&self, _ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        Ok(HashSet::new())
    }
    async fn unread_count(&self, _user_id: &str) -> Result<u64, StoreError> {
        Ok(0)
    }
    async fn join_room(&self, _room_id: &str, _user_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    async fn rooms_for(&self, _user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
    async fn members_of(&self, _room_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

struct Member {
    ctx: SessionContext,
    rx: mpsc::Receiver<Payload>,
}

/// Register a bare session and clear its registration envelopes.
async fn join(state: &AppState, user_id: &str) -> Member {
    let identity = Identity {
        user_id: user_id.to_string(),
        display_name: display_name(user_id),
    };
    let (handle, rx) = SessionHandle::new(identity.clone(), 256);
    let id = handle.id;
    state.hub.register(handle);
    // No relay behind this session
    let (subscriptions, _) = mpsc::unbounded_channel();
    Member {
        ctx: SessionContext {
            id,
            identity,
            subscriptions,
        },
        rx,
    }
}

async fn settle(state: &AppState, members: &mut [&mut Member]) {
    state.hub.snapshot().await;
    for member in members.iter_mut() {
        drain_queue(&mut member.rx);
    }
}

fn messages(events: &[Outbound]) -> Vec<&Message> {
    events
        .iter()
        .filter_map(|e| match e {
            Outbound::Message(m) | Outbound::RoomMessage(m) => Some(m),
            _ => None,
        })
        .collect()
}

async fn send(state: &AppState, from: &Member, frame: serde_json::Value) {
    state.dispatcher.handle_text(&from.ctx, &frame.to_string()).await;
    state.hub.snapshot().await;
}

#[tokio::test]
async fn test_direct_message_reaches_only_recipient() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    let mut bob = join(&state, "bob").await;
    let mut carol = join(&state, "carol").await;
    settle(&state, &mut [&mut alice, &mut bob, &mut carol]).await;

    let frame = serde_json::json!({"type": "message", "content": {"recipientId": "bob", "content": "hi"}});
    send(&state, &alice, frame).await;

    let bob_events = drain_queue(&mut bob.rx);
    let received = messages(&bob_events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender_id, "alice");
    assert_eq!(received[0].content, "hi");

    assert!(messages(&drain_queue(&mut alice.rx)).is_empty());
    assert!(messages(&drain_queue(&mut carol.rx)).is_empty());

    // Already durable and cached by the time bob saw it
    let history = state
        .history
        .recent(&Conversation::direct("bob", "alice"), 10, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, received[0].id);
}

#[tokio::test]
async fn test_message_without_recipient_goes_to_everyone() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    let mut bob = join(&state, "bob").await;
    settle(&state, &mut [&mut alice, &mut bob]).await;

    send(&state, &alice, serde_json::json!({"type": "message", "content": {"content": "hello all"}})).await;

    for member in [&mut alice, &mut bob] {
        let events = drain_queue(&mut member.rx);
        let received = messages(&events);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].target, Target::Broadcast);
    }
}

#[tokio::test]
async fn test_store_failure_replies_error_and_delivers_nothing() {
    let state = app_state_with(Arc::new(FailingStore), SessionConfig::default());
    let mut alice = join(&state, "alice").await;
    let mut bob = join(&state, "bob").await;
    settle(&state, &mut [&mut alice, &mut bob]).await;

    let frame = serde_json::json!({"type": "message", "content": {"recipientId": "bob", "content": "hi"}});
    send(&state, &alice, frame).await;

    let alice_events = drain_queue(&mut alice.rx);
    assert!(matches!(alice_events.as_slice(), [Outbound::Error(_)]));
    assert!(drain_queue(&mut bob.rx).is_empty());
}

#[tokio::test]
async fn test_invalid_content_is_rejected() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    let mut bob = join(&state, "bob").await;
    settle(&state, &mut [&mut alice, &mut bob]).await;

    let too_long = "x".repeat(4001);
    for content in ["   ", too_long.as_str()] {
        let frame = serde_json::json!({"type": "message", "content": {"recipientId": "bob", "content": content}});
        send(&state, &alice, frame).await;
    }

    let alice_events = drain_queue(&mut alice.rx);
    assert_eq!(alice_events.iter().filter(|e| matches!(e, Outbound::Error(_))).count(), 2);
    assert!(drain_queue(&mut bob.rx).is_empty());
    assert!(state.store.between("alice", "bob", 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    settle(&state, &mut [&mut alice]).await;

    state.dispatcher.handle_text(&alice.ctx, "{not json").await;
    state
        .dispatcher
        .handle_text(&alice.ctx, r#"{"type":"unknown","content":{}}"#)
        .await;
    state.hub.snapshot().await;

    assert!(drain_queue(&mut alice.rx).is_empty());
    assert!(state.hub.is_local("alice"));
}

#[tokio::test]
async fn test_offline_recipient_is_published() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    settle(&state, &mut [&mut alice]).await;
    let mut dave_channel = state.pubsub.subscribe(&user_channel("dave")).await.unwrap();

    let frame = serde_json::json!({"type": "message", "content": {"recipientId": "dave", "content": "later"}});
    send(&state, &alice, frame).await;

    let payload = tokio::time::timeout(Duration::from_secs(1), dave_channel.next())
        .await
        .unwrap()
        .unwrap();
    match serde_json::from_str::<Outbound>(&payload).unwrap() {
        Outbound::Message(message) => assert_eq!(message.content, "later"),
        other => panic!("unexpected envelope {:?}", other),
    }
}

#[tokio::test]
async fn test_typing_is_ephemeral() {
    let (state, _dir) = test_state();
    let mut alice = join(&state, "alice").await;
    let mut bob = join(&state, "bob").await;
    settle(&state, &mut [&mut alice, &mut bob]).await;

    let frame = serde_json::json!({"type": "typing", "content": {"recipientId": "bob", "isTyping": true}});
    send(&state, &alice, frame).await;
    // Unknown recipients are dropped silently
    let frame = serde_json::json!({"type": "typing", "content": {"recipientId": "nobody", "isTyping": true}});
    send(&state, &alice, frame).await;

    let bob_events = drain_queue(&mut bob.rx);
    assert!(matches!(
        bob_events.as_slice(),
        [Outbound::Typing(t)] if t.sender_id == "alice" && t.is_typing
    ));
    assert!(drain_queue(&mut alice.rx).is_empty());
    assert!(state.store.between("alice", "bob", 10, 0).await.unwrap().is_empty());
    assert!(protocol::parse(r#"{"type":"typing","content":{"recipientId":"bob"}}"#).is_err());
}
