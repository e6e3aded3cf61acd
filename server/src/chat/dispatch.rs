//! Routes decoded client events.
//!
//! Chat messages are appended to the store and cached before anyone is
//! told about them, so a recipient never sees a message history can't
//! return. Recipients on other nodes are reached over pub/sub.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::auth::Identity;
use crate::chat::cache::RecencyCache;
use crate::chat::models::{Message, NewMessage, Target};
use crate::db::store::MessageStore;
use crate::error::SendError;
use crate::kv::{room_channel, user_channel, PubSub};
use crate::ws::protocol::{
    self, Inbound, JoinRoomBody, MessageBody, Outbound, RoomMessageBody, TypingBody, TypingNotice,
};
use crate::ws::registry::{Delivery, Hub, SessionId};

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Ask a session's relay to listen on another pub/sub channel.
pub struct Subscribe {
    pub channel: String,
    /// Fired once the subscription is in place (or has failed).
    pub ready: Option<oneshot::Sender<()>>,
}

/// The session an event came from.
pub struct SessionContext {
    pub id: SessionId,
    pub identity: Identity,
    pub subscriptions: mpsc::UnboundedSender<Subscribe>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    cache: RecencyCache,
    hub: Hub,
    pubsub: Arc<dyn PubSub>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MessageStore>, cache: RecencyCache, hub: Hub, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            store,
            cache,
            hub,
            pubsub,
        }
    }

    /// Handle one text frame. Malformed frames are logged and dropped.
    pub async fn handle_text(&self, ctx: &SessionContext, text: &str) {
        match protocol::parse(text) {
            Ok(event) => self.dispatch(ctx, event).await,
            Err(e) => {
                tracing::warn!(
                    user_id = %ctx.identity.user_id,
                    error = %e,
                    "Dropping malformed frame"
                );
            }
        }
    }

    pub async fn dispatch(&self, ctx: &SessionContext, event: Inbound) {
        match event {
            Inbound::Message(MessageBody {
                recipient_id: Some(recipient_id),
                content,
            }) => self.direct(ctx, recipient_id, content).await,
            Inbound::Message(MessageBody {
                recipient_id: None,
                content,
            }) => self.global(ctx, content).await,
            Inbound::RoomMessage(body) => self.room(ctx, body).await,
            Inbound::Typing(body) => self.typing(ctx, body),
            Inbound::JoinRoom(body) => self.join_room(ctx, body).await,
        }
    }

    async fn direct(&self, ctx: &SessionContext, recipient_id: String, content: String) {
        if let Err(e) = self.send_direct(&ctx.identity.user_id, &recipient_id, content).await {
            self.reply_failure(ctx, e);
        }
    }

    async fn global(&self, ctx: &SessionContext, content: String) {
        if let Err(e) = self.send_global(&ctx.identity.user_id, content).await {
            self.reply_failure(ctx, e);
        }
    }

    async fn room(&self, ctx: &SessionContext, body: RoomMessageBody) {
        let RoomMessageBody { room_id, content } = body;
        // Posting to a room joins it
        match self.store.rooms_for(&ctx.identity.user_id).await {
            Ok(rooms) if rooms.contains(&room_id) => {}
            Ok(_) => {
                if !self.enter_room(ctx, &room_id).await {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "Failed to check room membership");
                self.reply_error(ctx, "message could not be delivered");
                return;
            }
        }

        if let Err(e) = self.send_room(&ctx.identity.user_id, &room_id, content).await {
            self.reply_failure(ctx, e);
        }
    }

    /// Store a direct message and hand it to the recipient, locally or
    /// over the recipient's user channel.
    pub async fn send_direct(&self, sender_id: &str, recipient_id: &str, content: String) -> Result<Message, SendError> {
        let target = Target::Direct {
            recipient_id: recipient_id.to_string(),
        };
        let message = self.persist(sender_id, target, content).await?;
        let Some(payload) = Outbound::Message(message.clone()).encode() else {
            return Ok(message);
        };

        match self.hub.unicast(recipient_id, payload.clone()).await {
            Delivery::Queued => {}
            Delivery::Evicted => {
                tracing::debug!(recipient = %recipient_id, "Recipient evicted during delivery");
            }
            Delivery::Offline => {
                if let Err(e) = self.pubsub.publish(&user_channel(recipient_id), &payload).await {
                    tracing::warn!(recipient = %recipient_id, error = %e, "Failed to publish direct message");
                }
            }
        }
        Ok(message)
    }

    /// Store a global message and broadcast it to every local session.
    pub async fn send_global(&self, sender_id: &str, content: String) -> Result<Message, SendError> {
        let message = self.persist(sender_id, Target::Broadcast, content).await?;
        if let Some(payload) = Outbound::Message(message.clone()).encode() {
            self.hub.broadcast(payload);
        }
        Ok(message)
    }

    /// Store a room message and publish it on the room channel. Membership
    /// is the caller's concern.
    pub async fn send_room(&self, sender_id: &str, room_id: &str, content: String) -> Result<Message, SendError> {
        let target = Target::Room {
            room_id: room_id.to_string(),
        };
        let message = self.persist(sender_id, target, content).await?;
        // Every member, on every node, listens on the room channel
        if let Some(payload) = Outbound::RoomMessage(message.clone()).encode() {
            if let Err(e) = self.pubsub.publish(&room_channel(room_id), &payload).await {
                tracing::warn!(room_id = %room_id, error = %e, "Failed to publish room message");
            }
        }
        Ok(message)
    }

    fn typing(&self, ctx: &SessionContext, body: TypingBody) {
        let notice = Outbound::Typing(TypingNotice {
            sender_id: ctx.identity.user_id.clone(),
            is_typing: body.is_typing,
        });
        // Ephemeral: local recipients only, never persisted
        if let Some(payload) = notice.encode() {
            self.hub.send(&body.recipient_id, payload);
        }
    }

    async fn join_room(&self, ctx: &SessionContext, body: JoinRoomBody) {
        self.enter_room(ctx, &body.room_id).await;
    }

    /// Record membership and subscribe the session to the room channel.
    async fn enter_room(&self, ctx: &SessionContext, room_id: &str) -> bool {
        if room_id.trim().is_empty() {
            self.reply_error(ctx, "room id must not be empty");
            return false;
        }
        if let Err(e) = self.store.join_room(room_id, &ctx.identity.user_id).await {
            tracing::error!(room_id = %room_id, error = %e, "Failed to join room");
            self.reply_error(ctx, "could not join room");
            return false;
        }
        tracing::info!(user_id = %ctx.identity.user_id, room_id = %room_id, "Joined room");
        let (ready, subscribed) = oneshot::channel();
        let request = Subscribe {
            channel: room_channel(room_id),
            ready: Some(ready),
        };
        if ctx.subscriptions.send(request).is_ok() {
            let _ = subscribed.await;
        }
        true
    }

    /// Validate, append and cache.
    async fn persist(&self, sender_id: &str, target: Target, content: String) -> Result<Message, SendError> {
        validate_content(&content).map_err(SendError::Invalid)?;
        let message = self.store.append(NewMessage::now(sender_id, target, content)).await?;
        self.cache.put(&message).await;
        Ok(message)
    }

    fn reply_failure(&self, ctx: &SessionContext, error: SendError) {
        match error {
            SendError::Invalid(reason) => self.reply_error(ctx, reason),
            SendError::Store(e) => {
                tracing::error!(user_id = %ctx.identity.user_id, error = %e, "Failed to store message");
                self.reply_error(ctx, "message could not be saved");
            }
        }
    }

    fn reply_error(&self, ctx: &SessionContext, message: impl Into<String>) {
        if let Some(payload) = Outbound::error(message).encode() {
            self.hub.deliver(ctx.id, payload);
        }
    }
}

fn validate_content(content: &str) -> Result<(), &'static str> {
    if content.trim().is_empty() {
        return Err("message must not be empty");
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err("message is too long");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hi").is_ok());
        assert!(validate_content("   \n").is_err());
        assert!(validate_content(&"é".repeat(MAX_CONTENT_CHARS)).is_ok());
        assert!(validate_content(&"é".repeat(MAX_CONTENT_CHARS + 1)).is_err());
    }
}
