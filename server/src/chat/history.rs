//! Conversation history: read-through over the recency cache, falling back
//! to the durable store and refilling the cache from it.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::chat::cache::RecencyCache;
use crate::chat::conversation::Conversation;
use crate::chat::models::{Message, Target};
use crate::db::store::MessageStore;
use crate::error::StoreError;
use crate::state::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Clone)]
pub struct History {
    store: Arc<dyn MessageStore>,
    cache: RecencyCache,
}

impl History {
    pub fn new(store: Arc<dyn MessageStore>, cache: RecencyCache) -> Self {
        Self { store, cache }
    }

    /// Up to `limit` messages of a conversation, skipping the newest
    /// `offset`, oldest first.
    ///
    /// The first page is served from the cache when it holds enough
    /// entries. Anything else reads the store, and a first page read from
    /// the store is written back into the cache.
    pub async fn recent(
        &self,
        conversation: &Conversation,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let cacheable = offset == 0 && limit as usize <= self.cache.capacity();
        if cacheable {
            match self.cache.get(conversation, limit as usize).await {
                Ok(mut cached) if cached.len() >= limit as usize => {
                    tracing::debug!(conversation = %conversation, count = cached.len(), "History served from cache");
                    self.overlay_read_flags(conversation, &mut cached).await?;
                    return Ok(cached);
                }
                Ok(cached) => {
                    tracing::debug!(conversation = %conversation, cached = cached.len(), "Cache short, reading store");
                }
                Err(e) => {
                    tracing::warn!(conversation = %conversation, error = %e, "Cache unavailable, reading store");
                }
            }
        }

        let mut messages = self.load(conversation, limit, offset).await?;
        messages.reverse();

        if cacheable {
            for message in &messages {
                self.cache.put(message).await;
            }
        }
        Ok(messages)
    }

    /// Cache entries never carry the read flag; only direct messages can
    /// be marked read, so only direct pages consult the store for it.
    async fn overlay_read_flags(
        &self,
        conversation: &Conversation,
        messages: &mut [Message],
    ) -> Result<(), StoreError> {
        if !matches!(conversation, Conversation::Direct { .. }) {
            return Ok(());
        }
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let read = self.store.read_among(&ids).await?;
        for message in messages.iter_mut() {
            message.is_read = read.contains(&message.id);
        }
        Ok(())
    }

    /// Newest first, straight from the store.
    async fn load(&self, conversation: &Conversation, limit: u32, offset: u32) -> Result<Vec<Message>, StoreError> {
        match conversation {
            Conversation::Global => self.store.global(limit, offset).await,
            Conversation::Direct { low, high } => self.store.between(low, high, limit, offset).await,
            Conversation::Room(room_id) => self.store.for_room(room_id, limit, offset).await,
        }
    }
}

// --- REST handlers ---

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE)
    }

    fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "History query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /api/history/global
pub async fn global_history(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let messages = state
        .history
        .recent(&Conversation::Global, page.limit(), page.offset())
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

/// GET /api/history/direct/{peer}
/// Reading the conversation marks the caller's unread messages as read.
pub async fn direct_history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(peer): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let conversation = Conversation::direct(&caller.user_id, &peer);
    let mut messages = state
        .history
        .recent(&conversation, page.limit(), page.offset())
        .await
        .map_err(internal)?;

    for message in messages.iter_mut() {
        let addressed_to_caller =
            matches!(&message.target, Target::Direct { recipient_id } if *recipient_id == caller.user_id);
        if addressed_to_caller && !message.is_read {
            match state.store.mark_read(message.id).await {
                Ok(_) => message.is_read = true,
                Err(e) => tracing::warn!(message_id = message.id, error = %e, "Failed to mark message read"),
            }
        }
    }
    Ok(Json(messages))
}

/// GET /api/history/room/{room_id}
pub async fn room_history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(room_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let rooms = state.store.rooms_for(&caller.user_id).await.map_err(internal)?;
    if !rooms.contains(&room_id) {
        return Err(StatusCode::FORBIDDEN);
    }
    let messages = state
        .history
        .recent(&Conversation::room(&room_id), page.limit(), page.offset())
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

/// POST /api/messages/{id}/read
/// Only the recipient of a direct message may mark it read.
pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let message = state.store.get(id).await.map_err(internal)?.ok_or(StatusCode::NOT_FOUND)?;
    match &message.target {
        Target::Direct { recipient_id } if *recipient_id == caller.user_id => {
            state.store.mark_read(id).await.map_err(internal)?;
            Ok(StatusCode::NO_CONTENT)
        }
        _ => Err(StatusCode::FORBIDDEN),
    }
}
