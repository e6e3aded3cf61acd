//! REST endpoints for sending messages, room membership and unread counts.
//!
//! Sends take the same path as WebSocket events: stored and cached first,
//! then delivered to live sessions or published for other nodes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::AuthUser;
use crate::chat::models::Message;
use crate::error::{SendError, StoreError};
use crate::state::AppState;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Absent for a global message.
    pub recipient_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RoomMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadResponse {
    pub unread: u64,
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Message query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn rejected(e: SendError) -> StatusCode {
    match e {
        SendError::Invalid(reason) => {
            tracing::debug!(reason, "Rejected message");
            StatusCode::BAD_REQUEST
        }
        SendError::Store(e) => internal(e),
    }
}

async fn require_member(state: &AppState, user_id: &str, room_id: &str) -> Result<(), StatusCode> {
    let rooms = state.store.rooms_for(user_id).await.map_err(internal)?;
    if rooms.iter().any(|r| r == room_id) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

// --- Handlers ---

/// POST /api/messages
/// Direct message when `recipientId` is set, global message otherwise.
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), StatusCode> {
    let message = match body.recipient_id.as_deref() {
        Some("") => return Err(StatusCode::BAD_REQUEST),
        Some(recipient_id) => state
            .dispatcher
            .send_direct(&caller.user_id, recipient_id, body.content)
            .await
            .map_err(rejected)?,
        None => state
            .dispatcher
            .send_global(&caller.user_id, body.content)
            .await
            .map_err(rejected)?,
    };
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/rooms/{room_id}/messages
/// Members only; joining happens over the WebSocket.
pub async fn send_room_message(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(room_id): Path<String>,
    Json(body): Json<RoomMessageRequest>,
) -> Result<(StatusCode, Json<Message>), StatusCode> {
    require_member(&state, &caller.user_id, &room_id).await?;
    let message = state
        .dispatcher
        .send_room(&caller.user_id, &room_id, body.content)
        .await
        .map_err(rejected)?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /api/rooms
pub async fn list_rooms(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<String>>, StatusCode> {
    let rooms = state.store.rooms_for(&caller.user_id).await.map_err(internal)?;
    Ok(Json(rooms))
}

/// GET /api/rooms/{room_id}/members
pub async fn room_members(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    require_member(&state, &caller.user_id, &room_id).await?;
    let members = state.store.members_of(&room_id).await.map_err(internal)?;
    Ok(Json(members))
}

/// GET /api/unread
/// Unread direct messages addressed to the caller.
pub async fn unread_count(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<UnreadResponse>, StatusCode> {
    let unread = state.store.unread_count(&caller.user_id).await.map_err(internal)?;
    Ok(Json(UnreadResponse { unread }))
}
