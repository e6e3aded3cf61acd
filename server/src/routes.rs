use axum::{middleware, routing::get, routing::post, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::middleware::VerifierExt;
use crate::chat::{history, messages, presence};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the verifier into request extensions so the AuthUser extractor can find it.
async fn inject_verifier(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut().insert(VerifierExt(state.verifier.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Authenticated routes (Bearer token required, AuthUser extractor validates it)
    let history_routes = Router::new()
        .route("/api/history/global", get(history::global_history))
        .route("/api/history/direct/{peer}", get(history::direct_history))
        .route("/api/history/room/{room_id}", get(history::room_history))
        .route("/api/messages/{id}/read", post(history::mark_read));

    let message_routes = Router::new()
        .route("/api/messages", post(messages::send_message))
        .route("/api/unread", get(messages::unread_count))
        .route("/api/rooms", get(messages::list_rooms))
        .route("/api/rooms/{room_id}/members", get(messages::room_members))
        .route("/api/rooms/{room_id}/messages", post(messages::send_room_message));

    let presence_routes = Router::new()
        .route("/api/presence/{user_id}", get(presence::get_presence))
        .route("/api/online", get(presence::list_online));

    // WebSocket endpoint (auth via query param, not header)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(history_routes)
        .merge(message_routes)
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(state.clone(), inject_verifier))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check with the local session count.
async fn health_check(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.hub.snapshot().await;
    Json(json!({
        "status": "ok",
        "sessions": snapshot.sessions,
    }))
}
