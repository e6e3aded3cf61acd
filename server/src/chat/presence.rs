//! Presence flags per user.
//!
//! Writes go through a single worker so the online/offline sets for one
//! user land in the backend in the order the registry issued them. Reads go
//! straight to the backend.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::auth::middleware::AuthUser;
use crate::auth::Identity;
use crate::kv::PresenceBackend;
use crate::state::AppState;

enum PresenceCommand {
    Set { user_id: String, online: bool },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PresenceTracker {
    commands: mpsc::UnboundedSender<PresenceCommand>,
    backend: Arc<dyn PresenceBackend>,
}

impl PresenceTracker {
    /// Start the write worker. Must be called inside a tokio runtime.
    pub fn spawn(backend: Arc<dyn PresenceBackend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(backend.clone(), rx));
        Self {
            commands: tx,
            backend,
        }
    }

    /// Queue a flag update without waiting for the backend.
    pub fn set(&self, user_id: &str, online: bool) {
        let command = PresenceCommand::Set {
            user_id: user_id.to_string(),
            online,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(user_id = %user_id, "Presence worker stopped, update dropped");
        }
    }

    /// Current flag, `None` when unknown or the backend is unreachable.
    pub async fn get(&self, user_id: &str) -> Option<bool> {
        match self.backend.is_online(user_id).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Presence lookup failed");
                None
            }
        }
    }

    /// Wait until every update queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PresenceCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_worker(backend: Arc<dyn PresenceBackend>, mut rx: mpsc::UnboundedReceiver<PresenceCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            PresenceCommand::Set { user_id, online } => {
                if let Err(e) = backend.set_online(&user_id, online).await {
                    tracing::warn!(user_id = %user_id, online, error = %e, "Failed to record presence");
                }
            }
            PresenceCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Presence worker stopped");
}

// --- REST handlers ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub user_id: String,
    /// Shared flag; null when nothing was ever recorded.
    pub online: Option<bool>,
    /// Whether the user holds a session on this node.
    pub connected_here: bool,
}

/// GET /api/presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let online = state.presence.get(&user_id).await;
    let connected_here = state.hub.is_local(&user_id);
    Json(PresenceResponse {
        user_id,
        online,
        connected_here,
    })
}

/// GET /api/online
/// Identities with a session on this node.
pub async fn list_online(State(state): State<AppState>, AuthUser(_caller): AuthUser) -> Json<Vec<Identity>> {
    Json(state.hub.online())
}
