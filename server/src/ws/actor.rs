use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SelectAll, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;
use crate::chat::dispatch::{SessionContext, Subscribe};
use crate::config::SessionConfig;
use crate::kv::{room_channel, user_channel, PubSub, Subscription};
use crate::state::AppState;
use crate::ws::protocol::{self, Payload, MAX_COALESCED_BYTES};
use crate::ws::registry::{Hub, SessionHandle, SessionId};

/// Close code sent when the hub drops a session that fell behind.
pub const CLOSE_EVICTED: u16 = 4008;

/// Converges reader, writer and relay shutdown on a single unregister.
struct Teardown {
    fired: AtomicBool,
    token: CancellationToken,
    hub: Hub,
    session: SessionId,
}

impl Teardown {
    fn new(hub: Hub, session: SessionId) -> Self {
        Self {
            fired: AtomicBool::new(false),
            token: CancellationToken::new(),
            hub,
            session,
        }
    }

    fn fire(&self, reason: &'static str) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(session = %self.session, reason, "Session teardown");
            self.token.cancel();
            self.hub.unregister(self.session);
        }
    }
}

/// Run one authenticated connection until either side gives up.
///
/// The socket is split into a reader (this task), a writer task that owns
/// the sink and drains the session's outbound queue, and a relay task that
/// forwards pub/sub payloads for the user and their rooms into the hub.
pub async fn run_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let config = state.session.clone();
    let (handle, outbound) = SessionHandle::new(identity.clone(), config.outbound_capacity);
    let session = handle.id;
    let teardown = Arc::new(Teardown::new(state.hub.clone(), session));

    // The user's channel and their rooms are subscribed before the session
    // registers, so nothing published after registration is missed.
    let mut channels = vec![user_channel(&identity.user_id)];
    match state.store.rooms_for(&identity.user_id).await {
        Ok(rooms) => channels.extend(rooms.iter().map(|room_id| room_channel(room_id))),
        Err(e) => tracing::warn!(user_id = %identity.user_id, error = %e, "Failed to load room memberships"),
    }
    let mut subscriptions = SelectAll::new();
    for channel in channels {
        if let Some(subscription) = subscribe(state.pubsub.as_ref(), session, &channel).await {
            subscriptions.push(subscription);
        }
    }

    // Registration is queued before any relayed delivery for this session
    state.hub.register(handle);

    tracing::info!(
        user_id = %identity.user_id,
        session = %session,
        "WebSocket session started"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, teardown.clone(), config.clone()));
    let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel::<Subscribe>();
    let relay = tokio::spawn(relay_loop(
        state.pubsub.clone(),
        state.hub.clone(),
        session,
        subscriptions,
        subscribe_rx,
        teardown.token.clone(),
    ));

    let ctx = SessionContext {
        id: session,
        identity,
        subscriptions: subscribe_tx,
    };
    read_loop(stream, &state, &ctx, &teardown, &config).await;
    teardown.fire("reader finished");

    let _ = writer.await;
    let _ = relay.await;

    tracing::info!(
        user_id = %ctx.identity.user_id,
        session = %session,
        "WebSocket session stopped"
    );
}

/// Dispatch inbound frames until the peer goes quiet, errors or closes.
///
/// Any inbound frame, pongs included, pushes the liveness deadline out by
/// `pong_wait_secs`.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    ctx: &SessionContext,
    teardown: &Teardown,
    config: &SessionConfig,
) {
    let pong_wait = Duration::from_secs(config.pong_wait_secs);
    let mut deadline = Instant::now() + pong_wait;
    let user_id = &ctx.identity.user_id;

    loop {
        let next = tokio::select! {
            _ = teardown.token.cancelled() => break,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Liveness deadline passed, closing session");
                break;
            }
            Ok(None) => {
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(user_id = %user_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        deadline = Instant::now() + pong_wait;

        match msg {
            Message::Text(text) => {
                state.dispatcher.handle_text(ctx, text.as_str()).await;
            }
            Message::Binary(data) => {
                tracing::debug!(user_id = %user_id, bytes = data.len(), "Ignoring binary frame");
            }
            // axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                tracing::info!(user_id = %user_id, reason = ?frame, "Client initiated close");
                break;
            }
        }
    }
}

/// Drain the outbound queue into the socket, pinging on a fixed interval.
///
/// Queued payloads are coalesced into one text frame. The loop ends when a
/// write fails or misses its deadline, when the session is torn down, or
/// when the hub closes the queue, in which case a close frame goes out.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Payload>,
    teardown: Arc<Teardown>,
    config: SessionConfig,
) {
    let write_wait = Duration::from_secs(config.write_wait_secs);
    let ping_every = Duration::from_secs(config.ping_interval_secs.max(1));
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            biased;
            _ = teardown.token.cancelled() => break,
            next = outbound.recv() => match next {
                Some(first) => {
                    let frame = protocol::coalesce(first, &mut outbound, MAX_COALESCED_BYTES);
                    if !send_with_deadline(&mut sink, Message::Text(frame.into()), write_wait).await {
                        break;
                    }
                }
                None => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CLOSE_EVICTED,
                        reason: "Too slow".into(),
                    }));
                    let _ = send_with_deadline(&mut sink, close, write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if !send_with_deadline(&mut sink, Message::Ping(Default::default()), write_wait).await {
                    break;
                }
            }
        }
    }

    teardown.fire("writer finished");
}

async fn send_with_deadline(sink: &mut SplitSink<WebSocket, Message>, msg: Message, deadline: Duration) -> bool {
    match timeout(deadline, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket send failed");
            false
        }
        Err(_) => {
            tracing::warn!("WebSocket write deadline passed");
            false
        }
    }
}

async fn subscribe(pubsub: &dyn PubSub, session: SessionId, channel: &str) -> Option<Subscription> {
    match pubsub.subscribe(channel).await {
        Ok(subscription) => {
            tracing::debug!(session = %session, channel = %channel, "Subscribed");
            Some(subscription)
        }
        Err(e) => {
            tracing::warn!(session = %session, channel = %channel, error = %e, "Subscribe failed");
            None
        }
    }
}

/// Forward pub/sub payloads for this session into the hub, adding
/// channels as the session joins rooms.
async fn relay_loop(
    pubsub: Arc<dyn PubSub>,
    hub: Hub,
    session: SessionId,
    mut subscriptions: SelectAll<Subscription>,
    mut requests: mpsc::UnboundedReceiver<Subscribe>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(request) = requests.recv() => {
                if let Some(subscription) = subscribe(pubsub.as_ref(), session, &request.channel).await {
                    subscriptions.push(subscription);
                }
                if let Some(ready) = request.ready {
                    let _ = ready.send(());
                }
            }
            Some(payload) = subscriptions.next(), if !subscriptions.is_empty() => {
                hub.deliver(session, Payload::from(payload));
            }
        }
    }
}
