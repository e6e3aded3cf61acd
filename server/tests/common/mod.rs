//! Shared harness: an app state over a temp database and in-process
//! backends, a server on a random port, and a line-aware WebSocket client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use murmur_server::auth::jwt::{issue_access_token, JwtVerifier};
use murmur_server::config::{CacheConfig, SessionConfig};
use murmur_server::db::{init_db, store::MessageStore, store::SqliteStore};
use murmur_server::kv::Backends;
use murmur_server::state::AppState;
use murmur_server::ws::protocol::{Outbound, Payload};

pub const SECRET: &[u8] = b"murmur-test-secret-0123456789abc";

pub fn token(user_id: &str) -> String {
    issue_access_token(SECRET, user_id, &display_name(user_id), 3600).unwrap()
}

pub fn display_name(user_id: &str) -> String {
    let mut chars = user_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn sqlite_store(dir: &TempDir) -> Arc<dyn MessageStore> {
    let db = init_db(dir.path().to_str().unwrap()).expect("Failed to init DB");
    Arc::new(SqliteStore::new(db))
}

pub fn app_state_with(store: Arc<dyn MessageStore>, session: SessionConfig) -> AppState {
    AppState::new(
        store,
        Backends::in_memory(),
        Arc::new(JwtVerifier::new(SECRET.to_vec())),
        session,
        &CacheConfig::default(),
    )
}

/// App state over a fresh temp database. Keep the `TempDir` alive.
pub fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let state = app_state_with(sqlite_store(&dir), SessionConfig::default());
    (state, dir)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _dir: TempDir,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn get(&self, path: &str, user_id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("{}{}", self.base_url(), path))
            .bearer_auth(token(user_id))
            .send()
            .await
            .unwrap()
    }

    pub async fn post(&self, path: &str, user_id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}{}", self.base_url(), path))
            .bearer_auth(token(user_id))
            .send()
            .await
            .unwrap()
    }

    pub async fn post_json(&self, path: &str, user_id: &str, body: serde_json::Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}{}", self.base_url(), path))
            .bearer_auth(token(user_id))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Poll until `user_id` has no session left on the hub.
    pub async fn wait_until_gone(&self, user_id: &str, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if !self.state.hub.is_local(user_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !self.state.hub.is_local(user_id)
    }
}

/// Start the server on a random port.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(SessionConfig::default()).await
}

/// Start the server on a random port with custom session limits.
pub async fn start_test_server_with(session: SessionConfig) -> TestServer {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let state = app_state_with(sqlite_store(&dir), session);
    let app = murmur_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        _dir: dir,
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client that splits coalesced frames back into envelopes.
pub struct Client {
    pub user_id: String,
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
    pending: VecDeque<Outbound>,
}

impl Client {
    /// Connect with a raw token; no registration wait.
    pub async fn connect_with_token(addr: SocketAddr, user_id: &str, token: &str) -> Self {
        let url = format!("ws://{}/ws?token={}", addr, token);
        let (socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("WebSocket connect failed");
        let (write, read) = socket.split();
        Self {
            user_id: user_id.to_string(),
            write,
            read,
            pending: VecDeque::new(),
        }
    }

    /// Connect and wait until the hub has registered the session.
    pub async fn connect(addr: SocketAddr, user_id: &str) -> Self {
        let mut client = Self::connect_with_token(addr, user_id, &token(user_id)).await;
        let me = user_id.to_string();
        client
            .expect(|e| matches!(e, Outbound::Status(s) if s.user_id == me && s.is_online))
            .await;
        client
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.write
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("WebSocket send failed");
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }

    /// Next envelope, or `None` on timeout or close.
    pub async fn next_event(&mut self, wait: Duration) -> Option<Outbound> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match tokio::time::timeout(wait, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    for line in text.as_str().split('\n') {
                        let event: Outbound = serde_json::from_str(line)
                            .unwrap_or_else(|e| panic!("Unparseable envelope {:?}: {}", line, e));
                        self.pending.push_back(event);
                    }
                }
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                _ => return None,
            }
        }
    }

    /// Next raw text frame, skipping control frames. Only meaningful when
    /// nothing is buffered from an earlier split frame.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<String> {
        assert!(self.pending.is_empty(), "envelopes still buffered");
        loop {
            match tokio::time::timeout(wait, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return Some(text.as_str().to_string()),
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                _ => return None,
            }
        }
    }

    /// Every envelope up to the server's close frame, and its close code.
    pub async fn read_until_close(&mut self) -> (Vec<Outbound>, Option<u16>) {
        let mut events: Vec<Outbound> = self.pending.drain(..).collect();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    for line in text.as_str().split('\n') {
                        events.push(serde_json::from_str(line).expect("Unparseable envelope"));
                    }
                }
                Ok(Some(Ok(Message::Close(frame)))) => return (events, frame.map(|f| u16::from(f.code))),
                Ok(Some(Ok(_))) => continue,
                _ => return (events, None),
            }
        }
    }

    /// Skip envelopes until one matches; panics after two seconds.
    pub async fn expect<F>(&mut self, matches: F) -> Outbound
    where
        F: Fn(&Outbound) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(left).await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("{}: expected envelope did not arrive", self.user_id),
            }
        }
    }

    /// Every envelope received until the socket is quiet for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<Outbound> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event(quiet).await {
            events.push(event);
        }
        events
    }

    /// Chat messages in what is left of the stream.
    pub async fn drain_messages(&mut self, quiet: Duration) -> Vec<murmur_server::chat::models::Message> {
        self.drain(quiet)
            .await
            .into_iter()
            .filter_map(|e| match e {
                Outbound::Message(m) | Outbound::RoomMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Read until the server closes the socket and return its close code.
    pub async fn close_code(&mut self) -> Option<u16> {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), self.read.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }
}

/// Decode everything currently queued for a session without a socket.
pub fn drain_queue(rx: &mut mpsc::Receiver<Payload>) -> Vec<Outbound> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).expect("Unparseable envelope"));
    }
    events
}
