//! Owned realtime connection manager.
//!
//! One [`RealtimeClient`] per signed-in session. It keeps the socket alive
//! with a fixed-delay retry policy, replays the tracked room set after every
//! (re)connect, and fans server events out to [`Subscription`]s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use khanasathi_proto::{ChatThread, ClientEvent, RoomId, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::policy::ReconnectPolicy;
use crate::poller::OrderPoller;
use crate::rest::ApiClient;
use crate::subscription::{EventFilter, Subscribers, Subscription};
use crate::tracker::RoomTracker;

/// Server close code for an expired access token.
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
/// Server close code for a missing or invalid access token.
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

/// How long the server gets to confirm replayed joins before the socket is
/// treated as lost.
const REPLAY_ACK_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing, or waiting between retries
    Connecting,
    /// Socket up and every tracked room re-joined
    Ready,
    /// Retries exhausted or shut down; nothing further happens automatically
    Disconnected,
    /// The server rejected the token; reconnecting would not help
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint, e.g. `ws://localhost:5000/ws`
    pub ws_url: String,
    pub token: Option<String>,
    /// Owner of the session; their user room is joined on every connect
    pub user_id: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(ws_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: None,
            user_id: user_id.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    fn connect_url(&self) -> String {
        match &self.token {
            Some(token) => format!("{}?token={}", self.ws_url, token),
            None => self.ws_url.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock order: `tracker` before `outbound`.
struct Shared {
    tracker: Mutex<RoomTracker>,
    /// Present only while a socket is up and replay has finished
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    subscribers: Subscribers,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Notify,
    next_request: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?state, "Connection state changed");
                *current = state;
                true
            }
        });
    }

    fn send_now(&self, event: ClientEvent) -> Result<(), ClientError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(event).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    fn request_id(&self) -> String {
        format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct RealtimeClient {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    /// Start connecting in the background. Must be called inside a Tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            tracker: Mutex::new(RoomTracker::new()),
            outbound: Mutex::new(None),
            subscribers: Subscribers::new(),
            state_tx,
            shutdown: Notify::new(),
            next_request: AtomicU64::new(1),
        });
        let task = tokio::spawn(run(shared.clone(), config));
        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the connection reaches `target`. False on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, within: Duration) -> bool {
        let mut rx = self.state_changes();
        let reached = tokio::time::timeout(within, rx.wait_for(|state| *state == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.shared.subscribers.subscribe(filter)
    }

    /// Handle for feeding synthesized events (used by the order poller).
    pub fn subscribers(&self) -> Subscribers {
        self.shared.subscribers.clone()
    }

    /// Poll an order over REST whenever this client is not `Ready`. Status
    /// changes arrive on normal subscriptions as `orderStatusUpdate`.
    pub fn poll_order(&self, api: ApiClient, order_id: impl Into<String>, interval: Duration) -> OrderPoller {
        OrderPoller::spawn(api, order_id, interval, self.state_changes(), self.subscribers())
    }

    /// Track a room. Sent right away when connected, otherwise on the next connect.
    pub fn join_room(&self, room: RoomId) {
        let mut tracker = lock(&self.shared.tracker);
        tracker.join(room.clone());
        if self
            .shared
            .send_now(ClientEvent::Join {
                room_id: room.clone(),
                request_id: None,
            })
            .is_err()
        {
            tracing::debug!(room = %room, "Join deferred until reconnect");
        }
    }

    pub fn leave_room(&self, room: &RoomId) {
        let mut tracker = lock(&self.shared.tracker);
        tracker.leave(room);
        if self
            .shared
            .send_now(ClientEvent::Leave {
                room_id: room.clone(),
                request_id: None,
            })
            .is_err()
        {
            tracing::debug!(room = %room, "Leave deferred until reconnect");
        }
    }

    /// Rooms that will be re-joined on the next connect.
    pub fn rooms(&self) -> Vec<RoomId> {
        lock(&self.shared.tracker).rooms()
    }

    /// Best effort: returns the request id to match against `ack`/`error`.
    pub fn send_message(
        &self,
        order_id: &str,
        content: &str,
        thread: Option<ChatThread>,
        attachments: Vec<String>,
    ) -> Result<String, ClientError> {
        let request_id = self.shared.request_id();
        self.emit(ClientEvent::SendMessage {
            order_id: order_id.to_string(),
            content: content.to_string(),
            thread,
            attachments,
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    pub fn mark_read(&self, order_id: &str, thread: Option<ChatThread>) -> Result<String, ClientError> {
        let request_id = self.shared.request_id();
        self.emit(ClientEvent::MarkRead {
            order_id: order_id.to_string(),
            thread,
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    pub fn typing(&self, order_id: &str, thread: Option<ChatThread>) -> Result<(), ClientError> {
        self.emit(ClientEvent::Typing {
            order_id: order_id.to_string(),
            thread,
        })
    }

    pub fn stop_typing(&self, order_id: &str, thread: Option<ChatThread>) -> Result<(), ClientError> {
        self.emit(ClientEvent::StopTyping {
            order_id: order_id.to_string(),
            thread,
        })
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.shared.send_now(event).inspect_err(|_| {
            tracing::debug!(state = ?self.state(), "Dropped event while not connected");
        })
    }

    /// Close the socket and stop reconnecting.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum SessionEnd {
    Lost,
    Unauthorized(u16),
    Shutdown,
}

async fn run(shared: Arc<Shared>, config: ClientConfig) {
    let mut failures = 0u32;
    loop {
        shared.set_state(ConnectionState::Connecting);

        let dialed = tokio::select! {
            _ = shared.shutdown.notified() => {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            dialed = connect_async(config.connect_url()) => dialed,
        };

        match dialed {
            Ok((socket, _response)) => {
                tracing::info!(user_id = %config.user_id, "Realtime socket connected");
                match session(&shared, &config, socket, &mut failures).await {
                    SessionEnd::Shutdown => {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Unauthorized(code) => {
                        tracing::warn!(close_code = code, "Server rejected token, not reconnecting");
                        shared.set_state(ConnectionState::Unauthorized);
                        return;
                    }
                    SessionEnd::Lost => {
                        tracing::info!(user_id = %config.user_id, "Realtime socket lost");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = failures + 1, "Realtime connect failed");
            }
        }

        failures += 1;
        let Some(delay) = config.reconnect.delay_for(failures) else {
            tracing::warn!(attempts = failures - 1, "Reconnect attempts exhausted");
            shared.set_state(ConnectionState::Disconnected);
            return;
        };
        shared.set_state(ConnectionState::Connecting);
        tokio::select! {
            _ = shared.shutdown.notified() => {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn encode(event: &ClientEvent) -> Result<Message, ClientError> {
    Ok(Message::text(serde_json::to_string(event)?))
}

/// `failures` resets only once the session reaches Ready.
async fn session(
    shared: &Shared,
    config: &ClientConfig,
    socket: Socket,
    failures: &mut u32,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let end = replay_rooms(shared, config, &mut sink, &mut stream, out_tx).await;
    if let Some(end) = end {
        *lock(&shared.outbound) = None;
        return end;
    }
    *failures = 0;
    shared.set_state(ConnectionState::Ready);

    let end = loop {
        tokio::select! {
            _ = shared.shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd::Shutdown;
            }
            Some(event) = out_rx.recv() => {
                let sent = match encode(&event) {
                    Ok(msg) => sink.send(msg).await.is_ok(),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode client event");
                        true
                    }
                };
                if !sent {
                    break SessionEnd::Lost;
                }
            }
            incoming = stream.next() => {
                if let Some(end) = handle_incoming(shared, incoming) {
                    break end;
                }
            }
        }
    };

    *lock(&shared.outbound) = None;
    end
}

/// Join the user room and every tracked room, wait for the server to answer
/// each join, then open the outbound queue. Returns Some when the session
/// ended during replay.
async fn replay_rooms(
    shared: &Shared,
    config: &ClientConfig,
    sink: &mut SplitSink<Socket, Message>,
    stream: &mut SplitStream<Socket>,
    out_tx: mpsc::UnboundedSender<ClientEvent>,
) -> Option<SessionEnd> {
    let replayed = lock(&shared.tracker).rooms();
    let mut pending = HashSet::new();

    let rooms = std::iter::once(RoomId::user(&config.user_id)).chain(replayed.iter().cloned());
    for room in rooms {
        let request_id = shared.request_id();
        pending.insert(request_id.clone());
        let join = ClientEvent::Join {
            room_id: room,
            request_id: Some(request_id),
        };
        let Ok(msg) = encode(&join) else {
            return Some(SessionEnd::Lost);
        };
        if sink.send(msg).await.is_err() {
            // The server may already have closed with a reason; read it
            return Some(read_close_reason(stream).await);
        }
    }

    let answered = tokio::time::timeout(REPLAY_ACK_TIMEOUT, async {
        while !pending.is_empty() {
            let incoming = stream.next().await;
            if let Some(Ok(Message::Text(text))) = &incoming {
                if let Ok(event) = serde_json::from_str::<ServerEvent>(text.as_str()) {
                    match &event {
                        ServerEvent::Ack { request_id, .. } => {
                            pending.remove(request_id);
                        }
                        ServerEvent::Error {
                            request_id: Some(request_id),
                            code,
                            message,
                        } => {
                            tracing::warn!(code, message = %message, "Room re-join rejected");
                            pending.remove(request_id);
                        }
                        _ => {}
                    }
                }
            }
            if let Some(end) = handle_incoming(shared, incoming) {
                return Some(end);
            }
        }
        None
    })
    .await;

    match answered {
        Ok(Some(end)) => return Some(end),
        Ok(None) => {}
        Err(_) => {
            tracing::warn!("Server did not confirm room re-joins in time");
            return Some(SessionEnd::Lost);
        }
    }

    // Rooms joined or left while replay was in flight
    let tracker = lock(&shared.tracker);
    let current = tracker.rooms();
    for room in current.iter().filter(|room| !replayed.contains(room)) {
        let _ = out_tx.send(ClientEvent::Join {
            room_id: room.clone(),
            request_id: None,
        });
    }
    for room in replayed.iter().filter(|room| !current.contains(room)) {
        let _ = out_tx.send(ClientEvent::Leave {
            room_id: room.clone(),
            request_id: None,
        });
    }
    *lock(&shared.outbound) = Some(out_tx);
    tracing::debug!(rooms = current.len(), "Rooms replayed");
    None
}

/// Dispatch one inbound frame. Returns Some when the socket is done.
fn handle_incoming(
    shared: &Shared,
    incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<SessionEnd> {
    match incoming {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    shared.subscribers.dispatch(&event);
                }
                Err(e) => tracing::warn!(error = %e, "Undecodable server event"),
            }
            None
        }
        Some(Ok(Message::Close(frame))) => {
            let code = frame.map(|f| u16::from(f.code));
            Some(close_outcome(code))
        }
        Some(Ok(_)) => None,
        Some(Err(e)) => {
            tracing::debug!(error = %e, "Realtime socket error");
            Some(SessionEnd::Lost)
        }
        None => Some(SessionEnd::Lost),
    }
}

fn close_outcome(code: Option<u16>) -> SessionEnd {
    match code {
        Some(code @ (CLOSE_TOKEN_EXPIRED | CLOSE_TOKEN_INVALID)) => SessionEnd::Unauthorized(code),
        _ => SessionEnd::Lost,
    }
}

async fn read_close_reason(stream: &mut SplitStream<Socket>) -> SessionEnd {
    let read = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    close_outcome(read.ok().flatten())
}
