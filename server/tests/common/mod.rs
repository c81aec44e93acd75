//! Shared harness for the integration tests: a server on a random port plus
//! raw socket helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use khanasathi_proto::{ClientEvent, Role, RoomId, ServerEvent};
use khanasathi_server::auth::jwt;
use khanasathi_server::config::RealtimeConfig;
use khanasathi_server::state::AppState;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<Socket, Message>;
pub type WsStream = SplitStream<Socket>;

pub const CUSTOMER: &str = "cust-1";
pub const RESTAURANT: &str = "rest-1";
pub const RIDER: &str = "rider-1";
pub const ADMIN: &str = "admin-1";

pub struct TestServer {
    pub base_url: String,
    pub ws_url: String,
    pub state: AppState,
    _data_dir: tempfile::TempDir,
}

/// Start the server on a random port with a fresh data dir.
pub async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = khanasathi_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = jwt::load_or_generate_jwt_secret(&data_dir).expect("Failed to generate JWT secret");
    let state = AppState::new(db, jwt_secret, RealtimeConfig::default());

    let app = khanasathi_server::routes::build_router(state.clone(), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        state,
        _data_dir: tmp_dir,
    }
}

impl TestServer {
    pub fn token(&self, user_id: &str, role: Role) -> String {
        jwt::issue_access_token(&self.state.jwt_secret, user_id, user_id, role, 3600)
            .expect("Failed to issue token")
    }

    pub fn customer(&self) -> String {
        self.token(CUSTOMER, Role::Customer)
    }

    pub fn restaurant(&self) -> String {
        self.token(RESTAURANT, Role::Restaurant)
    }

    pub fn rider(&self) -> String {
        self.token(RIDER, Role::DeliveryStaff)
    }

    pub fn admin(&self) -> String {
        self.token(ADMIN, Role::Admin)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Place an order from CUSTOMER to RESTAURANT and return its id.
    pub async fn create_order(&self) -> String {
        let resp = reqwest::Client::new()
            .post(self.url("/api/orders"))
            .bearer_auth(self.customer())
            .json(&json!({
                "restaurantId": RESTAURANT,
                "totalAmount": 45000,
                "deliveryAddress": "Thamel, Kathmandu",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    /// Place an order and assign RIDER to it.
    pub async fn create_order_with_rider(&self) -> String {
        let order_id = self.create_order().await;
        let resp = reqwest::Client::new()
            .put(self.url(&format!("/api/orders/{order_id}/assign")))
            .bearer_auth(self.restaurant())
            .json(&json!({ "deliveryStaffId": RIDER, "deliveryStaffName": "Hari" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        order_id
    }

    pub async fn ws_connect(&self, token: &str) -> (WsSink, WsStream) {
        let url = format!("{}?token={token}", self.ws_url);
        let (socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("WS connect failed");
        socket.split()
    }
}

pub async fn send_event(sink: &mut WsSink, event: &ClientEvent) {
    let text = serde_json::to_string(event).unwrap();
    sink.send(Message::text(text)).await.unwrap();
}

/// Next decoded server event, skipping control frames. None on timeout or close.
pub async fn next_event(stream: &mut WsStream, within: Duration) -> Option<ServerEvent> {
    tokio::time::timeout(within, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerEvent>(text.as_str()).ok();
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Join a room and wait for its ack.
pub async fn join(sink: &mut WsSink, stream: &mut WsStream, room: RoomId) {
    let request_id = format!("join-{room}");
    send_event(
        sink,
        &ClientEvent::Join {
            room_id: room,
            request_id: Some(request_id.clone()),
        },
    )
    .await;
    loop {
        match next_event(stream, Duration::from_secs(5)).await {
            Some(ServerEvent::Ack { request_id: acked, .. }) if acked == request_id => return,
            Some(ServerEvent::Error { request_id: Some(failed), code, message }) if failed == request_id => {
                panic!("join rejected with {code}: {message}")
            }
            Some(_) => continue,
            None => panic!("no ack for join"),
        }
    }
}

/// Wait for the first event matching `pick`, skipping others.
pub async fn wait_for<T>(
    stream: &mut WsStream,
    mut pick: impl FnMut(ServerEvent) -> Option<T>,
) -> T {
    loop {
        let event = next_event(stream, Duration::from_secs(5))
            .await
            .expect("expected an event before timeout");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

/// Read the close code the server sends, skipping other frames.
pub async fn close_code(stream: &mut WsStream) -> Option<u16> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
