//! Integration tests for the order endpoints and the events they emit.

mod common;

use std::time::Duration;

use khanasathi_proto::{NotificationKind, OrderStatus, Role, RoomId, ServerEvent};
use serde_json::{json, Value};

use common::*;

#[tokio::test]
async fn test_health() {
    let server = start_test_server().await;
    let body = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let server = start_test_server().await;
    let resp = reqwest::get(server.url("/api/orders")).await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_order_creation_rules() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    // Only customers place orders
    let resp = client
        .post(server.url("/api/orders"))
        .bearer_auth(server.restaurant())
        .json(&json!({ "restaurantId": RESTAURANT, "totalAmount": 100, "deliveryAddress": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .post(server.url("/api/orders"))
        .bearer_auth(server.customer())
        .json(&json!({ "restaurantId": RESTAURANT, "totalAmount": 0, "deliveryAddress": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let order_id = server.create_order().await;

    let resp = client
        .get(server.url(&format!("/api/orders/{order_id}")))
        .bearer_auth(server.token("cust-2", Role::Customer))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .get(server.url("/api/orders/does-not-exist"))
        .bearer_auth(server.admin())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let orders: Vec<Value> = client
        .get(server.url("/api/orders"))
        .bearer_auth(server.restaurant())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["status"], "pending");
}

#[tokio::test]
async fn test_new_order_notifies_restaurant() {
    let server = start_test_server().await;
    let (mut sink, mut stream) = server.ws_connect(&server.restaurant()).await;
    join(&mut sink, &mut stream, RoomId::user(RESTAURANT)).await;

    let order_id = server.create_order().await;
    let notification = wait_for(&mut stream, |event| match event {
        ServerEvent::Notification(n) => Some(n),
        _ => None,
    })
    .await;
    assert_eq!(notification.kind, NotificationKind::NewOrder);
    assert_eq!(notification.order_id.as_deref(), Some(order_id.as_str()));
}

#[tokio::test]
async fn test_status_update_reaches_order_room_and_customer() {
    let server = start_test_server().await;
    let order_id = server.create_order().await;
    let (mut sink, mut stream) = server.ws_connect(&server.customer()).await;
    join(&mut sink, &mut stream, RoomId::order(&order_id)).await;
    join(&mut sink, &mut stream, RoomId::user(CUSTOMER)).await;

    let resp = reqwest::Client::new()
        .put(server.url(&format!("/api/orders/{order_id}/status")))
        .bearer_auth(server.restaurant())
        .json(&json!({ "status": "preparing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut saw_update = false;
    let mut saw_notification = false;
    while !(saw_update && saw_notification) {
        match next_event(&mut stream, Duration::from_secs(5)).await {
            Some(ServerEvent::OrderStatusUpdate { status, .. }) => {
                assert_eq!(status, OrderStatus::Preparing);
                saw_update = true;
            }
            Some(ServerEvent::Notification(n)) => {
                assert_eq!(n.kind, NotificationKind::OrderStatus);
                saw_notification = true;
            }
            Some(_) => continue,
            None => panic!("missing status events"),
        }
    }
}

#[tokio::test]
async fn test_terminal_status_is_final() {
    let server = start_test_server().await;
    let order_id = server.create_order().await;
    let client = reqwest::Client::new();
    let url = server.url(&format!("/api/orders/{order_id}/status"));

    let resp = client
        .put(&url)
        .bearer_auth(server.customer())
        .json(&json!({ "status": "confirmed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .put(&url)
        .bearer_auth(server.restaurant())
        .json(&json!({ "status": "cancelled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .put(&url)
        .bearer_auth(server.admin())
        .json(&json!({ "status": "preparing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_rider_assignment_and_location() {
    let server = start_test_server().await;
    let (mut rider_sink, mut rider_stream) = server.ws_connect(&server.rider()).await;
    join(&mut rider_sink, &mut rider_stream, RoomId::user(RIDER)).await;

    let order_id = server.create_order_with_rider().await;
    let notification = wait_for(&mut rider_stream, |event| match event {
        ServerEvent::Notification(n) => Some(n),
        _ => None,
    })
    .await;
    assert_eq!(notification.kind, NotificationKind::RiderAssigned);

    let (mut sink, mut stream) = server.ws_connect(&server.customer()).await;
    join(&mut sink, &mut stream, RoomId::order(&order_id)).await;

    let client = reqwest::Client::new();
    let url = server.url(&format!("/api/orders/{order_id}/location"));

    let resp = client
        .post(&url)
        .bearer_auth(server.rider())
        .json(&json!({ "lat": 27.7172, "lng": 85.3240 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deliveredTo"], 1);

    let (lat, lng) = wait_for(&mut stream, |event| match event {
        ServerEvent::RiderLocation { lat, lng, .. } => Some((lat, lng)),
        _ => None,
    })
    .await;
    assert!((lat - 27.7172).abs() < 1e-9);
    assert!((lng - 85.3240).abs() < 1e-9);

    let resp = client
        .post(&url)
        .bearer_auth(server.rider())
        .json(&json!({ "lat": 95.0, "lng": 85.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .bearer_auth(server.token("rider-2", Role::DeliveryStaff))
        .json(&json!({ "lat": 27.0, "lng": 85.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn test_reassigned_rider_leaves_order_room() {
    let server = start_test_server().await;
    let order_id = server.create_order_with_rider().await;
    let room = RoomId::order(&order_id);

    let (mut sink, mut stream) = server.ws_connect(&server.rider()).await;
    join(&mut sink, &mut stream, room.clone()).await;
    let connection = server.state.relay.user_connections(RIDER)[0];
    assert!(server.state.relay.is_member(connection, &room));

    let resp = reqwest::Client::new()
        .put(server.url(&format!("/api/orders/{order_id}/assign")))
        .bearer_auth(server.restaurant())
        .json(&json!({ "deliveryStaffId": "rider-2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(!server.state.relay.is_member(connection, &room));

    let resp = reqwest::Client::new()
        .post(server.url(&format!("/api/orders/{order_id}/location")))
        .bearer_auth(server.token("rider-2", Role::DeliveryStaff))
        .json(&json!({ "lat": 27.7, "lng": 85.3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    loop {
        match next_event(&mut stream, Duration::from_millis(300)).await {
            Some(ServerEvent::RiderLocation { .. }) => panic!("replaced rider still tracks the order"),
            Some(_) => continue,
            None => break,
        }
    }
}

#[tokio::test]
async fn test_chat_rest_flow() {
    let server = start_test_server().await;
    let order_id = server.create_order_with_rider().await;
    let client = reqwest::Client::new();
    let messages_url = server.url(&format!("/api/chat/{order_id}/messages"));

    let resp = client
        .post(&messages_url)
        .bearer_auth(server.customer())
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // The restaurant is not part of the customer/rider thread
    let resp = client
        .post(&messages_url)
        .bearer_auth(server.restaurant())
        .json(&json!({ "content": "hi", "thread": "customer_delivery_staff" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    for content in ["Gate is on the left", "Ring twice"] {
        let resp = client
            .post(&messages_url)
            .bearer_auth(server.customer())
            .json(&json!({ "content": content, "thread": "customer_delivery_staff" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }

    let active: Vec<Value> = client
        .get(server.url("/api/chat/active"))
        .bearer_auth(server.rider())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["unreadCount"], 2);
    assert_eq!(active[0]["lastMessage"]["content"], "Ring twice");

    let read: Value = client
        .put(server.url(&format!("/api/chat/{order_id}/read")))
        .bearer_auth(server.rider())
        .json(&json!({ "thread": "customer_delivery_staff" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["updated"], 2);

    // The customer's own messages stay unread for them
    let read: Value = client
        .put(server.url(&format!("/api/chat/{order_id}/read")))
        .bearer_auth(server.customer())
        .json(&json!({ "thread": "customer_delivery_staff" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["updated"], 0);
}
