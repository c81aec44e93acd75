use khanasathi_proto::{ChatThread, ClientEvent, RoomId, ServerEvent};

use crate::auth::middleware::Claims;
use crate::chat::broadcast::broadcast_typing;
use crate::chat::messages::{self, SendMessageRequest};
use crate::error::ApiError;
use crate::orders::store::load_order;
use crate::state::AppState;
use crate::ws::broadcast::{send_error, send_event};
use crate::ws::{ConnectionId, ConnectionSender};

/// Per-connection context handed to every inbound frame.
pub struct Session {
    pub connection_id: ConnectionId,
    pub claims: Claims,
    pub tx: ConnectionSender,
}

/// Handle an incoming text (JSON) frame.
/// Decodes the event, dispatches on its kind, and replies with an ack or error
/// when the client asked for one.
pub async fn handle_text_message(text: &str, session: &Session, state: &AppState) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                user_id = %session.claims.sub,
                error = %e,
                "Failed to decode client event"
            );
            send_error(&session.tx, None, 400, &format!("Malformed event: {e}"));
            return;
        }
    };

    let request_id = event.request_id().map(str::to_string);
    match dispatch_event(event, session, state).await {
        Ok(message_id) => {
            if let Some(request_id) = request_id {
                send_event(
                    &session.tx,
                    &ServerEvent::Ack {
                        request_id,
                        message_id,
                    },
                );
            }
        }
        Err(err) => {
            tracing::debug!(
                user_id = %session.claims.sub,
                request_id = ?request_id,
                error = %err,
                "Client event rejected"
            );
            send_error(
                &session.tx,
                request_id.as_deref(),
                err.status().as_u16(),
                &err.to_string(),
            );
        }
    }
}

/// Dispatch a decoded event. Returns the id of a created message, if any.
async fn dispatch_event(
    event: ClientEvent,
    session: &Session,
    state: &AppState,
) -> Result<Option<String>, ApiError> {
    match event {
        ClientEvent::Join { room_id, .. } => {
            join_room(room_id, session, state).await?;
            Ok(None)
        }
        ClientEvent::JoinOrder { order_id, .. } => {
            join_room(RoomId::order(order_id), session, state).await?;
            Ok(None)
        }
        ClientEvent::Leave { room_id, .. } => {
            state.relay.leave(session.connection_id, &room_id);
            Ok(None)
        }
        ClientEvent::SendMessage {
            order_id,
            content,
            thread,
            attachments,
            ..
        } => {
            let request = SendMessageRequest {
                content,
                thread,
                attachments,
            };
            let message =
                messages::send_message(state, &session.claims, &order_id, request).await?;
            Ok(Some(message.id))
        }
        ClientEvent::MarkRead {
            order_id, thread, ..
        } => {
            messages::mark_read(state, &session.claims, &order_id, thread).await?;
            Ok(None)
        }
        ClientEvent::Typing { order_id, thread } => {
            relay_typing(session, state, &order_id, thread, true).await;
            Ok(None)
        }
        ClientEvent::StopTyping { order_id, thread } => {
            relay_typing(session, state, &order_id, thread, false).await;
            Ok(None)
        }
    }
}

/// A user room is private to its user; an order room is open to the order's
/// participants and admins.
async fn join_room(room: RoomId, session: &Session, state: &AppState) -> Result<(), ApiError> {
    match &room {
        RoomId::User(user_id) => {
            if *user_id != session.claims.sub {
                return Err(ApiError::forbidden("Cannot join another user's room"));
            }
        }
        RoomId::Order(order_id) => {
            let order = load_order(&state.db, order_id).await?;
            if !order.can_view(&session.claims) {
                return Err(ApiError::forbidden("Not a participant of this order"));
            }
        }
    }

    tracing::debug!(
        user_id = %session.claims.sub,
        connection_id = session.connection_id,
        room = %room,
        "Joined room"
    );
    state.relay.join(session.connection_id, room);
    Ok(())
}

/// Typing signals only travel inside a room the sender already joined, and
/// only to connections that may read the thread.
async fn relay_typing(
    session: &Session,
    state: &AppState,
    order_id: &str,
    thread: Option<ChatThread>,
    started: bool,
) {
    let room = RoomId::order(order_id);
    if !state.relay.is_member(session.connection_id, &room) {
        tracing::debug!(
            user_id = %session.claims.sub,
            room = %room,
            "Dropped typing signal from non-member"
        );
        return;
    }
    let order = match load_order(&state.db, order_id).await {
        Ok(order) => order,
        Err(e) => {
            tracing::debug!(room = %room, error = %e, "Dropped typing signal");
            return;
        }
    };
    let thread = thread.unwrap_or_default();
    if !order.can_read_thread(&session.claims, thread) {
        tracing::debug!(
            user_id = %session.claims.sub,
            thread = %thread,
            "Dropped typing signal for unreadable thread"
        );
        return;
    }
    broadcast_typing(
        &state.relay,
        session.connection_id,
        &order,
        thread,
        &session.claims.sub,
        &session.claims.name,
        started,
    );
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use khanasathi_proto::Role;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::db::init_in_memory;
    use crate::orders::store::{insert_order, NewOrder};

    fn setup() -> (AppState, String) {
        let db = init_in_memory().unwrap();
        let order_id = {
            let conn = db.lock().unwrap();
            insert_order(
                &conn,
                &NewOrder {
                    customer_id: "cust".into(),
                    restaurant_id: "rest".into(),
                    total_amount: 2500,
                    delivery_address: "Bhaktapur".into(),
                },
            )
            .unwrap()
            .id
        };
        (AppState::new(db, vec![1; 32], RealtimeConfig::default()), order_id)
    }

    fn session(state: &AppState, user: &str, role: Role) -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = state.relay.register(user, role, tx.clone());
        let claims = Claims {
            sub: user.into(),
            name: user.to_uppercase(),
            role,
            iat: 0,
            exp: i64::MAX,
        };
        (
            Session {
                connection_id,
                claims,
                tx,
            },
            rx,
        )
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<ServerEvent> {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Some(serde_json::from_str(text.as_str()).unwrap()),
            _ => None,
        }
    }

    async fn send(session: &Session, state: &AppState, value: serde_json::Value) {
        handle_text_message(&value.to_string(), session, state).await;
    }

    #[tokio::test]
    async fn malformed_frame_gets_400_without_request_id() {
        let (state, _) = setup();
        let (s, mut rx) = session(&state, "cust", Role::Customer);

        handle_text_message("{not json", &s, &state).await;
        match next_event(&mut rx) {
            Some(ServerEvent::Error { request_id, code, .. }) => {
                assert_eq!(code, 400);
                assert!(request_id.is_none());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_own_user_room_is_acked() {
        let (state, _) = setup();
        let (s, mut rx) = session(&state, "cust", Role::Customer);

        send(&s, &state, json!({"event": "join", "data": {"roomId": "user:cust", "requestId": "r1"}})).await;
        assert_eq!(
            next_event(&mut rx),
            Some(ServerEvent::Ack {
                request_id: "r1".into(),
                message_id: None
            })
        );
        assert!(state.relay.is_member(s.connection_id, &RoomId::user("cust")));
    }

    #[tokio::test]
    async fn join_without_request_id_gets_no_ack() {
        let (state, order_id) = setup();
        let (s, mut rx) = session(&state, "rest", Role::Restaurant);

        send(&s, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;
        assert!(next_event(&mut rx).is_none());
        assert!(state.relay.is_member(s.connection_id, &RoomId::order(&order_id)));
    }

    #[tokio::test]
    async fn foreign_rooms_are_forbidden() {
        let (state, order_id) = setup();
        let (s, mut rx) = session(&state, "stranger", Role::Customer);

        send(&s, &state, json!({"event": "join", "data": {"roomId": "user:cust", "requestId": "a"}})).await;
        assert!(matches!(next_event(&mut rx), Some(ServerEvent::Error { code: 403, .. })));

        send(&s, &state, json!({"event": "join", "data": {"roomId": format!("order:{order_id}"), "requestId": "b"}})).await;
        assert!(matches!(next_event(&mut rx), Some(ServerEvent::Error { code: 403, .. })));

        send(&s, &state, json!({"event": "joinOrder", "data": {"orderId": "missing", "requestId": "c"}})).await;
        assert!(matches!(next_event(&mut rx), Some(ServerEvent::Error { code: 404, .. })));

        assert!(state.relay.rooms_of(s.connection_id).is_empty());
    }

    #[tokio::test]
    async fn admin_may_join_any_order_room() {
        let (state, order_id) = setup();
        let (s, _rx) = session(&state, "boss", Role::Admin);
        send(&s, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;
        assert!(state.relay.is_member(s.connection_id, &RoomId::order(&order_id)));
    }

    #[tokio::test]
    async fn send_message_acks_with_message_id_and_fans_out() {
        let (state, order_id) = setup();
        let (customer, mut customer_rx) = session(&state, "cust", Role::Customer);
        let (restaurant, mut restaurant_rx) = session(&state, "rest", Role::Restaurant);
        send(&customer, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;
        send(&restaurant, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;

        send(
            &customer,
            &state,
            json!({"event": "sendMessage", "data": {"orderId": order_id, "content": "Less oil", "requestId": "m1"}}),
        )
        .await;

        let fanned = match next_event(&mut restaurant_rx) {
            Some(ServerEvent::NewMessage(message)) => message,
            other => panic!("expected newMessage, got {other:?}"),
        };
        assert_eq!(fanned.content, "Less oil");

        // The sender is in the room too: newMessage first, then the ack
        assert!(matches!(next_event(&mut customer_rx), Some(ServerEvent::NewMessage(_))));
        assert_eq!(
            next_event(&mut customer_rx),
            Some(ServerEvent::Ack {
                request_id: "m1".into(),
                message_id: Some(fanned.id),
            })
        );
    }

    #[tokio::test]
    async fn typing_relays_to_room_except_sender_and_needs_membership() {
        let (state, order_id) = setup();
        let (customer, mut customer_rx) = session(&state, "cust", Role::Customer);
        let (restaurant, mut restaurant_rx) = session(&state, "rest", Role::Restaurant);
        send(&restaurant, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;

        // Not yet in the room: dropped
        send(&customer, &state, json!({"event": "typing", "data": {"orderId": order_id}})).await;
        assert!(next_event(&mut restaurant_rx).is_none());

        send(&customer, &state, json!({"event": "joinOrder", "data": {"orderId": order_id}})).await;
        send(&customer, &state, json!({"event": "typing", "data": {"orderId": order_id}})).await;
        match next_event(&mut restaurant_rx) {
            Some(ServerEvent::Typing { user_id, thread, .. }) => {
                assert_eq!(user_id, "cust");
                assert_eq!(thread, ChatThread::CustomerRestaurant);
            }
            other => panic!("expected typing, got {other:?}"),
        }
        assert!(next_event(&mut customer_rx).is_none());
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let (state, order_id) = setup();
        let (s, mut rx) = session(&state, "cust", Role::Customer);
        let room = format!("order:{order_id}");
        send(&s, &state, json!({"event": "join", "data": {"roomId": room}})).await;
        for id in ["l1", "l2"] {
            send(&s, &state, json!({"event": "leave", "data": {"roomId": room, "requestId": id}})).await;
            assert!(matches!(next_event(&mut rx), Some(ServerEvent::Ack { .. })));
        }
        assert!(state.relay.rooms_of(s.connection_id).is_empty());
    }
}
