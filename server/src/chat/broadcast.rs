//! Relay fan-out for chat events.
//! New messages and typing signals go to the order room connections that may
//! read the thread; the other thread members also get a notification in their
//! user room.

use khanasathi_proto::{
    ChatMessage, ChatThread, Notification, NotificationKind, RoomId, ServerEvent,
};

use crate::orders::store::OrderRecord;
use crate::ws::{ConnectionId, Relay};

/// Longest message preview carried in a notification body.
const PREVIEW_CHARS: usize = 80;

/// Broadcast a persisted message to the order room and notify the
/// recipients on its thread.
pub fn broadcast_new_message(relay: &Relay, order: &OrderRecord, message: &ChatMessage) {
    let room = RoomId::order(&order.id);
    relay.emit_to_room_where(
        &room,
        &ServerEvent::NewMessage(message.clone()),
        None,
        |user_id, role| order.can_read_thread_as(user_id, role, message.thread),
    );

    for recipient in order
        .thread_members(message.thread)
        .into_iter()
        .filter(|member| *member != message.sender_id)
    {
        let notification = Notification::new(
            NotificationKind::NewMessage,
            format!("New message from {}", message.sender_name),
            preview(&message.content),
        )
        .for_order(&order.id);
        relay.notify_user(recipient, notification);
    }
}

/// Relay a typing signal to the other readers of the thread.
pub fn broadcast_typing(
    relay: &Relay,
    origin: ConnectionId,
    order: &OrderRecord,
    thread: ChatThread,
    user_id: &str,
    user_name: &str,
    started: bool,
) {
    let order_id = order.id.clone();
    let event = if started {
        ServerEvent::Typing {
            order_id,
            thread,
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        }
    } else {
        ServerEvent::StopTyping {
            order_id,
            thread,
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        }
    };
    relay.emit_to_room_where(&RoomId::order(&order.id), &event, Some(origin), |user_id, role| {
        order.can_read_thread_as(user_id, role, thread)
    });
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
