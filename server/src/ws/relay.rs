//! Room membership and fan-out for live WebSocket connections.
//!
//! Membership is process-local and ephemeral: it is rebuilt from client
//! `join` frames after every reconnect and lost when the server restarts.
//! Events go to whoever is in the room at emission time; nothing is queued
//! for connections that join later.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use khanasathi_proto::{Notification, Role, RoomId, ServerEvent};

use super::broadcast::encode_event;
use super::ConnectionSender;

pub type ConnectionId = u64;

struct ConnectionEntry {
    user_id: String,
    role: Role,
    sender: ConnectionSender,
    rooms: HashSet<RoomId>,
}

/// Lock order: a `connections` shard may be held while touching `rooms`,
/// never the reverse.
pub struct Relay {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    next_id: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a new connection. It starts in no rooms.
    pub fn register(&self, user_id: &str, role: Role, sender: ConnectionSender) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            ConnectionEntry {
                user_id: user_id.to_string(),
                role,
                sender,
                rooms: HashSet::new(),
            },
        );
        tracing::debug!(user_id = %user_id, connection_id = id, "Connection registered");
        id
    }

    /// Drop a connection and remove it from every room it joined.
    pub fn unregister(&self, connection_id: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return;
        };
        for room in &entry.rooms {
            self.remove_member(room, connection_id);
        }
        tracing::debug!(
            user_id = %entry.user_id,
            connection_id,
            rooms = entry.rooms.len(),
            "Connection unregistered"
        );
    }

    /// Add a connection to a room. Joining twice is the same as joining once.
    /// Returns false when the connection is unknown.
    pub fn join(&self, connection_id: ConnectionId, room: RoomId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id);
        entry.rooms.insert(room);
        true
    }

    /// Remove a connection from a room. Leaving a room not joined is a no-op.
    /// Returns whether the connection was a member.
    pub fn leave(&self, connection_id: ConnectionId, room: &RoomId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        let was_member = entry.rooms.remove(room);
        self.remove_member(room, connection_id);
        was_member
    }

    /// Take every connection of a user out of a room. Returns how many left.
    pub fn leave_user(&self, user_id: &str, room: &RoomId) -> usize {
        self.user_connections(user_id)
            .into_iter()
            .filter(|id| self.leave(*id, room))
            .count()
    }

    fn remove_member(&self, room: &RoomId, connection_id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    pub fn is_member(&self, connection_id: ConnectionId, room: &RoomId) -> bool {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.rooms.contains(room))
            .unwrap_or(false)
    }

    /// Rooms a connection is currently in, sorted.
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .connections
            .get(&connection_id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Connections currently in a room, sorted.
    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver an event to every connection in a room.
    /// Returns the number of connections the event was handed to.
    pub fn emit_to_room(&self, room: &RoomId, event: &ServerEvent) -> usize {
        self.emit_to_room_where(room, event, None, |_, _| true)
    }

    /// Deliver to the room members whose user id and role pass `allow`,
    /// optionally skipping one connection.
    pub fn emit_to_room_where<F>(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
        allow: F,
    ) -> usize
    where
        F: Fn(&str, Role) -> bool,
    {
        // Snapshot membership so no rooms shard is held while sending
        let members = self.members(room);
        if members.is_empty() {
            return 0;
        }
        let Some(msg) = encode_event(event) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members.into_iter().filter(|id| Some(*id) != except) {
            if let Some(entry) = self.connections.get(&id) {
                if !allow(&entry.user_id, entry.role) {
                    continue;
                }
                if entry.sender.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(
            room = %room,
            event = event.kind().as_str(),
            delivered,
            "Event emitted"
        );
        delivered
    }

    /// Fan a notification out to a user's personal room.
    pub fn notify_user(&self, user_id: &str, notification: Notification) -> usize {
        self.emit_to_room(
            &RoomId::user(user_id),
            &ServerEvent::Notification(notification),
        )
    }

    /// Ask every live connection to close, e.g. on shutdown.
    pub fn close_all(&self, close_code: u16, reason: &str) {
        for entry in self.connections.iter() {
            let frame = CloseFrame {
                code: close_code,
                reason: reason.to_string().into(),
            };
            let _ = entry.sender.send(Message::Close(Some(frame)));
        }
        tracing::info!(connections = self.connections.len(), close_code, "Closing all connections");
    }
}

#[cfg(test)]
mod tests {
    use khanasathi_proto::{NotificationKind, OrderStatus};
    use tokio::sync::mpsc;

    use super::*;

    fn connect(relay: &Relay, user: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        connect_as(relay, user, Role::Customer)
    }

    fn connect_as(
        relay: &Relay,
        user: &str,
        role: Role,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (relay.register(user, role, tx), rx)
    }

    fn status_event(order_id: &str) -> ServerEvent {
        ServerEvent::OrderStatusUpdate {
            order_id: order_id.to_string(),
            status: OrderStatus::Preparing,
            updated_at: chrono::Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }

    #[test]
    fn join_and_leave_apply_in_order() {
        let relay = Relay::new();
        let (conn, _rx) = connect(&relay, "u1");
        let room = RoomId::order("o1");

        // join, join, leave, leave, join -> member
        assert!(relay.join(conn, room.clone()));
        assert!(relay.join(conn, room.clone()));
        assert_eq!(relay.members(&room), vec![conn]);
        assert!(relay.leave(conn, &room));
        assert!(!relay.leave(conn, &room));
        assert!(relay.members(&room).is_empty());
        assert!(relay.join(conn, room.clone()));
        assert!(relay.is_member(conn, &room));
        assert_eq!(relay.rooms_of(conn), vec![room]);
    }

    #[test]
    fn join_unknown_connection_is_rejected() {
        let relay = Relay::new();
        assert!(!relay.join(99, RoomId::order("o1")));
        assert!(relay.members(&RoomId::order("o1")).is_empty());
    }

    #[test]
    fn emit_reaches_only_current_members() {
        let relay = Relay::new();
        let (a, mut rx_a) = connect(&relay, "a");
        let (b, mut rx_b) = connect(&relay, "b");
        let (_c, mut rx_c) = connect(&relay, "c");
        let room = RoomId::order("o1");
        relay.join(a, room.clone());
        relay.join(b, room.clone());

        assert_eq!(relay.emit_to_room(&room, &status_event("o1")), 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn emit_except_skips_origin() {
        let relay = Relay::new();
        let (a, mut rx_a) = connect(&relay, "a");
        let (b, mut rx_b) = connect(&relay, "b");
        let room = RoomId::order("o1");
        relay.join(a, room.clone());
        relay.join(b, room.clone());

        assert_eq!(relay.emit_to_room_where(&room, &status_event("o1"), Some(a), |_, _| true), 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn late_joiner_gets_no_backfill() {
        let relay = Relay::new();
        let (a, mut rx_a) = connect(&relay, "a");
        let room = RoomId::order("o1");

        assert_eq!(relay.emit_to_room(&room, &status_event("o1")), 0);
        relay.join(a, room.clone());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn unregister_removes_connection_from_all_rooms() {
        let relay = Relay::new();
        let (a, _rx) = connect(&relay, "a");
        relay.join(a, RoomId::order("o1"));
        relay.join(a, RoomId::user("a"));

        relay.unregister(a);
        assert_eq!(relay.connection_count(), 0);
        assert!(relay.members(&RoomId::order("o1")).is_empty());
        assert!(relay.members(&RoomId::user("a")).is_empty());
    }

    #[test]
    fn notify_user_targets_user_room() {
        let relay = Relay::new();
        let (a, mut rx_a) = connect(&relay, "a");
        relay.join(a, RoomId::user("a"));

        let sent = relay.notify_user("a", Notification::new(NotificationKind::NewOrder, "New order", "x"));
        assert_eq!(sent, 1);
        let events = drain(&mut rx_a);
        assert!(matches!(events.as_slice(), [ServerEvent::Notification(n)] if n.title == "New order"));
        assert_eq!(relay.notify_user("nobody", Notification::new(NotificationKind::NewOrder, "t", "m")), 0);
    }

    #[test]
    fn close_all_sends_close_frame_to_each_connection() {
        let relay = Relay::new();
        let (_a1, mut rx1) = connect(&relay, "a");
        let (_b1, mut rx2) = connect(&relay, "b");
        relay.close_all(1012, "restart");
        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv() {
                Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, 1012),
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn emit_where_filters_by_user_and_role() {
        let relay = Relay::new();
        let (c, mut rx_c) = connect_as(&relay, "cust", Role::Customer);
        let (r, mut rx_r) = connect_as(&relay, "rest", Role::Restaurant);
        let (a, mut rx_a) = connect_as(&relay, "boss", Role::Admin);
        let room = RoomId::order("o1");
        for id in [c, r, a] {
            relay.join(id, room.clone());
        }

        let sent = relay.emit_to_room_where(&room, &status_event("o1"), Some(a), |user, role| {
            role != Role::Restaurant || user != "rest"
        });
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut rx_c).len(), 1);
        assert!(drain(&mut rx_r).is_empty());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn leave_user_drops_every_connection_of_that_user() {
        let relay = Relay::new();
        let (r1, _rx1) = connect_as(&relay, "rider", Role::DeliveryStaff);
        let (r2, _rx2) = connect_as(&relay, "rider", Role::DeliveryStaff);
        let (other, _rx3) = connect_as(&relay, "rider-2", Role::DeliveryStaff);
        let room = RoomId::order("o1");
        for id in [r1, r2, other] {
            relay.join(id, room.clone());
        }
        relay.join(r1, RoomId::user("rider"));

        assert_eq!(relay.leave_user("rider", &room), 2);
        assert_eq!(relay.members(&room), vec![other]);
        assert!(relay.is_member(r1, &RoomId::user("rider")));
        assert_eq!(relay.leave_user("rider", &room), 0);
    }
}
