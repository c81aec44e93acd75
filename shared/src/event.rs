use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, ChatThread, Notification, OrderStatus};
use crate::room::RoomId;

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Join {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Leave {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    JoinOrder {
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    SendMessage {
        order_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<ChatThread>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    MarkRead {
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<ChatThread>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Typing {
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<ChatThread>,
    },
    StopTyping {
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<ChatThread>,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Join { request_id, .. }
            | Self::Leave { request_id, .. }
            | Self::JoinOrder { request_id, .. }
            | Self::SendMessage { request_id, .. }
            | Self::MarkRead { request_id, .. } => request_id.as_deref(),
            Self::Typing { .. } | Self::StopTyping { .. } => None,
        }
    }
}

/// Frames the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    OrderStatusUpdate {
        order_id: String,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    },
    RiderAssigned {
        order_id: String,
        delivery_staff_id: String,
        #[serde(default)]
        delivery_staff_name: Option<String>,
        assigned_at: DateTime<Utc>,
    },
    RiderLocation {
        order_id: String,
        delivery_staff_id: String,
        lat: f64,
        lng: f64,
        recorded_at: DateTime<Utc>,
    },
    NewMessage(ChatMessage),
    Notification(Notification),
    Typing {
        order_id: String,
        thread: ChatThread,
        user_id: String,
        user_name: String,
    },
    StopTyping {
        order_id: String,
        thread: ChatThread,
        user_id: String,
        user_name: String,
    },
    Ack {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        code: u16,
        message: String,
    },
}

/// Discriminant of [`ServerEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderStatusUpdate,
    RiderAssigned,
    RiderLocation,
    NewMessage,
    Notification,
    Typing,
    StopTyping,
    Ack,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderStatusUpdate => "orderStatusUpdate",
            Self::RiderAssigned => "riderAssigned",
            Self::RiderLocation => "riderLocation",
            Self::NewMessage => "newMessage",
            Self::Notification => "notification",
            Self::Typing => "typing",
            Self::StopTyping => "stopTyping",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OrderStatusUpdate { .. } => EventKind::OrderStatusUpdate,
            Self::RiderAssigned { .. } => EventKind::RiderAssigned,
            Self::RiderLocation { .. } => EventKind::RiderLocation,
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::Notification(_) => EventKind::Notification,
            Self::Typing { .. } => EventKind::Typing,
            Self::StopTyping { .. } => EventKind::StopTyping,
            Self::Ack { .. } => EventKind::Ack,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The order this event concerns, if any.
    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::OrderStatusUpdate { order_id, .. }
            | Self::RiderAssigned { order_id, .. }
            | Self::RiderLocation { order_id, .. }
            | Self::Typing { order_id, .. }
            | Self::StopTyping { order_id, .. } => Some(order_id),
            Self::NewMessage(message) => Some(&message.order_id),
            Self::Notification(notification) => notification.order_id.as_deref(),
            Self::Ack { .. } | Self::Error { .. } => None,
        }
    }

    pub fn error(request_id: Option<&str>, code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            request_id: request_id.map(str::to_string),
            code,
            message: message.into(),
        }
    }
}
