//! Wire contract for the KhanaSathi realtime channel.
//!
//! Frames are JSON text messages shaped as `{"event": "<name>", "data": {...}}`.
//! Both the relay server and client library depend on this crate so the event
//! names and payload shapes cannot drift apart.

pub mod event;
pub mod model;
pub mod room;

pub use event::{ClientEvent, EventKind, ServerEvent};
pub use model::{ChatMessage, ChatThread, Notification, NotificationKind, OrderStatus, Role};
pub use room::{RoomId, RoomIdError};
