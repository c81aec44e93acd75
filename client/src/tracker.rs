//! The rooms a client wants to be in, independent of whether a socket is up.

use std::collections::BTreeSet;

use khanasathi_proto::RoomId;

#[derive(Debug, Default, Clone)]
pub struct RoomTracker {
    rooms: BTreeSet<RoomId>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the room was already tracked.
    pub fn join(&mut self, room: RoomId) -> bool {
        self.rooms.insert(room)
    }

    /// Returns false when the room was not tracked.
    pub fn leave(&mut self, room: &RoomId) -> bool {
        self.rooms.remove(room)
    }

    pub fn contains(&self, room: &RoomId) -> bool {
        self.rooms.contains(room)
    }

    /// Sorted snapshot; this is exactly what gets replayed on reconnect.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
