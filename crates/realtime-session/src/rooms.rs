//! Rooms (project-scoped channels) the session believes it has joined.

use std::collections::BTreeSet;

use serde_json::json;

use crate::protocol::control;
use crate::transport::Frame;

/// Local record of joined rooms. The server is never queried; after a
/// reconnect the supervisor replays joins from this set.
#[derive(Debug, Default)]
pub struct RoomSubscriptionManager {
    rooms: BTreeSet<String>,
}

impl RoomSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Returns `false` if the room was already recorded.
    pub fn join(&mut self, room: &str) -> bool {
        self.rooms.insert(room.to_string())
    }

    /// Record a leave. Returns `false` if the room was not recorded.
    pub fn leave(&mut self, room: &str) -> bool {
        self.rooms.remove(room)
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains(room)
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }

    pub fn join_frame(room: &str) -> Frame {
        Frame::new(control::JOIN_ROOM, json!({ "roomId": room }))
    }

    pub fn leave_frame(room: &str) -> Frame {
        Frame::new(control::LEAVE_ROOM, json!({ "roomId": room }))
    }

    /// Join frames for every recorded room, in sorted order.
    pub fn rejoin_frames(&self) -> Vec<Frame> {
        self.rooms.iter().map(|r| Self::join_frame(r)).collect()
    }
}
