//! Room registry: room name to the set of live connections in it.
//!
//! Rooms are created by the first join and dropped when the last member
//! leaves. Locking is sharded per room (via `DashMap`), so joins and
//! leaves in unrelated rooms never contend. [`RoomRegistry::members`]
//! returns a snapshot, and the broadcaster iterates that snapshot with no
//! registry lock held.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use huddle_core::{ChatError, ConnectionId, RoomName};
use tracing::debug;

use crate::websocket::connection::Connection;

type Members = HashMap<ConnectionId, Arc<Connection>>;

/// Receipt for a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    room: RoomName,
    connection_id: ConnectionId,
    members: usize,
}

impl RoomHandle {
    /// Room joined.
    pub fn room(&self) -> &RoomName {
        &self.room
    }

    /// Connection that joined.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Member count right after the join, including the new member.
    pub fn members(&self) -> usize {
        self.members
    }
}

/// Registry of active rooms.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomName, Members>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `room`, creating the room if needed.
    ///
    /// The connection must belong to `room` and must not be closed; a
    /// closed connection is refused with [`ChatError::Closed`]. Joining
    /// twice is a no-op beyond replacing the stored handle.
    pub fn join(
        &self,
        room: &RoomName,
        connection: Arc<Connection>,
    ) -> Result<RoomHandle, ChatError> {
        if connection.room() != room {
            return Err(ChatError::InvalidRoomName(format!(
                "connection {} belongs to room {:?}, not {:?}",
                connection.id(),
                connection.room().as_str(),
                room.as_str()
            )));
        }
        if connection.is_closed() {
            return Err(ChatError::Closed);
        }
        let connection_id = connection.id().clone();
        let members = {
            let mut entry = self.rooms.entry(room.clone()).or_default();
            let _ = entry.insert(connection_id.clone(), connection.clone());
            // A close that raced past the check above may already have run
            // its leave; undo the insert so the member cannot dangle.
            if connection.is_closed() {
                let _ = entry.remove(&connection_id);
                None
            } else {
                Some(entry.len())
            }
        };
        let Some(members) = members else {
            let _ = self.rooms.remove_if(room, |_, members| members.is_empty());
            return Err(ChatError::Closed);
        };
        debug!(room = %room, conn_id = %connection_id, members, "joined room");
        Ok(RoomHandle {
            room: room.clone(),
            connection_id,
            members,
        })
    }

    /// Remove a connection from a room. Idempotent.
    ///
    /// Returns `true` if the connection was a member. Drops the room when
    /// it becomes empty.
    pub fn leave(&self, room: &RoomName, connection_id: &ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => members.remove(connection_id).is_some(),
            None => false,
        };
        // The check and the removal happen under the shard lock, so a
        // concurrent join either lands before (room kept) or recreates it.
        let _ = self.rooms.remove_if(room, |_, members| members.is_empty());
        if removed {
            debug!(room = %room, conn_id = %connection_id, "left room");
        }
        removed
    }

    /// Close `connection` and remove it from its room.
    ///
    /// Only the caller that actually closes the connection performs the
    /// leave, so racing callers (reader, writer, heartbeat, broadcaster)
    /// produce exactly one removal. Returns `true` for that caller.
    pub fn disconnect(&self, connection: &Connection) -> bool {
        if !connection.close() {
            return false;
        }
        let _ = self.leave(connection.room(), connection.id());
        true
    }

    /// Snapshot of the room's current members. Empty for unknown rooms.
    pub fn members(&self, room: &RoomName) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members in `room`.
    pub fn member_count(&self, room: &RoomName) -> usize {
        self.rooms.get(room).map_or(0, |members| members.len())
    }

    /// Whether `connection_id` is currently a member of `room`.
    pub fn contains(&self, room: &RoomName, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total members across all rooms.
    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|entry| entry.value().len()).sum()
    }
}
