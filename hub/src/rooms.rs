//! Room Manager (C6): connection membership per room, keyed either by land
//! proximity (`land_<x>_<y>`) or an explicit session UUID string. A proximity
//! room and its durable chat session (C8) share the same id string.

use crate::connections::ConnId;
use dashmap::DashMap;
use dashmap::DashSet;

/// `land_<x>_<y>`, the proximity room id derived from land coordinates.
pub fn land_room_id(x: i32, y: i32) -> String {
    format!("land_{x}_{y}")
}

#[derive(Default)]
pub struct RoomManager {
    rooms: DashMap<String, DashSet<ConnId>>,
    conn_rooms: DashMap<ConnId, DashSet<String>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `room`. Idempotent.
    pub fn join(&self, conn: ConnId, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn);
        self.conn_rooms
            .entry(conn)
            .or_default()
            .insert(room.to_string());
    }

    /// Removes `conn` from `room`. Garbage collects the room if it is now
    /// empty. Returns `true` if the connection was actually a member.
    pub fn leave(&self, conn: ConnId, room: &str) -> bool {
        let was_member = if let Some(members) = self.rooms.get(room) {
            let removed = members.remove(&conn).is_some();
            removed
        } else {
            false
        };
        if let Some(members) = self.rooms.get(room) {
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
        if let Some(joined) = self.conn_rooms.get(&conn) {
            joined.remove(room);
        }
        was_member
    }

    /// Removes `conn` from every room it had joined (connection close path),
    /// returning the list of rooms it left so callers can clean up
    /// room-scoped state (live broadcaster registrations, etc.).
    pub fn leave_all(&self, conn: ConnId) -> Vec<String> {
        let Some((_, rooms)) = self.conn_rooms.remove(&conn) else {
            return Vec::new();
        };
        let room_ids: Vec<String> = rooms.iter().map(|r| r.clone()).collect();
        for room in &room_ids {
            if let Some(members) = self.rooms.get(room) {
                members.remove(&conn);
                let is_empty = members.is_empty();
                drop(members);
                if is_empty {
                    self.rooms.remove(room);
                }
            }
        }
        room_ids
    }

    /// Snapshot of current room membership, for `broadcast` to iterate over
    /// in one synchronous pass.
    pub fn members(&self, room: &str) -> Vec<ConnId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().map(|c| *c).collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn: ConnId) -> Vec<String> {
        self.conn_rooms
            .get(&conn)
            .map(|r| r.iter().map(|s| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_leave_garbage_collects_empty_rooms() {
        let rm = RoomManager::new();
        rm.join(1, "land_0_0");
        rm.join(2, "land_0_0");
        assert!(rm.room_exists("land_0_0"));
        assert_eq!(rm.members("land_0_0").len(), 2);

        rm.leave(1, "land_0_0");
        assert!(rm.room_exists("land_0_0"));
        rm.leave(2, "land_0_0");
        assert!(!rm.room_exists("land_0_0"));
    }

    #[test]
    fn leave_all_clears_every_membership() {
        let rm = RoomManager::new();
        rm.join(1, "land_0_0");
        rm.join(1, "land_1_1");
        let left = rm.leave_all(1);
        assert_eq!(left.len(), 2);
        assert!(!rm.room_exists("land_0_0"));
        assert!(!rm.room_exists("land_1_1"));
    }

    #[test]
    fn membership_tracked_per_connection_not_per_user() {
        let rm = RoomManager::new();
        // Same user, two connections: both receive broadcasts.
        rm.join(1, "land_5_5");
        rm.join(2, "land_5_5");
        assert_eq!(rm.members("land_5_5").len(), 2);
    }
}
