/// Server-side registries: who is connected, which rooms they are in,
/// where their cursors are, and which task timers are running
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::{ConnectionId, PeerNotice, Pointer, RoomId, TimerEvent, UserId, UserRole};

/// An authenticated connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: UserRole,
    pub connected_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: impl Into<String>,
        role: UserRole,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            display_name: display_name.into(),
            role,
            connected_at: Utc::now(),
        }
    }

    pub fn notice(&self) -> PeerNotice {
        PeerNotice {
            socket_id: self.connection_id,
            user_id: self.user_id.clone(),
            user_name: self.display_name.clone(),
        }
    }
}

/// Session registry keyed by connection.
///
/// Entries live from `authenticate` until disconnect.
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite; returns the replaced entry
    fn register(&self, participant: Participant) -> Option<Participant>;

    fn get(&self, connection_id: ConnectionId) -> Option<Participant>;

    fn remove(&self, connection_id: ConnectionId) -> Option<Participant>;

    /// Connections currently authenticated with the supervisor role
    fn supervisors(&self) -> Vec<ConnectionId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of running task timers, one entry per task.
pub trait PresenceStore: Send + Sync {
    /// Apply a timer event: a running timer replaces the previous entry for
    /// its task, a stop or completion removes it.
    fn record(&self, event: TimerEvent);

    /// Snapshot of running timers, oldest event first
    fn active_timers(&self) -> Vec<TimerEvent>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<ConnectionId, Participant>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn register(&self, participant: Participant) -> Option<Participant> {
        self.sessions.insert(participant.connection_id, participant)
    }

    fn get(&self, connection_id: ConnectionId) -> Option<Participant> {
        self.sessions.get(&connection_id).map(|entry| entry.value().clone())
    }

    fn remove(&self, connection_id: ConnectionId) -> Option<Participant> {
        self.sessions.remove(&connection_id).map(|(_, participant)| participant)
    }

    fn supervisors(&self) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().role.is_supervisor())
            .map(|entry| *entry.key())
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPresenceStore {
    timers: DashMap<String, TimerEvent>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for InMemoryPresenceStore {
    fn record(&self, event: TimerEvent) {
        if event.kind.ends_timer() {
            self.timers.remove(&event.task_id);
        } else {
            self.timers.insert(event.task_id.clone(), event);
        }
    }

    fn active_timers(&self) -> Vec<TimerEvent> {
        let mut timers: Vec<_> = self.timers.iter().map(|entry| entry.value().clone()).collect();
        timers.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.task_id.cmp(&b.task_id)));
        timers
    }
}

/// Last reported cursor of one participant in one room
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorSnapshot {
    pub pointer: Pointer,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RoomMember {
    connection_id: ConnectionId,
    cursor: Option<CursorSnapshot>,
}

/// Room membership derived from live connections.
///
/// A room exists while it has at least one member; joining an unknown room
/// creates it and the last leave drops it. Members are kept in join order.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Vec<RoomMember>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Returns false if it was already a member.
    pub fn join(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let mut members = self.rooms.entry(room_id.clone()).or_default();
        if members.iter().any(|m| m.connection_id == connection_id) {
            return false;
        }
        members.push(RoomMember {
            connection_id,
            cursor: None,
        });
        true
    }

    /// Remove a connection from a room. Returns false if it was not a member.
    pub fn leave(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|m| m.connection_id != connection_id);
                members.len() != before
            }
            None => false,
        };

        self.rooms.remove_if(room_id, |_, members| members.is_empty());
        removed
    }

    pub fn is_member(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().any(|m| m.connection_id == connection_id))
            .unwrap_or(false)
    }

    /// Members in join order
    pub fn members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.connection_id).collect())
            .unwrap_or_default()
    }

    /// Rooms a connection belongs to
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().iter().any(|m| m.connection_id == connection_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Overwrite the member's cursor. Returns false for non-members.
    pub fn update_cursor(&self, room_id: &RoomId, connection_id: ConnectionId, pointer: Pointer) -> bool {
        let Some(mut members) = self.rooms.get_mut(room_id) else {
            return false;
        };

        match members.iter_mut().find(|m| m.connection_id == connection_id) {
            Some(member) => {
                member.cursor = Some(CursorSnapshot {
                    pointer,
                    updated_at: Utc::now(),
                });
                true
            }
            None => false,
        }
    }

    pub fn cursor(&self, room_id: &RoomId, connection_id: ConnectionId) -> Option<CursorSnapshot> {
        self.rooms.get(room_id).and_then(|members| {
            members
                .iter()
                .find(|m| m.connection_id == connection_id)
                .and_then(|m| m.cursor)
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
