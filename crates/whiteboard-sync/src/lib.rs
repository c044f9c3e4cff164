/// Real-time collaborative whiteboard synchronization
/// Replicas exchange versioned, tombstoned drawing elements through a
/// room-scoped relay and reconcile them with a last-writer-wins merge
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod element;
pub use element::*;

mod merge;
pub use merge::*;

mod change;
pub use change::*;

mod protocol;
pub use protocol::*;

mod registry;
pub use registry::*;

mod server;
pub use server::*;

mod client;
pub use client::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("connection {0} is not a member of room {1}")]
    NotInRoom(ConnectionId, RoomId),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Application-level user identifier, issued by the host product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collaboration room key. Rooms are keyed by project id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one live transport connection (the wire calls it `socketId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role reported by the host application on `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Supervisor,
    Collaborator,
    Client,
    #[serde(other)]
    Unknown,
}

impl UserRole {
    /// Supervisors receive task-timer presence for every collaborator.
    pub fn is_supervisor(self) -> bool {
        matches!(self, Self::Supervisor)
    }
}
