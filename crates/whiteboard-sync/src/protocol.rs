/// Wire protocol between clients and the relay server
/// Every frame is a JSON object `{"event": <name>, "data": <payload>}`
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppState, BinaryFiles, ConnectionId, Element, Result, RoomId, Scene, UserId, UserRole};

/// Pointer position in scene coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
}

impl Pointer {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Kind of task-timer presence event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEventKind {
    TimerStart,
    TimerPause,
    TimerStop,
    TimerUpdate,
    TaskComplete,
}

impl TimerEventKind {
    /// Whether the timer is no longer running after this event
    pub fn ends_timer(self) -> bool {
        matches!(self, Self::TimerStop | Self::TaskComplete)
    }
}

/// Task-timer presence broadcast to supervisors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerEvent {
    #[serde(rename = "type")]
    pub kind: TimerEventKind,
    pub task_id: String,
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub elapsed_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl TimerEvent {
    pub fn new(
        kind: TimerEventKind,
        task_id: impl Into<String>,
        user_id: UserId,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            user_id,
            user_name: user_name.into(),
            task_title: None,
            project_id: None,
            elapsed_seconds: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Identity of a peer joining or leaving a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNotice {
    pub socket_id: ConnectionId,
    pub user_id: UserId,
    pub user_name: String,
}

/// Events sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "authenticate", rename_all = "camelCase")]
    Authenticate {
        user_id: UserId,
        user_name: String,
        user_role: UserRole,
    },

    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "roomID")]
        room_id: RoomId,
    },

    #[serde(rename = "leave-room")]
    LeaveRoom {
        #[serde(rename = "roomID")]
        room_id: RoomId,
    },

    /// Opaque scene delta relayed to the rest of the room
    #[serde(rename = "server-broadcast")]
    ServerBroadcast {
        #[serde(rename = "roomID")]
        room_id: RoomId,
        /// Serialized [`SceneBroadcast`]. Plain JSON despite the wire name.
        #[serde(rename = "encryptedData")]
        data: String,
    },

    #[serde(rename = "cursor-update")]
    CursorUpdate {
        #[serde(rename = "roomID")]
        room_id: RoomId,
        pointer: Pointer,
    },

    /// Ask the peers of a room to push their full scene
    #[serde(rename = "request-full-sync")]
    RequestFullSync {
        #[serde(rename = "roomID")]
        room_id: RoomId,
    },

    #[serde(rename = "get_active_timers")]
    GetActiveTimers,

    #[serde(rename = "timer_event")]
    TimerEvent(TimerEvent),

    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Room this event is scoped to, if any
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::ServerBroadcast { room_id, .. }
            | Self::CursorUpdate { room_id, .. }
            | Self::RequestFullSync { room_id } => Some(room_id),
            _ => None,
        }
    }
}

/// Events sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated { success: bool },

    /// The joiner found the room empty and is its initial source of truth
    #[serde(rename = "first-in-room")]
    FirstInRoom,

    #[serde(rename = "new-user")]
    NewUser(PeerNotice),

    #[serde(rename = "user-left")]
    UserLeft(PeerNotice),

    /// Full membership snapshot
    #[serde(rename = "room-user-change")]
    RoomUserChange(Vec<UserId>),

    #[serde(rename = "client-broadcast", rename_all = "camelCase")]
    ClientBroadcast {
        socket_id: ConnectionId,
        #[serde(rename = "encryptedData")]
        data: String,
    },

    #[serde(rename = "cursor-update", rename_all = "camelCase")]
    CursorUpdate {
        socket_id: ConnectionId,
        pointer: Pointer,
        user_id: UserId,
        user_name: String,
    },

    #[serde(rename = "request-full-sync", rename_all = "camelCase")]
    RequestFullSync { socket_id: ConnectionId },

    #[serde(rename = "active_timers")]
    ActiveTimers(Vec<TimerEvent>),

    #[serde(rename = "timer_event")]
    TimerEvent(TimerEvent),

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Whether a scene broadcast carries a full scene or a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastKind {
    SceneInit,
    SceneUpdate,
}

/// Elements and shared state carried by one broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenePayload {
    pub elements: Vec<Element>,
    #[serde(default)]
    pub app_state: AppState,
    #[serde(default, skip_serializing_if = "BinaryFiles::is_empty")]
    pub files: BinaryFiles,
}

impl ScenePayload {
    pub fn into_scene(self) -> Scene {
        Scene {
            elements: self.elements,
            app_state: self.app_state,
            files: self.files,
        }
    }
}

/// Content of the `encryptedData` field, opaque to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneBroadcast {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub payload: ScenePayload,
    pub timestamp: DateTime<Utc>,
}

impl SceneBroadcast {
    pub fn new(kind: BroadcastKind, payload: ScenePayload) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
