/// Room-based relay for whiteboard collaboration
/// The server holds no document: it routes scene deltas, cursors and
/// presence between connections and keeps only the in-memory registries
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    ClientEvent, CollaborationError, ConnectionId, InMemoryPresenceStore, InMemorySessionStore,
    Participant, Pointer, PresenceStore, Result, RoomId, RoomRegistry, ServerEvent, SessionStore,
    TimerEvent, UserId, UserRole,
};

/// Outgoing event queue of one connection
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest accepted text frame, in bytes
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Relay core, independent of the socket layer.
///
/// Each connection registers an outbox with [`connect`](Self::connect) and
/// feeds its decoded frames to [`handle_event`](Self::handle_event).
pub struct CollaborationServer {
    config: ServerConfig,
    sessions: Arc<dyn SessionStore>,
    timers: Arc<dyn PresenceStore>,
    rooms: RoomRegistry,
    outboxes: DashMap<ConnectionId, Outbox>,
}

impl CollaborationServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryPresenceStore::new()),
        )
    }

    pub fn with_stores(
        config: ServerConfig,
        sessions: Arc<dyn SessionStore>,
        timers: Arc<dyn PresenceStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            timers,
            rooms: RoomRegistry::new(),
            outboxes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a new connection and return its id and event stream
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(connection_id, tx);
        debug!("Connection {} registered", connection_id);
        (connection_id, rx)
    }

    /// Drop a connection: leave every room, then forget its session
    pub fn disconnect(&self, connection_id: ConnectionId) {
        for room_id in self.rooms.rooms_of(connection_id) {
            self.leave_room(connection_id, &room_id);
        }

        if let Some(participant) = self.sessions.remove(connection_id) {
            info!(
                "User {} ({}) disconnected",
                participant.display_name, participant.user_id
            );
        }

        self.outboxes.remove(&connection_id);
    }

    /// Decode and handle one text frame, replying with an `error` event on
    /// failure. The connection stays open either way.
    pub fn handle_frame(&self, connection_id: ConnectionId, text: &str) {
        if let Err(e) = self.handle_text(connection_id, text) {
            warn!("Rejected frame from {}: {}", connection_id, e);
            self.send(connection_id, ServerEvent::error(e.to_string()));
        }
    }

    pub fn handle_text(&self, connection_id: ConnectionId, text: &str) -> Result<()> {
        if text.len() > self.config.max_message_bytes {
            return Err(CollaborationError::MessageTooLarge {
                size: text.len(),
                limit: self.config.max_message_bytes,
            });
        }

        let event = ClientEvent::from_json(text)?;
        self.handle_event(connection_id, event)
    }

    pub fn handle_event(&self, connection_id: ConnectionId, event: ClientEvent) -> Result<()> {
        if !self.outboxes.contains_key(&connection_id) {
            return Err(CollaborationError::UnknownConnection(connection_id));
        }

        match event {
            ClientEvent::Authenticate {
                user_id,
                user_name,
                user_role,
            } => self.authenticate(connection_id, user_id, user_name, user_role),

            ClientEvent::JoinRoom { room_id } => self.join_room(connection_id, &room_id),

            ClientEvent::LeaveRoom { room_id } => {
                self.require_member(connection_id, &room_id)?;
                self.leave_room(connection_id, &room_id);
                Ok(())
            }

            ClientEvent::ServerBroadcast { room_id, data } => {
                self.require_member(connection_id, &room_id)?;
                debug!(
                    "Relaying {} bytes from {} in room {}",
                    data.len(),
                    connection_id,
                    room_id
                );
                self.send_to_room(
                    &room_id,
                    Some(connection_id),
                    ServerEvent::ClientBroadcast {
                        socket_id: connection_id,
                        data,
                    },
                );
                Ok(())
            }

            ClientEvent::CursorUpdate { room_id, pointer } => {
                self.cursor_update(connection_id, &room_id, pointer)
            }

            ClientEvent::RequestFullSync { room_id } => {
                self.require_member(connection_id, &room_id)?;
                self.send_to_room(
                    &room_id,
                    Some(connection_id),
                    ServerEvent::RequestFullSync {
                        socket_id: connection_id,
                    },
                );
                Ok(())
            }

            ClientEvent::GetActiveTimers => {
                self.require_participant(connection_id)?;
                self.send(
                    connection_id,
                    ServerEvent::ActiveTimers(self.timers.active_timers()),
                );
                Ok(())
            }

            ClientEvent::TimerEvent(timer) => self.timer_event(connection_id, timer),

            ClientEvent::Ping => {
                self.send(connection_id, ServerEvent::Pong);
                Ok(())
            }
        }
    }

    fn authenticate(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        user_name: String,
        role: UserRole,
    ) -> Result<()> {
        let participant = Participant::new(connection_id, user_id, user_name, role);

        if let Some(previous) = self.sessions.register(participant.clone()) {
            debug!(
                "Connection {} re-authenticated (was {})",
                connection_id, previous.user_id
            );
        }
        info!(
            "User {} ({}) authenticated as {:?}",
            participant.display_name, participant.user_id, role
        );

        self.send(connection_id, ServerEvent::Authenticated { success: true });

        // Supervisors connecting mid-session catch up on running timers
        if role.is_supervisor() {
            self.send(
                connection_id,
                ServerEvent::ActiveTimers(self.timers.active_timers()),
            );
        }

        Ok(())
    }

    fn join_room(&self, connection_id: ConnectionId, room_id: &RoomId) -> Result<()> {
        let participant = self.require_participant(connection_id)?;

        if !self.rooms.join(room_id, connection_id) {
            debug!("Connection {} already in room {}", connection_id, room_id);
            return Ok(());
        }

        let members = self.rooms.members(room_id);
        info!(
            "User {} joined room {} ({} members)",
            participant.display_name,
            room_id,
            members.len()
        );

        if members.len() == 1 {
            self.send(connection_id, ServerEvent::FirstInRoom);
        } else {
            self.send_to_room(
                room_id,
                Some(connection_id),
                ServerEvent::NewUser(participant.notice()),
            );
        }

        self.broadcast_membership(room_id);
        Ok(())
    }

    fn leave_room(&self, connection_id: ConnectionId, room_id: &RoomId) {
        if !self.rooms.leave(room_id, connection_id) {
            return;
        }

        if let Some(participant) = self.sessions.get(connection_id) {
            info!("User {} left room {}", participant.display_name, room_id);
            self.send_to_room(room_id, None, ServerEvent::UserLeft(participant.notice()));
        }

        self.broadcast_membership(room_id);
    }

    fn cursor_update(
        &self,
        connection_id: ConnectionId,
        room_id: &RoomId,
        pointer: Pointer,
    ) -> Result<()> {
        let participant = self.require_participant(connection_id)?;
        if !self.rooms.update_cursor(room_id, connection_id, pointer) {
            return Err(CollaborationError::NotInRoom(connection_id, room_id.clone()));
        }

        self.send_to_room(
            room_id,
            Some(connection_id),
            ServerEvent::CursorUpdate {
                socket_id: connection_id,
                pointer,
                user_id: participant.user_id,
                user_name: participant.display_name,
            },
        );
        Ok(())
    }

    fn timer_event(&self, connection_id: ConnectionId, timer: TimerEvent) -> Result<()> {
        self.require_participant(connection_id)?;
        debug!(
            "Timer {:?} for task {} from {}",
            timer.kind, timer.task_id, timer.user_name
        );

        self.timers.record(timer.clone());

        for supervisor in self.sessions.supervisors() {
            if supervisor != connection_id {
                self.send(supervisor, ServerEvent::TimerEvent(timer.clone()));
            }
        }
        Ok(())
    }

    /// Send the deduplicated user ids of a room to all of its members
    fn broadcast_membership(&self, room_id: &RoomId) {
        let mut user_ids: Vec<UserId> = Vec::new();
        for member in self.rooms.members(room_id) {
            if let Some(participant) = self.sessions.get(member) {
                if !user_ids.contains(&participant.user_id) {
                    user_ids.push(participant.user_id);
                }
            }
        }

        self.send_to_room(room_id, None, ServerEvent::RoomUserChange(user_ids));
    }

    fn require_participant(&self, connection_id: ConnectionId) -> Result<Participant> {
        self.sessions
            .get(connection_id)
            .ok_or(CollaborationError::NotAuthenticated)
    }

    fn require_member(&self, connection_id: ConnectionId, room_id: &RoomId) -> Result<()> {
        if self.rooms.is_member(room_id, connection_id) {
            Ok(())
        } else {
            Err(CollaborationError::NotInRoom(connection_id, room_id.clone()))
        }
    }

    /// Fire-and-forget delivery; a closed outbox only means the peer is gone
    fn send(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.outboxes.get(&connection_id) {
            Some(outbox) => {
                if outbox.send(event).is_err() {
                    debug!("Outbox of {} is closed", connection_id);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    fn send_to_room(&self, room_id: &RoomId, exclude: Option<ConnectionId>, event: ServerEvent) {
        for member in self.rooms.members(room_id) {
            if Some(member) == exclude {
                continue;
            }
            self.send(member, event.clone());
        }
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.rooms.members(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn active_timers(&self) -> Vec<TimerEvent> {
        self.timers.active_timers()
    }
}

impl Default for CollaborationServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
