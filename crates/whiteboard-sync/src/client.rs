/// Client side of a collaboration room
/// Applies remote scene deltas through the merge engine and emits local
/// changes (debounced) and cursor moves (throttled)
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{
    detect_modified_elements, ensure_versioning, filter_deleted_elements, merge_scenes,
    prepare_elements_for_broadcast, tombstones_for_removed, AppState, BinaryFiles, BroadcastKind,
    ClientEvent, ConnectionId, Element, Pointer, RoomId, Scene, SceneBroadcast, ScenePayload,
    ServerEvent, UserId,
};

/// Timing and sizing policy of a collaboration session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last local edit before it is broadcast
    pub broadcast_debounce: Duration,
    /// Minimum spacing of outgoing cursor updates
    pub cursor_throttle: Duration,
    /// Elements per broadcast message; larger sets are split
    pub max_elements_per_broadcast: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_debounce: Duration::from_millis(500),
            cursor_throttle: Duration::from_millis(100),
            max_elements_per_broadcast: 1000,
        }
    }
}

/// A remote participant as seen from this client
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub socket_id: ConnectionId,
    pub user_id: UserId,
    pub user_name: String,
    pub pointer: Option<Pointer>,
    pub updated_at: DateTime<Utc>,
}

/// What a handled server event changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    None,
    /// Local scene was merged with remote elements; re-render
    Scene,
    Collaborators,
    Members,
}

#[derive(Default)]
struct SessionState {
    scene: Scene,
    last_broadcast: Vec<Element>,
    last_broadcast_app_state: AppState,
    last_broadcast_files: HashSet<String>,
    collaborators: HashMap<ConnectionId, Collaborator>,
    members: Vec<UserId>,
    debounce: Option<JoinHandle<()>>,
    debounce_generation: u64,
    cursor_sent_at: Option<Instant>,
    pending_pointer: Option<Pointer>,
    cursor_trailing: Option<JoinHandle<()>>,
    left: bool,
}

/// Everything a background timer needs to send on behalf of the session
#[derive(Clone)]
struct Emitter {
    room_id: RoomId,
    config: SessionConfig,
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

impl Emitter {
    fn emit(&self, event: ClientEvent) {
        if self.outbound.send(event).is_err() {
            debug!("Transport for room {} is closed", self.room_id);
        }
    }

    /// Send elements as one or more scene broadcasts. Returns messages sent.
    fn send_scene(
        &self,
        kind: BroadcastKind,
        elements: Vec<Element>,
        app_state: AppState,
        mut files: BinaryFiles,
    ) -> usize {
        let chunk_size = self.config.max_elements_per_broadcast.max(1);
        let chunks: Vec<Vec<Element>> = if elements.is_empty() {
            vec![Vec::new()]
        } else {
            elements.chunks(chunk_size).map(<[Element]>::to_vec).collect()
        };

        let mut sent = 0;
        for chunk in chunks {
            let payload = ScenePayload {
                elements: chunk,
                app_state: app_state.clone(),
                files: std::mem::take(&mut files),
            };
            let data = match SceneBroadcast::new(kind, payload).encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode scene for room {}: {}", self.room_id, e);
                    return sent;
                }
            };
            self.emit(ClientEvent::ServerBroadcast {
                room_id: self.room_id.clone(),
                data,
            });
            sent += 1;
        }
        sent
    }

    /// Bump and broadcast everything changed since the last broadcast.
    fn flush(&self, state: &mut SessionState) -> usize {
        if state.left {
            return 0;
        }

        let tombstones = tombstones_for_removed(&state.last_broadcast, &state.scene.elements);
        let modified = detect_modified_elements(&state.scene.elements, &state.last_broadcast);
        let shared = state.scene.app_state.shared_slice();
        let app_state_changed = state.last_broadcast_app_state != shared;
        let new_files: BinaryFiles = state
            .scene
            .files
            .iter()
            .filter(|(key, _)| !state.last_broadcast_files.contains(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if modified.is_empty() && !app_state_changed && new_files.is_empty() {
            return 0;
        }

        let mut elements = prepare_elements_for_broadcast(&state.scene.elements, &modified);
        elements.extend(tombstones);

        let changed: Vec<Element> = elements
            .iter()
            .filter(|e| modified.contains(&e.id))
            .cloned()
            .collect();

        debug!(
            "Broadcasting {} changed elements to room {}",
            changed.len(),
            self.room_id
        );

        // Local state keeps the bumped versions
        state.scene.elements = elements;
        state.last_broadcast = state.scene.elements.clone();
        state.last_broadcast_app_state = shared.clone();
        state.last_broadcast_files.extend(new_files.keys().cloned());

        self.send_scene(BroadcastKind::SceneUpdate, changed, shared, new_files)
    }

    /// Flush pending edits, then push the whole scene for catch-up.
    fn push_full_scene(&self, state: &mut SessionState) -> usize {
        if state.left {
            return 0;
        }
        self.flush(state);

        let shared = state.scene.app_state.shared_slice();
        self.send_scene(
            BroadcastKind::SceneInit,
            state.scene.elements.clone(),
            shared,
            state.scene.files.clone(),
        )
    }
}

/// Keep known version metadata for elements the editor hands back.
fn adopt_local_edit(known: Option<&Element>, incoming: Element) -> Element {
    match known {
        Some(known) if known.same_content(&incoming) && known.version() >= incoming.version() => {
            known.clone()
        }
        Some(known) if incoming.version.is_none() || known.version() > incoming.version() => {
            Element {
                version: known.version,
                version_nonce: known.version_nonce,
                ..incoming
            }
        }
        _ => incoming,
    }
}

/// One client's participation in one room.
///
/// Must be used from within a Tokio runtime: debounced broadcasts and
/// trailing cursor sends run on spawned timers. Dropping the session leaves
/// the room and discards anything still pending.
pub struct CollabSession {
    emitter: Emitter,
    state: Arc<Mutex<SessionState>>,
}

impl CollabSession {
    /// Join a room. Events for the server go to `outbound`.
    pub fn join(
        room_id: RoomId,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        config: SessionConfig,
    ) -> Self {
        let emitter = Emitter {
            room_id: room_id.clone(),
            config,
            outbound,
        };
        emitter.emit(ClientEvent::JoinRoom { room_id });

        Self {
            emitter,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.emitter.room_id
    }

    /// Apply an edit from the local editor and schedule its broadcast.
    ///
    /// Elements the editor dropped from its list become tombstones on the
    /// next broadcast; tombstones already known are retained.
    pub fn update_local(&self, elements: Vec<Element>, app_state: AppState) {
        let mut state = self.state.lock();
        if state.left {
            return;
        }

        let known: HashMap<&str, &Element> = state
            .scene
            .elements
            .iter()
            .map(|e| (e.id.as_str(), e))
            .collect();
        let incoming_ids: HashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();

        let retained: Vec<Element> = state
            .scene
            .elements
            .iter()
            .filter(|e| e.is_deleted() && !incoming_ids.contains(e.id.as_str()))
            .cloned()
            .collect();

        let mut next: Vec<Element> = elements
            .iter()
            .map(|e| adopt_local_edit(known.get(e.id.as_str()).copied(), e.clone()))
            .collect();
        next.extend(retained);

        state.scene.elements = next;
        state.scene.app_state = app_state;
        self.arm_debounce(&mut state);
    }

    /// Register file blobs referenced by image elements
    pub fn add_files(&self, files: BinaryFiles) {
        let mut state = self.state.lock();
        if state.left {
            return;
        }
        state.scene.files.extend(files);
        self.arm_debounce(&mut state);
    }

    fn arm_debounce(&self, state: &mut SessionState) {
        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        state.debounce_generation += 1;

        let generation = state.debounce_generation;
        let delay = self.emitter.config.broadcast_debounce;
        let shared = Arc::clone(&self.state);
        let emitter = self.emitter.clone();

        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.lock();
            // A newer edit re-armed the timer while this one was waking up
            if state.debounce_generation != generation {
                return;
            }
            state.debounce = None;
            emitter.flush(&mut state);
        }));
    }

    /// Broadcast pending changes immediately instead of waiting out the
    /// debounce. Returns the number of messages sent.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        state.debounce_generation += 1;
        self.emitter.flush(&mut state)
    }

    /// Report the local pointer, at most once per throttle window. A move
    /// inside the window is sent when the window closes, latest position only.
    pub fn move_cursor(&self, pointer: Pointer) {
        let mut state = self.state.lock();
        if state.left {
            return;
        }

        let now = Instant::now();
        let window = self.emitter.config.cursor_throttle;

        match state.cursor_sent_at {
            Some(sent_at) if now.duration_since(sent_at) < window => {
                state.pending_pointer = Some(pointer);
                if state.cursor_trailing.is_some() {
                    return;
                }

                let shared = Arc::clone(&self.state);
                let emitter = self.emitter.clone();
                state.cursor_trailing = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(sent_at + window).await;
                    let mut state = shared.lock();
                    state.cursor_trailing = None;
                    if state.left {
                        return;
                    }
                    if let Some(pointer) = state.pending_pointer.take() {
                        state.cursor_sent_at = Some(Instant::now());
                        emitter.emit(ClientEvent::CursorUpdate {
                            room_id: emitter.room_id.clone(),
                            pointer,
                        });
                    }
                }));
            }
            _ => {
                state.cursor_sent_at = Some(now);
                state.pending_pointer = None;
                self.emitter.emit(ClientEvent::CursorUpdate {
                    room_id: self.emitter.room_id.clone(),
                    pointer,
                });
            }
        }
    }

    /// Ask the room's peers to push their full scene
    pub fn request_full_sync(&self) {
        self.emitter.emit(ClientEvent::RequestFullSync {
            room_id: self.emitter.room_id.clone(),
        });
    }

    /// Apply one event received from the server.
    pub fn handle_event(&self, event: &ServerEvent) -> SessionChange {
        let mut state = self.state.lock();
        if state.left {
            return SessionChange::None;
        }

        match event {
            ServerEvent::ClientBroadcast { socket_id, data } => {
                let broadcast = match SceneBroadcast::decode(data) {
                    Ok(broadcast) => broadcast,
                    Err(e) => {
                        warn!("Dropping malformed broadcast from {}: {}", socket_id, e);
                        return SessionChange::None;
                    }
                };
                debug!(
                    "Merging {:?} with {} elements from {}",
                    broadcast.kind,
                    broadcast.payload.elements.len(),
                    socket_id
                );
                apply_remote(&mut state, broadcast.payload);
                SessionChange::Scene
            }

            ServerEvent::FirstInRoom => {
                debug!("First in room {}", self.emitter.room_id);
                SessionChange::None
            }

            ServerEvent::NewUser(notice) => {
                state.collaborators.insert(
                    notice.socket_id,
                    Collaborator {
                        socket_id: notice.socket_id,
                        user_id: notice.user_id.clone(),
                        user_name: notice.user_name.clone(),
                        pointer: None,
                        updated_at: Utc::now(),
                    },
                );
                self.emitter.push_full_scene(&mut state);
                SessionChange::Collaborators
            }

            ServerEvent::RequestFullSync { socket_id } => {
                debug!("Full sync requested by {}", socket_id);
                self.emitter.push_full_scene(&mut state);
                SessionChange::None
            }

            ServerEvent::UserLeft(notice) => {
                state.collaborators.remove(&notice.socket_id);
                SessionChange::Collaborators
            }

            ServerEvent::CursorUpdate {
                socket_id,
                pointer,
                user_id,
                user_name,
            } => {
                let collaborator = state
                    .collaborators
                    .entry(*socket_id)
                    .or_insert_with(|| Collaborator {
                        socket_id: *socket_id,
                        user_id: user_id.clone(),
                        user_name: user_name.clone(),
                        pointer: None,
                        updated_at: Utc::now(),
                    });
                collaborator.pointer = Some(*pointer);
                collaborator.updated_at = Utc::now();
                SessionChange::Collaborators
            }

            ServerEvent::RoomUserChange(user_ids) => {
                state.members = user_ids.clone();
                SessionChange::Members
            }

            _ => SessionChange::None,
        }
    }

    /// Elements to render: the local scene without tombstones
    pub fn visible_elements(&self) -> Vec<Element> {
        filter_deleted_elements(&self.state.lock().scene.elements)
    }

    /// Full local scene, tombstones included
    pub fn scene(&self) -> Scene {
        self.state.lock().scene.clone()
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut collaborators: Vec<_> = self.state.lock().collaborators.values().cloned().collect();
        collaborators.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        collaborators
    }

    pub fn members(&self) -> Vec<UserId> {
        self.state.lock().members.clone()
    }

    /// Leave the room. Pending broadcasts are discarded, not flushed.
    pub fn leave(self) {
        // Drop does the work
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.left {
            return;
        }
        state.left = true;

        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        if let Some(handle) = state.cursor_trailing.take() {
            handle.abort();
        }

        self.emitter.emit(ClientEvent::LeaveRoom {
            room_id: self.emitter.room_id.clone(),
        });
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Merge a remote payload into local state.
///
/// Ids where the remote copy won are recorded as already broadcast so they
/// are not echoed back as local changes.
fn apply_remote(state: &mut SessionState, payload: ScenePayload) {
    let remote = payload.into_scene();
    let merged = merge_scenes(&state.scene, &remote);

    let before: HashMap<&str, &Element> = state
        .scene
        .elements
        .iter()
        .map(|e| (e.id.as_str(), e))
        .collect();
    let remote_ids: HashSet<&str> = remote.elements.iter().map(|e| e.id.as_str()).collect();
    let remote_winners: Vec<Element> = merged
        .elements
        .iter()
        .filter(|e| remote_ids.contains(e.id.as_str()))
        .filter(|e| {
            before
                .get(e.id.as_str())
                .map_or(true, |local| ensure_versioning((*local).clone()) != **e)
        })
        .cloned()
        .collect();

    if !remote_winners.is_empty() {
        let winner_ids: HashSet<&str> = remote_winners.iter().map(|e| e.id.as_str()).collect();
        state
            .last_broadcast
            .retain(|e| !winner_ids.contains(e.id.as_str()));
        state.last_broadcast.extend(remote_winners.iter().cloned());
    }

    // Remote app state only counts as broadcast when no local change is pending
    if state.scene.app_state.shared_slice() == state.last_broadcast_app_state {
        state.last_broadcast_app_state = merged.app_state.shared_slice();
    }
    state.last_broadcast_files.extend(remote.files.into_keys());
    state.scene = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopt_keeps_known_version_for_unchanged() {
        let known = Element::new("a").with_attribute("x", 1).with_version(5, 9);
        let incoming = Element::unversioned("a").with_attribute("x", 1).with_deleted(false);

        assert_eq!(adopt_local_edit(Some(&known), incoming), known);
    }

    #[test]
    fn test_adopt_carries_version_into_edit() {
        let known = Element::new("a").with_attribute("x", 1).with_version(5, 9);
        let incoming = Element::unversioned("a").with_attribute("x", 2);

        let adopted = adopt_local_edit(Some(&known), incoming);
        assert_eq!(adopted.version(), 5);
        assert_eq!(adopted.version_nonce(), 9);
        assert_eq!(adopted.attributes.get("x"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_adopt_prefers_newer_editor_version() {
        let known = Element::new("a").with_version(2, 1);
        let incoming = Element::new("a").with_attribute("x", 3).with_version(8, 4);

        assert_eq!(adopt_local_edit(Some(&known), incoming.clone()), incoming);
        assert_eq!(adopt_local_edit(None, incoming.clone()), incoming);
    }

    #[test]
    fn test_apply_remote_keeps_unversioned_local_edit_pending() {
        let mut state = SessionState::default();
        let pending = Element::unversioned("a").with_attribute("x", 2);
        state.scene.elements = vec![pending.clone()];

        apply_remote(
            &mut state,
            ScenePayload {
                elements: vec![Element::unversioned("a")
                    .with_attribute("x", 1)
                    .with_version(1, u32::MAX)],
                ..ScenePayload::default()
            },
        );

        assert!(state.last_broadcast.is_empty());
        assert!(detect_modified_elements(&state.scene.elements, &state.last_broadcast).contains("a"));
    }

    #[test]
    fn test_apply_remote_does_not_mark_local_win_as_broadcast() {
        let mut state = SessionState::default();
        let pending = Element::new("a").with_attribute("x", 2).with_version(5, 1);
        state.scene.elements = vec![pending.clone()];
        state.last_broadcast = vec![Element::new("a").with_attribute("x", 1).with_version(5, 1)];

        apply_remote(
            &mut state,
            ScenePayload {
                elements: vec![
                    Element::new("a").with_version(3, 1),
                    Element::new("b").with_version(1, 1),
                ],
                ..ScenePayload::default()
            },
        );

        assert_eq!(state.scene.elements[0], pending);
        let broadcast_ids: Vec<_> = state.last_broadcast.iter().map(|e| e.id.as_str()).collect();
        assert!(broadcast_ids.contains(&"b"));
        assert_eq!(
            state.last_broadcast.iter().find(|e| e.id == "a").unwrap().attributes.get("x"),
            Some(&serde_json::json!(1))
        );
    }
}
