//! Routes decoded application commands to rooms, and engine events back to
//! the connection layer.
//!
//! The manager is the broker's only consumer: it watches for new
//! connections, spawns one inbound reader per client, and tears the client
//! down (removing them from their room) when the inbound stream closes.

use std::collections::HashMap;
use std::sync::Arc;

use retro_protocol::{Participant, RoomCommand};
use serde_json::Value;
use sse_broker::{Broker, ClientId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::room::{Event, Room};

#[derive(Debug, Error)]
enum CommandError {
    #[error("empty room name")]
    EmptyRoomName,
    #[error("invalid room ID")]
    InvalidRoomId,
    #[error("unknown room {0}")]
    UnknownRoom(ClientId),
    #[error("client is not in any room")]
    NotInRoom,
}

#[derive(Default)]
struct ClientInfo {
    name: String,
    room: Option<Arc<Room>>,
}

#[derive(Default)]
struct ManagerState {
    rooms: HashMap<ClientId, Arc<Room>>,
    clients: HashMap<ClientId, ClientInfo>,
}

/// Bridges the connection broker and the room engine. One instance per
/// process, consuming new-connection notifications for its whole lifetime.
pub struct RoomManager {
    broker: Arc<Broker>,
    state: RwLock<ManagerState>,
}

impl RoomManager {
    /// Creates the manager and starts watching for new connections.
    pub async fn start(broker: Arc<Broker>) -> Arc<Self> {
        let manager = Arc::new(Self {
            broker: Arc::clone(&broker),
            state: RwLock::new(ManagerState::default()),
        });

        let mut connections = broker.listen_connections().await;
        let consumer = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(client_id) = connections.recv().await {
                Self::handle_new_connection(&consumer, client_id).await;
            }
        });

        manager
    }

    async fn handle_new_connection(manager: &Arc<Self>, client_id: ClientId) {
        info!(client_id = %client_id, "new client connection");

        let mut payloads = match manager.broker.listen(client_id).await {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "cannot listen on new connection");
                return;
            }
        };

        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                manager.handle_payload(client_id, payload).await;
            }
            info!(client_id = %client_id, "client disconnected");
            manager.handle_disconnect(client_id).await;
        });
    }

    async fn handle_disconnect(&self, client_id: ClientId) {
        let info = self.state.write().await.clients.remove(&client_id);
        let Some(info) = info else { return };

        if let Some(room) = info.room {
            let events = room.remove_participant(client_id).await;
            self.dispatch(events).await;
        }
    }

    async fn handle_payload(&self, client_id: ClientId, payload: Value) {
        let command: RoomCommand = match serde_json::from_value(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "dropping undecodable command");
                return;
            }
        };

        match self.handle_command(client_id, command).await {
            Ok(events) => self.dispatch(events).await,
            Err(err) => warn!(client_id = %client_id, error = %err, "dropping invalid command"),
        }
    }

    async fn handle_command(
        &self,
        client_id: ClientId,
        command: RoomCommand,
    ) -> Result<Vec<Event>, CommandError> {
        match command {
            RoomCommand::CreateRoom { room_name } => self.create_room(client_id, room_name).await,
            RoomCommand::JoinRoom { room_id } => self.join_room(client_id, &room_id).await,
            RoomCommand::Identify { nickname } => self.identify(client_id, nickname).await,
            RoomCommand::SetState { state } => match self.room_of(client_id).await {
                Some(room) => Ok(room.set_phase(client_id, state).await),
                None => Ok(Vec::new()),
            },
            RoomCommand::SaveNote {
                note_id,
                text,
                mood,
            } => {
                let room = self
                    .room_of(client_id)
                    .await
                    .ok_or(CommandError::NotInRoom)?;
                Ok(room.save_note(client_id, note_id, text, mood).await)
            }
            RoomCommand::SetFinishedWriting { finished } => {
                let room = self
                    .room_of(client_id)
                    .await
                    .ok_or(CommandError::NotInRoom)?;
                Ok(room.set_finished_writing(client_id, finished).await)
            }
        }
    }

    async fn create_room(
        &self,
        client_id: ClientId,
        room_name: String,
    ) -> Result<Vec<Event>, CommandError> {
        if room_name.is_empty() {
            return Err(CommandError::EmptyRoomName);
        }

        let room_id = ClientId::random();
        let room = Arc::new(Room::new(room_id, room_name));

        let mut state = self.state.write().await;
        state.rooms.insert(room_id, Arc::clone(&room));
        info!(room_id = %room_id, client_id = %client_id, "room created");

        Ok(Self::join_room_locked(&mut state, room, client_id).await)
    }

    async fn join_room(
        &self,
        client_id: ClientId,
        room_id: &str,
    ) -> Result<Vec<Event>, CommandError> {
        let room_id: ClientId = room_id.parse().map_err(|_| CommandError::InvalidRoomId)?;

        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(CommandError::UnknownRoom(room_id))?;

        Ok(Self::join_room_locked(&mut state, room, client_id).await)
    }

    /// Moves the client into `room`, leaving any previous, different room
    /// first. Departure events precede the join events in the returned list.
    /// Re-joining the current room takes the engine's reconnect path.
    async fn join_room_locked(
        state: &mut ManagerState,
        room: Arc<Room>,
        client_id: ClientId,
    ) -> Vec<Event> {
        let info = state.clients.entry(client_id).or_default();

        let mut events = Vec::new();
        if let Some(previous) = info.room.replace(Arc::clone(&room)) {
            if previous.id() != room.id() {
                events.extend(previous.remove_participant(client_id).await);
            }
        }

        let participant = Participant {
            client_id,
            name: info.name.clone(),
            finished_writing: false,
        };
        events.extend(room.add_participant(participant).await);
        events
    }

    async fn identify(
        &self,
        client_id: ClientId,
        nickname: String,
    ) -> Result<Vec<Event>, CommandError> {
        let mut state = self.state.write().await;
        let info = state.clients.entry(client_id).or_default();
        info.name.clone_from(&nickname);
        debug!(client_id = %client_id, nickname = %nickname, "client identified");

        match info.room.clone() {
            Some(room) => Ok(room
                .update_participant(Participant {
                    client_id,
                    name: nickname,
                    finished_writing: false,
                })
                .await),
            None => Ok(Vec::new()),
        }
    }

    async fn room_of(&self, client_id: ClientId) -> Option<Arc<Room>> {
        self.state
            .read()
            .await
            .clients
            .get(&client_id)
            .and_then(|info| info.room.clone())
    }

    /// Forwards engine events to the broker. Failures are logged and
    /// otherwise ignored: a congested client misses that event, nothing
    /// more.
    async fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            if let Err(err) = self
                .broker
                .send(event.recipient, event.name, &event.payload)
                .await
            {
                warn!(
                    recipient = %event.recipient,
                    event = event.name,
                    error = %err,
                    "error dispatching event"
                );
            }
        }
    }
}
