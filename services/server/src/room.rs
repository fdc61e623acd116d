//! Authoritative state machine for a single retrospective room.
//!
//! Every operation takes the room lock, applies the mutation and returns the
//! complete ordered list of events to deliver; the caller dispatches them
//! after the lock is released. Events addressed to different participants
//! may differ: notes stay private until the action-points broadcast, and the
//! finished-writing flag is only ever shown to the host.

use std::collections::HashMap;

use retro_protocol::{
    event_names, Mood, Note, Participant, ParticipantRef, RoomPhase, SerializedRoom,
};
use serde::Serialize;
use sse_broker::ClientId;
use tokio::sync::Mutex;

/// A single event addressed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub recipient: ClientId,
    pub name: &'static str,
    pub payload: EventPayload,
}

/// Payload shapes for room events; serialized untagged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Participant(Participant),
    ParticipantRef(ParticipantRef),
    HostId(ClientId),
    Phase(RoomPhase),
    Room(SerializedRoom),
}

struct RoomState {
    phase: RoomPhase,
    host_id: ClientId,
    participants: Vec<Participant>,
    notes: HashMap<ClientId, Vec<Note>>,
}

pub struct Room {
    id: ClientId,
    name: String,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(RoomState {
                phase: RoomPhase::WaitingForParticipants,
                host_id: ClientId::default(),
                participants: Vec::new(),
                notes: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Adds a participant and announces them to the rest of the room. The
    /// first joiner becomes host. Re-adding a participant who is already
    /// present only refreshes their own view, without notifying others.
    pub async fn add_participant(&self, participant: Participant) -> Vec<Event> {
        let mut state = self.state.lock().await;

        if state
            .participants
            .iter()
            .any(|p| p.client_id == participant.client_id)
        {
            return vec![self.current_state_for(&state, participant.client_id)];
        }

        let mut events: Vec<Event> = state
            .participants
            .iter()
            .map(|p| Event {
                recipient: p.client_id,
                name: event_names::PARTICIPANT_ADDED,
                payload: EventPayload::Participant(participant.clone()),
            })
            .collect();

        let client_id = participant.client_id;
        state.participants.push(participant);
        if state.participants.len() == 1 {
            state.host_id = client_id;
        }

        events.push(self.current_state_for(&state, client_id));
        events
    }

    /// Removes a participant, promoting the next in roster order when the
    /// host leaves. Removing an absent participant is silent.
    pub async fn remove_participant(&self, client_id: ClientId) -> Vec<Event> {
        let mut state = self.state.lock().await;

        let before = state.participants.len();
        state.participants.retain(|p| p.client_id != client_id);
        if state.participants.len() == before {
            return Vec::new();
        }

        let mut events: Vec<Event> = state
            .participants
            .iter()
            .map(|p| Event {
                recipient: p.client_id,
                name: event_names::PARTICIPANT_REMOVED,
                payload: EventPayload::ParticipantRef(ParticipantRef { client_id }),
            })
            .collect();

        if state.host_id == client_id {
            match state.participants.first().map(|p| p.client_id) {
                Some(new_host) => {
                    state.host_id = new_host;
                    events.extend(state.participants.iter().map(|p| Event {
                        recipient: p.client_id,
                        name: event_names::HOST_CHANGED,
                        payload: EventPayload::HostId(new_host),
                    }));
                }
                None => state.host_id = ClientId::default(),
            }
        }

        events
    }

    /// Replaces a participant record and tells everyone else. The updated
    /// participant deliberately gets no echo.
    pub async fn update_participant(&self, updated: Participant) -> Vec<Event> {
        let mut state = self.state.lock().await;

        let Some(index) = state
            .participants
            .iter()
            .position(|p| p.client_id == updated.client_id)
        else {
            return Vec::new();
        };
        state.participants[index] = updated.clone();

        state
            .participants
            .iter()
            .filter(|p| p.client_id != updated.client_id)
            .map(|p| Event {
                recipient: p.client_id,
                name: event_names::PARTICIPANT_UPDATED,
                payload: EventPayload::Participant(updated.clone()),
            })
            .collect()
    }

    /// Host-gated phase change. The initial waiting phase cannot be
    /// re-entered; entering action points publishes every note to everyone.
    pub async fn set_phase(&self, client_id: ClientId, phase: RoomPhase) -> Vec<Event> {
        let mut state = self.state.lock().await;

        if client_id != state.host_id || phase == RoomPhase::WaitingForParticipants {
            return Vec::new();
        }

        state.phase = phase;

        let mut events: Vec<Event> = state
            .participants
            .iter()
            .map(|p| Event {
                recipient: p.client_id,
                name: event_names::STATE_CHANGED,
                payload: EventPayload::Phase(phase),
            })
            .collect();

        if phase == RoomPhase::ActionPoints {
            let snapshot = self.serialize_full(&state);
            events.extend(state.participants.iter().map(|p| Event {
                recipient: p.client_id,
                name: event_names::CURRENT_STATE,
                payload: EventPayload::Room(snapshot.clone()),
            }));
        }

        events
    }

    /// Stores or overwrites one of the author's notes. Only allowed while
    /// the room is running; notes stay private until the action-points
    /// broadcast, so no events are emitted.
    pub async fn save_note(
        &self,
        client_id: ClientId,
        note_id: u64,
        text: String,
        mood: Mood,
    ) -> Vec<Event> {
        let mut state = self.state.lock().await;

        if state.phase != RoomPhase::Running {
            return Vec::new();
        }

        let note = Note {
            id: note_id,
            author_id: client_id,
            text,
            mood,
        };
        let notes = state.notes.entry(client_id).or_default();
        match notes.iter_mut().find(|n| n.id == note_id) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        }

        Vec::new()
    }

    /// Flips the participant's finished-writing flag and tells the host,
    /// and only the host. Ignored outside `Running` and for the host
    /// themselves.
    pub async fn set_finished_writing(&self, client_id: ClientId, finished: bool) -> Vec<Event> {
        let mut state = self.state.lock().await;

        if state.phase != RoomPhase::Running || client_id == state.host_id {
            return Vec::new();
        }

        let host_id = state.host_id;
        let Some(participant) = state
            .participants
            .iter_mut()
            .find(|p| p.client_id == client_id)
        else {
            return Vec::new();
        };
        participant.finished_writing = finished;
        let updated = participant.clone();

        vec![Event {
            recipient: host_id,
            name: event_names::PARTICIPANT_UPDATED,
            payload: EventPayload::Participant(updated),
        }]
    }

    /// The `current-state` event for one recipient, applying the visibility
    /// projection for the current phase.
    fn current_state_for(&self, state: &RoomState, recipient: ClientId) -> Event {
        let snapshot = if state.phase == RoomPhase::ActionPoints {
            self.serialize_full(state)
        } else {
            self.serialize_for_client(state, recipient)
        };

        Event {
            recipient,
            name: event_names::CURRENT_STATE,
            payload: EventPayload::Room(snapshot),
        }
    }

    /// Full snapshot: every participant's notes, finished-writing cleared.
    fn serialize_full(&self, state: &RoomState) -> SerializedRoom {
        SerializedRoom {
            id: self.id,
            name: self.name.clone(),
            state: state.phase,
            host_id: state.host_id,
            participants: state
                .participants
                .iter()
                .cloned()
                .map(|mut p| {
                    p.finished_writing = false;
                    p
                })
                .collect(),
            notes: state.notes.clone(),
        }
    }

    /// Per-client snapshot: only the recipient's own notes, and
    /// finished-writing flags visible to the host alone.
    fn serialize_for_client(&self, state: &RoomState, recipient: ClientId) -> SerializedRoom {
        let is_host = recipient == state.host_id;

        let mut notes = HashMap::new();
        if let Some(own) = state.notes.get(&recipient) {
            if !own.is_empty() {
                notes.insert(recipient, own.clone());
            }
        }

        SerializedRoom {
            id: self.id,
            name: self.name.clone(),
            state: state.phase,
            host_id: state.host_id,
            participants: state
                .participants
                .iter()
                .cloned()
                .map(|mut p| {
                    if !is_host {
                        p.finished_writing = false;
                    }
                    p
                })
                .collect(),
            notes,
        }
    }
}
