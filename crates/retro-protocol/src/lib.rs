// retro-protocol: Wire types for the retrospective protocol.
//
// Application commands ride inside the transport's `data` envelope and are
// discriminated by a top-level `name` field. Events flow back to clients as
// named envelopes whose payload shapes are defined here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use sse_broker::ClientId;

// ---------------------------------------------------------------------------
// Domain enumerations
// ---------------------------------------------------------------------------

/// Mood attached to a note. Integer-valued on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Mood {
    Positive = 1,
    Negative = 2,
    Confused = 3,
}

/// Phase of a retrospective. Integer-valued on the wire.
///
/// Rooms start in `WaitingForParticipants` and never return to it; the host
/// may flip between `Running` and `ActionPoints` freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum RoomPhase {
    WaitingForParticipants = 1,
    Running = 2,
    ActionPoints = 3,
}

// ---------------------------------------------------------------------------
// Room state snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub client_id: ClientId,
    #[serde(default)]
    pub name: String,
    /// Only meaningful during `Running`, and only ever shown to the host.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub finished_writing: bool,
}

/// `participant-removed` payload: the identifier alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRef {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: u64,
    pub author_id: ClientId,
    pub text: String,
    pub mood: Mood,
}

/// Snapshot of a room as carried by `current-state` events.
///
/// Which participants' notes appear, and whether `finishedWriting` flags
/// survive, depends on the recipient; the engine builds the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRoom {
    pub id: ClientId,
    pub name: String,
    pub state: RoomPhase,
    pub host_id: ClientId,
    pub participants: Vec<Participant>,
    pub notes: HashMap<ClientId, Vec<Note>>,
}

// ---------------------------------------------------------------------------
// Client -> server commands (inside the transport `data` payload)
// ---------------------------------------------------------------------------

/// Application command, discriminated by the `name` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RoomCommand {
    CreateRoom { room_name: String },
    JoinRoom { room_id: String },
    Identify { nickname: String },
    SetState { state: RoomPhase },
    SaveNote { note_id: u64, text: String, mood: Mood },
    SetFinishedWriting { finished: bool },
}

// ---------------------------------------------------------------------------
// Server -> client event names
// ---------------------------------------------------------------------------

pub mod event_names {
    pub const PARTICIPANT_ADDED: &str = "participant-added";
    pub const PARTICIPANT_REMOVED: &str = "participant-removed";
    pub const PARTICIPANT_UPDATED: &str = "participant-updated";
    pub const HOST_CHANGED: &str = "host-changed";
    pub const STATE_CHANGED: &str = "state-changed";
    pub const CURRENT_STATE: &str = "current-state";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn moods_and_phases_use_integer_wire_form() {
        assert_eq!(serde_json::to_value(Mood::Positive).expect("mood"), json!(1));
        assert_eq!(
            serde_json::to_value(RoomPhase::ActionPoints).expect("phase"),
            json!(3)
        );
        assert_eq!(
            serde_json::from_value::<Mood>(json!(2)).expect("mood"),
            Mood::Negative
        );
        assert!(serde_json::from_value::<Mood>(json!(4)).is_err());
        assert!(serde_json::from_value::<RoomPhase>(json!(0)).is_err());
    }

    #[test]
    fn participant_omits_finished_writing_when_false() {
        let client_id = ClientId::random();
        let participant = Participant {
            client_id,
            name: "Alice".to_owned(),
            finished_writing: false,
        };
        let value = serde_json::to_value(&participant).expect("participant");
        assert_eq!(value, json!({"clientId": client_id, "name": "Alice"}));

        let finished = Participant {
            finished_writing: true,
            ..participant
        };
        let value = serde_json::to_value(&finished).expect("participant");
        assert_eq!(value["finishedWriting"], json!(true));
    }

    #[test]
    fn commands_decode_by_name_tag() {
        let command: RoomCommand =
            serde_json::from_value(json!({"name": "create-room", "roomName": "Retro"}))
                .expect("create-room");
        assert_eq!(
            command,
            RoomCommand::CreateRoom {
                room_name: "Retro".to_owned()
            }
        );

        let command: RoomCommand = serde_json::from_value(
            json!({"name": "save-note", "noteId": 3, "text": "hi", "mood": 1}),
        )
        .expect("save-note");
        assert_eq!(
            command,
            RoomCommand::SaveNote {
                note_id: 3,
                text: "hi".to_owned(),
                mood: Mood::Positive
            }
        );

        let command: RoomCommand =
            serde_json::from_value(json!({"name": "set-finished-writing", "finished": true}))
                .expect("set-finished-writing");
        assert_eq!(command, RoomCommand::SetFinishedWriting { finished: true });
    }

    #[test]
    fn unknown_command_names_and_invalid_values_are_rejected() {
        assert!(serde_json::from_value::<RoomCommand>(json!({"name": "shout"})).is_err());
        assert!(
            serde_json::from_value::<RoomCommand>(json!({"name": "set-state", "state": 9}))
                .is_err()
        );
        assert!(serde_json::from_value::<RoomCommand>(
            json!({"name": "save-note", "noteId": 0, "text": "x", "mood": 0})
        )
        .is_err());
    }

    #[test]
    fn serialized_room_keys_notes_by_author_id() {
        let author = ClientId::random();
        let room = SerializedRoom {
            id: ClientId::random(),
            name: "Retro".to_owned(),
            state: RoomPhase::Running,
            host_id: author,
            participants: vec![Participant {
                client_id: author,
                name: String::new(),
                finished_writing: false,
            }],
            notes: HashMap::from([(
                author,
                vec![Note {
                    id: 0,
                    author_id: author,
                    text: "hi".to_owned(),
                    mood: Mood::Confused,
                }],
            )]),
        };

        let value = serde_json::to_value(&room).expect("room");
        assert_eq!(value["state"], json!(2));
        assert_eq!(
            value["notes"][author.to_string()][0],
            json!({"id": 0, "authorId": author, "text": "hi", "mood": 3})
        );

        let back: SerializedRoom = serde_json::from_value(value).expect("round trip");
        assert_eq!(back, room);
    }
}
