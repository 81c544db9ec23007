//! Wire protocol between session clients and the room server.
//!
//! One bincode-encoded message per binary WebSocket frame.
//!
//! ```text
//! client                                   server
//!   │ ── Join { room_id, name, color } ──────► │
//!   │ ◄── JoinAccepted | JoinRejected ──────── │
//!   │ ◄── UsersList ────────────────────────── │
//!   │ ── Submit(Operation) ──────────────────► │ assign sequence_no
//!   │ ◄── Ack { op_id, sequence_no } ───────── │ (originator)
//!   │          Operation / CanvasCleared ────► │ (everyone else)
//!   │ ◄── UserJoined / UserLeft ────────────── │
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::operation::{OpId, Operation, ParticipantId, SequenceNo};
use crate::presence::{Participant, PresenceEvent};

/// Request to enter a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room_id: String,
    pub display_name: String,
    pub color: String,
}

impl JoinRequest {
    pub fn new(
        room_id: impl Into<String>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            color: color.into(),
        }
    }
}

/// Everything a joiner needs to reconstruct the visible canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub participant_id: ParticipantId,
    pub current_participants: Vec<Participant>,
    /// Committed operations after the latest clear, ascending `sequence_no`.
    pub replay_log: Vec<Operation>,
    /// Clear generation of the room at join time.
    pub generation: u64,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join(JoinRequest),
    /// A locally captured operation, `sequence_no` unassigned.
    Submit(Operation),
    Leave,
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    JoinAccepted(JoinAccepted),
    JoinRejected {
        reason: String,
    },
    /// Fan-out of another participant's committed operation.
    Operation(Operation),
    /// Fan-out of another participant's clear.
    CanvasCleared {
        generation: u64,
        sequence_no: SequenceNo,
        origin_id: ParticipantId,
    },
    /// Commit receipt for the originator of an operation.
    Ack {
        op_id: OpId,
        sequence_no: SequenceNo,
        generation: u64,
    },
    UserJoined(Participant),
    UserLeft(ParticipantId),
    UsersList(Vec<Participant>),
    Pong,
}

impl From<PresenceEvent> for ServerMessage {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::UserJoined(p) => ServerMessage::UserJoined(p),
            PresenceEvent::UserLeft(id) => ServerMessage::UserLeft(id),
            PresenceEvent::UsersList(list) => ServerMessage::UsersList(list),
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    /// Decode a frame. A submitted operation must also pass validation.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let msg: Self = codec::decode(bytes)?;
        if let ClientMessage::Submit(op) = &msg {
            op.validate()?;
        }
        Ok(msg)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Submit(_) => "submit",
            ClientMessage::Leave => "leave",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    /// Decode a frame, validating every operation it carries.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let msg: Self = codec::decode(bytes)?;
        match &msg {
            ServerMessage::Operation(op) => op.validate()?,
            ServerMessage::JoinAccepted(accepted) => {
                for op in &accepted.replay_log {
                    op.validate()?;
                }
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Presence view of this message, if it is a presence notification.
    pub fn presence(&self) -> Option<PresenceEvent> {
        match self {
            ServerMessage::UserJoined(p) => Some(PresenceEvent::UserJoined(p.clone())),
            ServerMessage::UserLeft(id) => Some(PresenceEvent::UserLeft(*id)),
            ServerMessage::UsersList(list) => Some(PresenceEvent::UsersList(list.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, Point, Style};
    use uuid::Uuid;

    #[test]
    fn test_join_roundtrip() {
        let msg = ClientMessage::Join(JoinRequest::new("abc123", "Alice", "#ff0000"));
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.name(), "join");
    }

    #[test]
    fn test_submit_with_invalid_operation_is_rejected() {
        let msg = ClientMessage::Submit(Operation::stroke(Vec::new(), Style::default()));
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(CodecError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_join_accepted_roundtrip() {
        let alice = Participant::new(Uuid::new_v4(), "Alice", "#ff0000");
        let mut op = Operation::stroke(vec![Point::new(1.0, 2.0)], Style::default());
        op.origin_id = alice.id;
        op.sequence_no = 1;

        let msg = ServerMessage::JoinAccepted(JoinAccepted {
            participant_id: Uuid::new_v4(),
            current_participants: vec![alice],
            replay_log: vec![op],
            generation: 0,
        });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_replay_with_invalid_operation_is_rejected() {
        let mut bad = Operation::draft(OperationKind::ObjectRemoved {
            target: Uuid::new_v4(),
        });
        bad.op_id = Uuid::nil();
        let msg = ServerMessage::JoinAccepted(JoinAccepted {
            participant_id: Uuid::new_v4(),
            current_participants: Vec::new(),
            replay_log: vec![bad],
            generation: 0,
        });
        assert!(ServerMessage::decode(&msg.encode().unwrap()).is_err());
    }

    #[test]
    fn test_presence_conversion() {
        let id = Uuid::new_v4();
        let msg: ServerMessage = PresenceEvent::UserLeft(id).into();
        assert_eq!(msg, ServerMessage::UserLeft(id));
        assert_eq!(msg.presence(), Some(PresenceEvent::UserLeft(id)));
        assert_eq!(ServerMessage::Pong.presence(), None);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[0x42]).is_err());
    }
}
