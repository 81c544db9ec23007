//! Per-participant session state machine.
//!
//! ```text
//!                begin_join            JoinAccepted
//! Disconnected ─────────────► Connecting ──────────► Joined
//!      ▲                          │                    │
//!      └──── JoinRejected ────────┘                    │
//!      └──── leave / transport_lost ───────────────────┘
//! ```
//!
//! The session is transport-free: server messages go in through
//! [`Session::handle_server`], client messages come out of the methods that
//! produce them. The caller owns the socket.
//!
//! Echo suppression: every captured operation is recorded in a pending set
//! until the registry acks it. Fan-out carrying the local participant as
//! origin is never applied again.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::adapter::{CanvasAdapter, CaptureStream};
use crate::operation::{OpId, Operation, OperationKind, ParticipantId, SequenceNo, UNASSIGNED};
use crate::presence::{Participant, PresenceEvent, Roster};
use crate::protocol::{ClientMessage, JoinAccepted, JoinRequest, ServerMessage};
use crate::registry::{validate_room_id, JoinError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Joined => "joined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an unacknowledged submit stays in the pending set.
    pub pending_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    #[error("not joined to a room")]
    NotJoined,

    #[error(transparent)]
    InvalidRoom(#[from] JoinError),
}

/// What a server message meant to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        participant_id: ParticipantId,
        participants: Vec<Participant>,
        replayed: usize,
        generation: u64,
    },
    Rejected {
        reason: String,
    },
    RemoteOperation(Operation),
    CanvasCleared {
        generation: u64,
    },
    Acknowledged {
        op_id: OpId,
        sequence_no: SequenceNo,
    },
    ParticipantJoined(Participant),
    ParticipantLeft(ParticipantId),
    ParticipantsListed(Vec<Participant>),
    Disconnected,
}

/// Submitted operations awaiting their ack, in capture order.
///
/// Keeps the optimistic copy of each operation so it can be redrawn when a
/// clear committed ahead of it wipes the canvas.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: Vec<(Operation, Instant)>,
}

impl PendingSet {
    pub fn insert(&mut self, op: Operation, now: Instant) {
        self.entries.push((op, now));
    }

    pub fn acknowledge(&mut self, op_id: &OpId) -> bool {
        match self.entries.iter().position(|(op, _)| op.op_id == *op_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Unacknowledged operations, oldest first.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().map(|(op, _)| op)
    }

    /// Drop entries older than `ttl`. Returns how many expired.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(_, inserted)| now.saturating_duration_since(*inserted) < ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One participant's view of a room, driving a canvas adapter.
pub struct Session<A: CanvasAdapter> {
    state: SessionState,
    config: SessionConfig,
    adapter: A,
    room_id: Option<String>,
    participant_id: Option<ParticipantId>,
    roster: Roster,
    pending: PendingSet,
    /// Own clear that has not been acked yet. Only its ack or a disconnect
    /// resets it.
    pending_clear: Option<OpId>,
    last_sequence: SequenceNo,
    generation: u64,
}

impl<A: CanvasAdapter> Session<A> {
    pub fn new(adapter: A, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            config,
            adapter,
            room_id: None,
            participant_id: None,
            roster: Roster::new(),
            pending: PendingSet::default(),
            pending_clear: None,
            last_sequence: UNASSIGNED,
            generation: 0,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.participant_id
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest `sequence_no` observed in the current room.
    pub fn last_sequence(&self) -> SequenceNo {
        self.last_sequence
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The adapter's capture stream. `None` after the first call.
    pub fn take_capture(&mut self) -> Option<CaptureStream> {
        self.adapter.capture_local()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Start joining a room. Only legal while disconnected.
    pub fn begin_join(&mut self, request: JoinRequest) -> Result<ClientMessage, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidTransition {
                state: self.state,
                action: "join",
            });
        }
        let room_id = validate_room_id(&request.room_id)?;

        self.state = SessionState::Connecting;
        self.room_id = Some(room_id.clone());
        self.last_sequence = UNASSIGNED;
        self.generation = 0;
        self.reset_pending();

        debug!("Joining room {} as {:?}", room_id, request.display_name);
        Ok(ClientMessage::Join(JoinRequest { room_id, ..request }))
    }

    /// Explicit leave. Returns the message to send, or `None` if already
    /// disconnected.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        if self.state == SessionState::Disconnected {
            return None;
        }
        self.disconnect();
        Some(ClientMessage::Leave)
    }

    /// The transport went away. Reported once.
    pub fn transport_lost(&mut self) -> Option<SessionEvent> {
        if self.state == SessionState::Disconnected {
            return None;
        }
        warn!("Lost connection to room {:?}", self.room_id);
        self.disconnect();
        Some(SessionEvent::Disconnected)
    }

    fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.participant_id = None;
        self.roster.clear();
        self.reset_pending();
    }

    fn reset_pending(&mut self) {
        self.pending.clear();
        self.pending_clear = None;
    }

    // ─── Inbound ─────────────────────────────────────────────────────

    /// Apply one server message. Returns what it meant, if anything.
    pub fn handle_server(&mut self, msg: ServerMessage) -> Option<SessionEvent> {
        match (self.state, msg) {
            (SessionState::Connecting, ServerMessage::JoinAccepted(accepted)) => {
                Some(self.on_join_accepted(accepted))
            }
            (SessionState::Connecting, ServerMessage::JoinRejected { reason }) => {
                info!("Join of room {:?} rejected: {}", self.room_id, reason);
                self.state = SessionState::Disconnected;
                self.room_id = None;
                Some(SessionEvent::Rejected { reason })
            }
            (SessionState::Joined, ServerMessage::Operation(op)) => self.on_remote(op),
            (
                SessionState::Joined,
                ServerMessage::CanvasCleared {
                    generation,
                    sequence_no,
                    origin_id,
                },
            ) => {
                let mut op = Operation::draft(OperationKind::CanvasCleared { generation });
                op.origin_id = origin_id;
                op.sequence_no = sequence_no;
                self.on_remote(op)
            }
            (
                SessionState::Joined,
                ServerMessage::Ack {
                    op_id,
                    sequence_no,
                    generation,
                },
            ) => Some(self.on_ack(op_id, sequence_no, generation)),
            (_, ServerMessage::Pong) => None,
            (SessionState::Joined, msg) => {
                let event = msg.presence()?;
                self.roster.apply(&event);
                Some(match event {
                    PresenceEvent::UserJoined(p) => SessionEvent::ParticipantJoined(p),
                    PresenceEvent::UserLeft(id) => SessionEvent::ParticipantLeft(id),
                    PresenceEvent::UsersList(list) => SessionEvent::ParticipantsListed(list),
                })
            }
            (state, msg) => {
                debug!("Ignoring {:?} while {}", msg, state);
                None
            }
        }
    }

    fn on_join_accepted(&mut self, accepted: JoinAccepted) -> SessionEvent {
        let JoinAccepted {
            participant_id,
            current_participants,
            mut replay_log,
            generation,
        } = accepted;

        self.adapter.clear_local();
        replay_log.sort_by_key(|op| op.sequence_no);
        for op in &replay_log {
            self.adapter.apply_remote(op);
        }

        self.state = SessionState::Joined;
        self.participant_id = Some(participant_id);
        self.generation = generation;
        self.last_sequence = replay_log
            .last()
            .map_or(UNASSIGNED, |op| op.sequence_no);
        self.roster
            .apply(&PresenceEvent::UsersList(current_participants.clone()));

        info!(
            "Joined room {:?} as {} (replayed {} ops, generation {})",
            self.room_id,
            participant_id,
            replay_log.len(),
            generation
        );

        SessionEvent::Joined {
            participant_id,
            participants: current_participants,
            replayed: replay_log.len(),
            generation,
        }
    }

    fn on_remote(&mut self, op: Operation) -> Option<SessionEvent> {
        if op.sequence_no <= self.last_sequence {
            debug!(
                "Dropping duplicate #{} (last seen #{})",
                op.sequence_no, self.last_sequence
            );
            return None;
        }
        self.last_sequence = op.sequence_no;

        if Some(op.origin_id) == self.participant_id {
            self.pending.acknowledge(&op.op_id);
            return None;
        }

        // Anything delivered ahead of our own clear's ack was committed
        // before it, so the clear already erased it.
        if self.pending_clear.is_some() {
            debug!("Skipping #{} superseded by pending clear", op.sequence_no);
            return None;
        }

        if let OperationKind::CanvasCleared { generation } = op.kind {
            self.adapter.clear_local();
            // Still unacknowledged, so committed after this clear.
            for pending in self.pending.operations() {
                self.adapter.apply_local(pending);
            }
            self.generation = generation;
            return Some(SessionEvent::CanvasCleared { generation });
        }

        self.adapter.apply_remote(&op);
        Some(SessionEvent::RemoteOperation(op))
    }

    fn on_ack(&mut self, op_id: OpId, sequence_no: SequenceNo, generation: u64) -> SessionEvent {
        if !self.pending.acknowledge(&op_id) {
            debug!("Ack for unknown or expired operation {}", op_id);
        }
        if self.pending_clear == Some(op_id) {
            self.pending_clear = None;
        }
        self.last_sequence = self.last_sequence.max(sequence_no);
        self.generation = self.generation.max(generation);
        SessionEvent::Acknowledged {
            op_id,
            sequence_no,
        }
    }

    // ─── Outbound ────────────────────────────────────────────────────

    /// Wrap a locally drawn operation: stamp it, show it, submit it.
    pub fn capture(&mut self, draft: Operation) -> Result<ClientMessage, SessionError> {
        let op = self.stamp(draft)?;
        self.adapter.apply_local(&op);
        Ok(ClientMessage::Submit(op))
    }

    /// Undo the most recent object on the local canvas.
    ///
    /// Returns `Ok(None)` when there is nothing to undo; no message is sent.
    pub fn undo(&mut self) -> Result<Option<ClientMessage>, SessionError> {
        self.require_joined()?;
        let Some(last) = self.adapter.remove_last() else {
            return Ok(None);
        };
        let removal = Operation::draft(OperationKind::ObjectRemoved {
            target: last.op_id,
        });
        let op = self.stamp(removal)?;
        Ok(Some(ClientMessage::Submit(op)))
    }

    /// Clear the local canvas and submit a clear for everyone.
    pub fn clear(&mut self) -> Result<ClientMessage, SessionError> {
        self.require_joined()?;
        self.adapter.clear_local();
        let draft = Operation::draft(OperationKind::CanvasCleared {
            generation: self.generation + 1,
        });
        let op = self.stamp(draft)?;
        self.pending_clear = Some(op.op_id);
        Ok(ClientMessage::Submit(op))
    }

    fn require_joined(&self) -> Result<ParticipantId, SessionError> {
        match (self.state, self.participant_id) {
            (SessionState::Joined, Some(id)) => Ok(id),
            _ => Err(SessionError::NotJoined),
        }
    }

    fn stamp(&mut self, mut op: Operation) -> Result<Operation, SessionError> {
        let me = self.require_joined()?;
        op.origin_id = me;
        op.sequence_no = UNASSIGNED;

        let now = Instant::now();
        let expired = self.pending.expire(now, self.config.pending_ttl);
        if expired > 0 {
            warn!("{} pending operations expired without ack", expired);
        }
        self.pending.insert(op.clone(), now);
        Ok(op)
    }
}
