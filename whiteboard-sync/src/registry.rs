//! Room registry: the ordering authority.
//!
//! ```text
//! RoomRegistry
//!   └─ RwLock<HashMap<room_id, Arc<Mutex<Room>>>>     lookup / insert / evict only
//!         └─ Room                                     all room work under its mutex
//!              ├─ PresenceTracker
//!              ├─ log: [op#1, op#2, clear#3, op#4]   replay_from ──► op#4
//!              ├─ next_sequence, generation
//!              └─ BroadcastGroup ──► one Subscription per participant
//! ```
//!
//! Committing and publishing happen under the room mutex, so the broadcast
//! channel carries operations in `sequence_no` order. The map lock is never
//! held while a room mutex is awaited.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, RoomEvent, Subscription};
use crate::codec::CodecError;
use crate::operation::{now_millis, Operation, OperationKind, ParticipantId, SequenceNo};
use crate::presence::{Participant, PresenceTracker};
use crate::protocol::{JoinAccepted, JoinRequest};

pub const MAX_ROOM_ID_LEN: usize = 64;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub max_participants_per_room: usize,
    /// Events buffered per participant before it counts as lagging.
    pub broadcast_capacity: usize,
    /// Drop log entries superseded by a clear instead of retaining them.
    pub truncate_log_on_clear: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_participants_per_room: 100,
            broadcast_capacity: 256,
            truncate_log_on_clear: false,
        }
    }
}

/// Reasons a join is refused. The display text becomes `JoinRejected.reason`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("please enter a room id")]
    EmptyRoomId,

    #[error("room id is longer than {} characters", MAX_ROOM_ID_LEN)]
    RoomIdTooLong,

    #[error("room id may only contain letters, digits, '-' and '_'")]
    InvalidRoomId,

    #[error("display name is longer than {} characters", MAX_DISPLAY_NAME_LEN)]
    DisplayNameTooLong,

    #[error("room is full ({capacity} participants)")]
    RoomFull { capacity: usize },

    #[error("already joined a room")]
    AlreadyJoined,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("participant {0} is not in the room")]
    NotJoined(ParticipantId),

    #[error("invalid operation: {0}")]
    Invalid(#[from] CodecError),
}

/// A successful join: the reply for the joiner plus its event stream.
pub struct Admission {
    pub room_id: String,
    pub accepted: JoinAccepted,
    pub subscription: Subscription,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<Participant>,
    /// Every retained entry, clears included.
    pub log: Vec<Operation>,
    /// What a joiner would replay right now.
    pub replay_log: Vec<Operation>,
    pub generation: u64,
    pub next_sequence_no: SequenceNo,
    pub broadcast: BroadcastStats,
}

struct Room {
    id: String,
    presence: PresenceTracker,
    log: Vec<Operation>,
    /// Index of the first entry after the latest clear.
    replay_from: usize,
    generation: u64,
    next_sequence: SequenceNo,
    broadcast: BroadcastGroup,
    /// Set when the last participant left; a closed room is never reused.
    closed: bool,
}

impl Room {
    fn new(id: String, broadcast_capacity: usize) -> Self {
        Self {
            id,
            presence: PresenceTracker::new(),
            log: Vec::new(),
            replay_from: 0,
            generation: 0,
            next_sequence: 1,
            broadcast: BroadcastGroup::new(broadcast_capacity),
            closed: false,
        }
    }

    fn replay_log(&self) -> Vec<Operation> {
        self.log[self.replay_from..].to_vec()
    }

    fn commit(&mut self, mut op: Operation, origin: ParticipantId, truncate: bool) -> Operation {
        op.origin_id = origin;
        op.sequence_no = self.next_sequence;
        self.next_sequence += 1;
        if op.timestamp == 0 {
            op.timestamp = now_millis();
        }

        if let OperationKind::CanvasCleared { generation } = &mut op.kind {
            self.generation += 1;
            *generation = self.generation;
            if truncate {
                self.log.clear();
            }
            self.log.push(op.clone());
            self.replay_from = self.log.len();
        } else {
            self.log.push(op.clone());
        }

        self.broadcast.publish(RoomEvent::Committed {
            operation: op.clone(),
            generation: self.generation,
        });
        op
    }
}

/// All live rooms of one server.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a new participant, creating the room on first join.
    pub async fn join(&self, request: JoinRequest) -> Result<Admission, JoinError> {
        let room_id = validate_room_id(&request.room_id)?;
        if request.display_name.trim().chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(JoinError::DisplayNameTooLong);
        }

        let participant = Participant::new(Uuid::new_v4(), &request.display_name, &request.color);
        let capacity = self.config.max_participants_per_room.max(1);

        loop {
            let room = self.get_or_create(&room_id).await;
            let mut guard = room.lock().await;

            if guard.closed {
                drop(guard);
                self.evict(&room_id, &room).await;
                continue;
            }
            if guard.presence.len() >= capacity {
                return Err(JoinError::RoomFull { capacity });
            }

            let subscription = guard.broadcast.subscribe(participant.id);
            let event = guard.presence.join(participant.clone());
            guard.broadcast.publish(RoomEvent::Presence {
                event,
                skip: Some(participant.id),
            });

            let accepted = JoinAccepted {
                participant_id: participant.id,
                current_participants: guard.presence.list(),
                replay_log: guard.replay_log(),
                generation: guard.generation,
            };

            info!(
                "{} ({}) joined room {} ({} participants, replay {} ops)",
                participant.display_name,
                participant.id,
                guard.id,
                guard.presence.len(),
                accepted.replay_log.len()
            );

            return Ok(Admission {
                room_id,
                accepted,
                subscription,
            });
        }
    }

    /// Commit an operation on behalf of `participant_id` and fan it out.
    pub async fn submit(
        &self,
        room_id: &str,
        participant_id: ParticipantId,
        op: Operation,
    ) -> Result<Operation, SubmitError> {
        op.validate()?;

        let room = self
            .lookup(room_id)
            .await
            .ok_or_else(|| SubmitError::UnknownRoom(room_id.to_string()))?;
        let mut guard = room.lock().await;

        if guard.closed {
            return Err(SubmitError::UnknownRoom(room_id.to_string()));
        }
        if !guard.presence.contains(&participant_id) {
            return Err(SubmitError::NotJoined(participant_id));
        }

        let committed = guard.commit(op, participant_id, self.config.truncate_log_on_clear);
        debug!(
            "Room {}: committed {} #{} from {}",
            guard.id,
            committed.kind.name(),
            committed.sequence_no,
            participant_id
        );
        if let OperationKind::CanvasCleared { generation } = committed.kind {
            info!("Room {} cleared (generation {})", guard.id, generation);
        }
        Ok(committed)
    }

    /// Remove a participant. Returns `false` if it was not in the room.
    /// The room is closed and evicted once its last participant leaves.
    pub async fn leave(&self, room_id: &str, participant_id: ParticipantId) -> bool {
        let Some(room) = self.lookup(room_id).await else {
            return false;
        };

        let emptied = {
            let mut guard = room.lock().await;
            let Some(name) = guard
                .presence
                .get(&participant_id)
                .map(|p| p.display_name.clone())
            else {
                return false;
            };
            let Some(event) = guard.presence.leave(&participant_id) else {
                return false;
            };
            guard.broadcast.publish(RoomEvent::Presence {
                event,
                skip: Some(participant_id),
            });
            info!(
                "{} ({}) left room {} ({} remaining)",
                name,
                participant_id,
                guard.id,
                guard.presence.len()
            );
            if guard.presence.is_empty() {
                guard.closed = true;
            }
            guard.closed
        };

        if emptied {
            self.evict(room_id, &room).await;
            info!("Room {} closed", room_id);
        }
        true
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.lookup(room_id).await?;
        let guard = room.lock().await;
        Some(RoomSnapshot {
            room_id: guard.id.clone(),
            participants: guard.presence.list(),
            log: guard.log.clone(),
            replay_log: guard.replay_log(),
            generation: guard.generation,
            next_sequence_no: guard.next_sequence,
            broadcast: guard.broadcast.stats(),
        })
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn lookup(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        // Fast path: read lock
        if let Some(room) = self.lookup(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Mutex::new(Room::new(
            room_id.to_string(),
            self.config.broadcast_capacity,
        )));
        rooms.insert(room_id.to_string(), room.clone());
        info!("Room {} created", room_id);
        room
    }

    /// Remove `room` from the map if it is still the entry for `room_id`.
    async fn evict(&self, room_id: &str, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room_id);
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Trim and check a caller-supplied room id.
pub fn validate_room_id(raw: &str) -> Result<String, JoinError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(JoinError::EmptyRoomId);
    }
    if id.chars().count() > MAX_ROOM_ID_LEN {
        return Err(JoinError::RoomIdTooLong);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(JoinError::InvalidRoomId);
    }
    Ok(id.to_string())
}

/// A fresh shareable room id: the first 8 hex characters of a v4 UUID.
pub fn generate_room_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
