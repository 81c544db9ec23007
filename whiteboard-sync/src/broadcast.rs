//! Per-room fan-out.
//!
//! Every room owns one tokio broadcast channel. Each participant holds an
//! independent receiver buffering up to `capacity` events, so a slow or dead
//! recipient never blocks the others.
//!
//! ```text
//!                    ┌──────────────┐
//!  registry ──send──►│  broadcast   │──► Subscription(A) ──► Ack
//!                    │  Arc<Event>  │──► Subscription(B) ──► Operation
//!                    └──────────────┘──► Subscription(C) ──► Operation
//! ```
//!
//! A [`Subscription`] turns raw room events into the [`ServerMessage`] its
//! owner should see: its own commits become acks, everyone else's become
//! fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::operation::{Operation, OperationKind, ParticipantId};
use crate::presence::PresenceEvent;
use crate::protocol::ServerMessage;

/// Something that happened in a room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// An operation received its `sequence_no`.
    Committed { operation: Operation, generation: u64 },
    /// A presence change, optionally hidden from one participant.
    Presence {
        event: PresenceEvent,
        skip: Option<ParticipantId>,
    },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
}

struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

/// Errors surfaced by [`Subscription::recv`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The receiver fell behind and `n` events were overwritten.
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),

    #[error("room broadcast channel closed")]
    Closed,
}

/// The broadcast channel of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many events a receiver may buffer before it lags.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe on behalf of `participant_id`. Only events published after
    /// this call are observed.
    pub fn subscribe(&self, participant_id: ParticipantId) -> Subscription {
        Subscription {
            participant_id,
            receiver: self.sender.subscribe(),
            atomic_stats: self.atomic_stats.clone(),
        }
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.atomic_stats.events_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One participant's view of a room's broadcast channel.
pub struct Subscription {
    participant_id: ParticipantId,
    receiver: broadcast::Receiver<Arc<RoomEvent>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Wait for the next message addressed to this participant.
    pub async fn recv(&mut self) -> Result<ServerMessage, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(msg) = self.translate(&event) {
                        return Ok(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.atomic_stats
                        .events_dropped
                        .fetch_add(n, Ordering::Relaxed);
                    return Err(SubscriptionError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SubscriptionError::Closed);
                }
            }
        }
    }

    fn translate(&self, event: &RoomEvent) -> Option<ServerMessage> {
        match event {
            RoomEvent::Committed {
                operation,
                generation,
            } => {
                if operation.origin_id == self.participant_id {
                    return Some(ServerMessage::Ack {
                        op_id: operation.op_id,
                        sequence_no: operation.sequence_no,
                        generation: *generation,
                    });
                }
                Some(match operation.kind {
                    OperationKind::CanvasCleared { generation } => ServerMessage::CanvasCleared {
                        generation,
                        sequence_no: operation.sequence_no,
                        origin_id: operation.origin_id,
                    },
                    _ => ServerMessage::Operation(operation.clone()),
                })
            }
            RoomEvent::Presence { event, skip } => {
                if *skip == Some(self.participant_id) {
                    return None;
                }
                Some(event.clone().into())
            }
        }
    }
}
