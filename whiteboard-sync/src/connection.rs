//! Server-side per-connection dispatch, independent of the transport.
//!
//! The WebSocket loop in [`crate::server`] decodes a frame, hands the
//! [`ClientMessage`] to [`Connection::handle`] and writes back whatever it
//! returns. Room traffic for the connection comes out of
//! [`Connection::next_event`].

use std::sync::Arc;

use log::{debug, info, warn};

use crate::broadcast::{Subscription, SubscriptionError};
use crate::operation::ParticipantId;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{JoinError, RoomRegistry};

struct Membership {
    room_id: String,
    participant_id: ParticipantId,
    subscription: Subscription,
}

/// One client connection's protocol state.
pub struct Connection {
    registry: Arc<RoomRegistry>,
    membership: Option<Membership>,
    label: String,
}

impl Connection {
    /// `label` identifies the connection in logs, e.g. the peer address.
    pub fn new(registry: Arc<RoomRegistry>, label: impl Into<String>) -> Self {
        Self {
            registry,
            membership: None,
            label: label.into(),
        }
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.membership.as_ref().map(|m| m.participant_id)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room_id.as_str())
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    /// Process one client message; returns the direct replies in send order.
    pub async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        debug!("[{}] <- {}", self.label, msg.name());
        match msg {
            ClientMessage::Join(request) => {
                if self.membership.is_some() {
                    return vec![rejected(JoinError::AlreadyJoined)];
                }
                match self.registry.join(request).await {
                    Ok(admission) => {
                        let participants = admission.accepted.current_participants.clone();
                        self.membership = Some(Membership {
                            room_id: admission.room_id,
                            participant_id: admission.accepted.participant_id,
                            subscription: admission.subscription,
                        });
                        vec![
                            ServerMessage::JoinAccepted(admission.accepted),
                            ServerMessage::UsersList(participants),
                        ]
                    }
                    Err(e) => {
                        info!("[{}] join rejected: {}", self.label, e);
                        vec![rejected(e)]
                    }
                }
            }
            ClientMessage::Submit(op) => {
                let Some(m) = &self.membership else {
                    warn!("[{}] submit before join, dropped", self.label);
                    return Vec::new();
                };
                if let Err(e) = self.registry.submit(&m.room_id, m.participant_id, op).await {
                    warn!("[{}] submit dropped: {}", self.label, e);
                }
                // The ack travels on the room stream, after everything
                // committed before it.
                Vec::new()
            }
            ClientMessage::Leave => {
                self.leave().await;
                Vec::new()
            }
            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    /// Next room event for this connection. Never resolves while not joined.
    pub async fn next_event(&mut self) -> Result<ServerMessage, SubscriptionError> {
        match self.membership.as_mut() {
            Some(m) => m.subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Leave the current room, if any. Safe to call repeatedly.
    pub async fn leave(&mut self) -> bool {
        let Some(m) = self.membership.take() else {
            return false;
        };
        self.registry.leave(&m.room_id, m.participant_id).await
    }
}

fn rejected(e: JoinError) -> ServerMessage {
    ServerMessage::JoinRejected {
        reason: e.to_string(),
    }
}
