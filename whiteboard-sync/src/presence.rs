//! Presence: who is in a room.
//!
//! ```text
//! join ──► PresenceTracker::join ──► user-joined (others) + users-list (joiner)
//! close ─► PresenceTracker::leave ─► user-left (remaining, exactly once)
//!                                          │
//!                                          ▼
//!                                   Roster::apply (client)
//! ```
//!
//! Presence events travel on the same per-room stream as drawing operations
//! but carry no ordering relationship with them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::ParticipantId;

/// One connected user within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    /// Presentation color, e.g. `#3a7bd5`.
    pub color: String,
}

impl Participant {
    /// Build a participant, filling blank name/color from the id.
    pub fn new(id: ParticipantId, display_name: &str, color: &str) -> Self {
        let display_name = match display_name.trim() {
            "" => default_display_name(id),
            name => name.to_string(),
        };
        let color = match color.trim() {
            "" => color_for(id),
            color => color.to_string(),
        };
        Self {
            id,
            display_name,
            color,
        }
    }
}

/// Presence notifications fanned out to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    UserJoined(Participant),
    UserLeft(ParticipantId),
    UsersList(Vec<Participant>),
}

/// `User<n>` with `n` in `0..1000`, stable for a given id.
pub fn default_display_name(id: ParticipantId) -> String {
    format!("User{}", id.as_u128() % 1000)
}

/// Stable, vivid `#rrggbb` color derived from an id.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

/// Participant set of one room, in join order.
///
/// Only reachable participants are listed: a participant is removed on
/// disconnect, not flagged.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: Vec<Participant>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant and return the notification for everyone else.
    pub fn join(&mut self, participant: Participant) -> PresenceEvent {
        self.participants.retain(|p| p.id != participant.id);
        self.participants.push(participant.clone());
        PresenceEvent::UserJoined(participant)
    }

    /// Remove a participant. Returns `None` if it was not present, so a
    /// repeated leave produces no second `user-left`.
    pub fn leave(&mut self, id: &ParticipantId) -> Option<PresenceEvent> {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != *id);
        (self.participants.len() != before).then_some(PresenceEvent::UserLeft(*id))
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p.id == *id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == *id)
    }

    pub fn list(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// The participant list as seen by one client.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    users: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// `users-list` replaces, `user-joined` replaces any same-id entry and
    /// appends, `user-left` removes.
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::UsersList(users) => self.users = users.clone(),
            PresenceEvent::UserJoined(user) => {
                self.users.retain(|u| u.id != user.id);
                self.users.push(user.clone());
            }
            PresenceEvent::UserLeft(id) => self.users.retain(|u| u.id != *id),
        }
    }

    pub fn users(&self) -> &[Participant] {
        &self.users
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.users.iter().any(|u| u.id == *id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
