//! # whiteboard-sync
//!
//! Room synchronization for a shared whiteboard. Every participant in a room
//! converges on the same sequence of drawing operations, whenever it joined
//! and however the network interleaved its traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐          binary WebSocket          ┌────────────────────────┐
//! │ SyncClient          │  ───── ClientMessage (bincode) ──► │ SyncServer             │
//! │  └─ Session         │                                    │  └─ Connection         │
//! │      ├─ Roster      │  ◄──── ServerMessage (bincode) ─── │      └─ RoomRegistry   │
//! │      └─ CanvasAdapter                                    │          └─ Room       │
//! │          (InMemoryCanvas)                                │              ├─ log    │
//! └─────────────────────┘                                    │              ├─ presence
//!                                                            │              └─ broadcast
//!                                                            └────────────────────────┘
//! ```
//!
//! - [`operation`]: the operation model and its validity rules
//! - [`codec`]: bincode wire form
//! - [`adapter`]: contract with the drawing surface, plus a headless canvas
//! - [`session`]: transport-free client state machine
//! - [`registry`]: per-room ordering authority
//! - [`presence`]: who is in a room
//! - [`client`] / [`server`]: tokio + tungstenite transports

pub mod adapter;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod connection;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use adapter::{CanvasAdapter, CaptureStream, InMemoryCanvas, LocalPen};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomEvent, Subscription, SubscriptionError};
pub use client::{ClientConfig, ClientError, SyncClient};
pub use codec::{decode_operation, encode_operation, CodecError};
pub use connection::Connection;
pub use operation::{
    Bounds, OpId, Operation, OperationKind, ParticipantId, Point, SequenceNo, ShapeKind, Style,
};
pub use presence::{Participant, PresenceEvent, PresenceTracker, Roster};
pub use protocol::{ClientMessage, JoinAccepted, JoinRequest, ServerMessage};
pub use registry::{
    generate_room_id, Admission, JoinError, RegistryConfig, RoomRegistry, RoomSnapshot, SubmitError,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};
