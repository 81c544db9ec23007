//! Convergence tests without a socket.
//!
//! Each peer is a server-side `Connection` wired directly to a client-side
//! `Session`, so every scenario exercises the real registry, broadcast and
//! session logic while controlling delivery timing exactly.

use std::sync::Arc;

use tokio::time::{timeout, Duration};
use uuid::Uuid;
use whiteboard_sync::{
    ClientMessage, Connection, InMemoryCanvas, OpId, Operation, OperationKind, Point,
    RegistryConfig, RoomRegistry, ServerMessage, Session, SessionConfig, SessionEvent, Style,
};
use whiteboard_sync::protocol::JoinRequest;

struct Peer {
    conn: Connection,
    session: Session<InMemoryCanvas>,
}

impl Peer {
    async fn join(registry: &Arc<RoomRegistry>, room: &str, name: &str) -> Peer {
        Peer::join_with(registry, room, name, SessionConfig::default()).await
    }

    async fn join_with(
        registry: &Arc<RoomRegistry>,
        room: &str,
        name: &str,
        config: SessionConfig,
    ) -> Peer {
        let mut peer = Peer {
            conn: Connection::new(registry.clone(), name),
            session: Session::new(InMemoryCanvas::new(), config),
        };
        let join = peer
            .session
            .begin_join(JoinRequest::new(room, name, ""))
            .unwrap();
        peer.send(join).await;
        peer
    }

    fn id(&self) -> Uuid {
        self.session.participant_id().unwrap()
    }

    async fn send(&mut self, msg: ClientMessage) {
        for reply in self.conn.handle(msg).await {
            self.session.handle_server(reply);
        }
    }

    /// Draw locally without submitting yet.
    fn capture(&mut self) -> (OpId, ClientMessage) {
        let op = stroke();
        let id = op.op_id;
        (id, self.session.capture(op).unwrap())
    }

    async fn draw(&mut self) -> OpId {
        let (id, msg) = self.capture();
        self.send(msg).await;
        id
    }

    async fn undo(&mut self) {
        if let Some(msg) = self.session.undo().unwrap() {
            self.send(msg).await;
        }
    }

    fn capture_clear(&mut self) -> ClientMessage {
        self.session.clear().unwrap()
    }

    async fn clear(&mut self) {
        let msg = self.capture_clear();
        self.send(msg).await;
    }

    /// Deliver everything currently queued on the room stream.
    async fn sync(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(next) = timeout(Duration::from_millis(20), self.conn.next_event()).await {
            let msg = next.expect("room stream failed");
            if let Some(event) = self.session.handle_server(msg) {
                events.push(event);
            }
        }
        events
    }

    fn visible(&self) -> Vec<OpId> {
        let mut ids = self.session.adapter().object_ids();
        ids.sort();
        ids
    }
}

fn stroke() -> Operation {
    Operation::stroke(
        vec![Point::new(10.0, 10.0), Point::new(20.0, 25.0)],
        Style::stroke("#1e90ff", 3.0),
    )
}

fn registry() -> Arc<RoomRegistry> {
    Arc::new(RoomRegistry::default())
}

#[tokio::test]
async fn test_late_joiner_replays_first_stroke() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "abc123", "Alice").await;
    let stroke_id = alice.draw().await;

    let mut bob_conn = Connection::new(registry.clone(), "Bob");
    let replies = bob_conn
        .handle(ClientMessage::Join(JoinRequest::new("abc123", "Bob", "")))
        .await;

    let ServerMessage::JoinAccepted(accepted) = &replies[0] else {
        panic!("expected JoinAccepted, got {:?}", replies[0]);
    };
    assert_eq!(accepted.replay_log.len(), 1);
    assert_eq!(accepted.replay_log[0].op_id, stroke_id);
    assert_eq!(accepted.replay_log[0].sequence_no, 1);
    assert_eq!(accepted.replay_log[0].origin_id, alice.id());
    assert_eq!(accepted.current_participants.len(), 2);

    alice.sync().await;
    assert_eq!(alice.session.roster().len(), 2);
}

#[tokio::test]
async fn test_clear_race_converges() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;
    alice.sync().await;

    // Bob's stroke commits first; Alice clears before seeing it.
    let bob_stroke = bob.draw().await;
    alice.clear().await;

    let snapshot = registry.snapshot("room").await.unwrap();
    let seqs: Vec<u64> = snapshot.log.iter().map(|op| op.sequence_no).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(snapshot.log[0].op_id, bob_stroke);
    assert!(matches!(
        snapshot.log[1].kind,
        OperationKind::CanvasCleared { generation: 1 }
    ));

    alice.sync().await;
    bob.sync().await;
    assert!(alice.session.adapter().is_empty());
    assert!(bob.session.adapter().is_empty());
    assert_eq!(alice.session.generation(), 1);
    assert_eq!(bob.session.generation(), 1);

    let after = bob.draw().await;
    alice.sync().await;

    let carol = Peer::join(&registry, "room", "Carol").await;
    assert_eq!(carol.session.adapter().object_ids(), vec![after]);
    assert_eq!(alice.visible(), carol.visible());
    assert_eq!(carol.session.generation(), 1);
}

#[tokio::test]
async fn test_in_flight_stroke_survives_earlier_clear() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;
    alice.sync().await;

    // Alice's stroke is on her canvas but not yet submitted when Bob clears.
    let (stroke_id, submit) = alice.capture();
    bob.clear().await;
    alice.send(submit).await;

    let snapshot = registry.snapshot("room").await.unwrap();
    let kinds: Vec<(u64, &str)> = snapshot
        .log
        .iter()
        .map(|op| (op.sequence_no, op.kind.name()))
        .collect();
    assert_eq!(kinds, vec![(1, "canvas-cleared"), (2, "stroke-added")]);

    alice.sync().await;
    bob.sync().await;
    let carol = Peer::join(&registry, "room", "Carol").await;

    assert_eq!(carol.visible(), vec![stroke_id]);
    assert_eq!(alice.visible(), carol.visible());
    assert_eq!(bob.visible(), carol.visible());
    assert_eq!(alice.session.pending_count(), 0);
}

#[tokio::test]
async fn test_in_flight_strokes_across_interleaved_clears() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;
    alice.sync().await;

    let (_, a1) = alice.capture();
    let (_, b1) = bob.capture();
    alice.send(a1).await;
    let (_, a2) = alice.capture();
    let bob_clear = bob.capture_clear();
    bob.send(b1).await;
    bob.send(bob_clear).await;
    let (_, b2) = bob.capture();
    alice.send(a2).await;
    bob.send(b2).await;

    alice.sync().await;
    bob.sync().await;
    let carol = Peer::join(&registry, "room", "Carol").await;

    assert_eq!(carol.session.adapter().len(), 2);
    assert_eq!(alice.visible(), carol.visible());
    assert_eq!(bob.visible(), carol.visible());
}

#[tokio::test]
async fn test_expired_clear_still_hides_earlier_strokes() {
    let registry = registry();
    let mut alice = Peer::join_with(
        &registry,
        "room",
        "Alice",
        SessionConfig {
            pending_ttl: Duration::from_millis(5),
        },
    )
    .await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;
    alice.sync().await;

    bob.draw().await;
    alice.clear().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let kept = alice.draw().await;

    alice.sync().await;
    bob.sync().await;
    let carol = Peer::join(&registry, "room", "Carol").await;

    assert_eq!(carol.visible(), vec![kept]);
    assert_eq!(alice.visible(), carol.visible());
    assert_eq!(bob.visible(), carol.visible());
}

#[tokio::test]
async fn test_own_operations_applied_once() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let id = alice.draw().await;

    let events = alice.sync().await;
    assert_eq!(
        events,
        vec![SessionEvent::Acknowledged {
            op_id: id,
            sequence_no: 1
        }]
    );
    assert_eq!(alice.session.adapter().len(), 1);
    assert_eq!(alice.session.pending_count(), 0);
}

#[tokio::test]
async fn test_mixed_activity_converges_for_late_joiner() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;

    // Deterministic pseudo-random schedule.
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    for _ in 0..60 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let actor = if state & 1 == 0 { &mut alice } else { &mut bob };
        match (state >> 1) % 10 {
            0 => actor.clear().await,
            1 | 2 => actor.undo().await,
            _ => {
                actor.draw().await;
            }
        }
        alice.sync().await;
        bob.sync().await;
    }

    let carol = Peer::join(&registry, "room", "Carol").await;
    assert_eq!(alice.visible(), bob.visible());
    assert_eq!(alice.visible(), carol.visible());
}

#[tokio::test]
async fn test_late_joiner_matches_unsynced_concurrent_writers() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;

    // Interleave without delivering anything in between.
    for _ in 0..5 {
        alice.draw().await;
        bob.draw().await;
    }
    alice.sync().await;
    bob.sync().await;

    let carol = Peer::join(&registry, "room", "Carol").await;
    assert_eq!(carol.session.adapter().len(), 10);
    assert_eq!(alice.visible(), carol.visible());
    assert_eq!(bob.visible(), carol.visible());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_observed_gapless() {
    let registry = registry();
    let mut observer = Peer::join(&registry, "room", "Observer").await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let mut peer = Peer::join(&registry, "room", &format!("Writer{i}")).await;
            for _ in 0..40 {
                peer.draw().await;
            }
            peer
        }));
    }
    let mut writers = Vec::new();
    for handle in handles {
        writers.push(handle.await.unwrap());
    }

    let seen: Vec<u64> = observer
        .sync()
        .await
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::RemoteOperation(op) => Some(op.sequence_no),
            _ => None,
        })
        .collect();
    assert_eq!(seen, (1..=160).collect::<Vec<u64>>());
    assert_eq!(observer.session.adapter().len(), 160);

    for writer in &mut writers {
        writer.sync().await;
        assert_eq!(writer.visible(), observer.visible());
    }
}

#[tokio::test]
async fn test_abrupt_disconnect_single_user_left() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;
    let bob_id = bob.id();
    alice.sync().await;

    // Transport gone: the server-side leave may run more than once.
    assert!(bob.conn.leave().await);
    assert!(!bob.conn.leave().await);

    let left: Vec<_> = alice
        .sync()
        .await
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::ParticipantLeft(_)))
        .collect();
    assert_eq!(left, vec![SessionEvent::ParticipantLeft(bob_id)]);
    assert!(!alice.session.roster().contains(&bob_id));

    let carol = Peer::join(&registry, "room", "Carol").await;
    assert!(!carol.session.roster().contains(&bob_id));
    assert_ne!(carol.id(), bob_id);
}

#[tokio::test]
async fn test_undo_with_empty_stack_sends_nothing() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;

    assert_eq!(alice.session.undo(), Ok(None));
    let snapshot = registry.snapshot("room").await.unwrap();
    assert!(snapshot.log.is_empty());
    assert_eq!(snapshot.next_sequence_no, 1);
    assert!(alice.sync().await.is_empty());
}

#[tokio::test]
async fn test_undo_propagates_removal() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    let mut bob = Peer::join(&registry, "room", "Bob").await;

    let first = alice.draw().await;
    alice.draw().await;
    alice.undo().await;
    bob.sync().await;

    assert_eq!(bob.session.adapter().object_ids(), vec![first]);
    assert_eq!(alice.visible(), bob.visible());
}

#[tokio::test]
async fn test_truncated_log_still_replays_after_clear() {
    let registry = Arc::new(RoomRegistry::new(RegistryConfig {
        truncate_log_on_clear: true,
        ..RegistryConfig::default()
    }));
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    alice.draw().await;
    alice.clear().await;
    let kept = alice.draw().await;

    let bob = Peer::join(&registry, "room", "Bob").await;
    assert_eq!(bob.session.adapter().object_ids(), vec![kept]);
    assert_eq!(registry.snapshot("room").await.unwrap().log.len(), 2);
}

#[tokio::test]
async fn test_rejoin_after_room_closed_starts_fresh() {
    let registry = registry();
    let mut alice = Peer::join(&registry, "room", "Alice").await;
    alice.draw().await;
    alice.send(ClientMessage::Leave).await;
    alice.session.leave();
    assert_eq!(registry.room_count().await, 0);

    let bob = Peer::join(&registry, "room", "Bob").await;
    assert!(bob.session.adapter().is_empty());
}
