//! WebSocket session client.
//!
//! Wraps a [`Session`] around a socket:
//! - Join handshake (connect, `Join`, wait for the verdict)
//! - Writer task draining an outgoing channel
//! - Reader task feeding server messages through the session
//! - Capture pump forwarding locally drawn operations
//!
//! ```text
//!  LocalPen ──► CaptureStream ──► capture pump ──┐
//!  undo / clear / leave ─────────────────────────┼──► outgoing ──► writer ──► ws
//!                                                │
//!  events ◄── reader ◄── ws    (Session behind a Mutex, shared by all tasks)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::{CanvasAdapter, CaptureStream};
use crate::codec::CodecError;
use crate::operation::{Operation, ParticipantId};
use crate::presence::Participant;
use crate::protocol::{ClientMessage, JoinRequest, ServerMessage};
use crate::session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Buffered session events before the reader waits on the application.
    pub event_capacity: usize,
    /// Buffered outgoing messages before senders wait on the socket.
    pub outgoing_capacity: usize,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            outgoing_capacity: 256,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("join rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("connection closed")]
    ConnectionClosed,
}

type Outgoing = Arc<Mutex<Option<mpsc::Sender<ClientMessage>>>>;

/// A participant connected to a room server.
pub struct SyncClient<A: CanvasAdapter + 'static> {
    server_url: String,
    session: Arc<Mutex<Session<A>>>,
    outgoing: Outgoing,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    /// Bumped per connection so a stale reader cannot touch a newer one.
    epoch: Arc<AtomicU64>,
    config: ClientConfig,
}

impl<A: CanvasAdapter + 'static> SyncClient<A> {
    pub fn new(adapter: A, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            server_url: server_url.into(),
            session: Arc::new(Mutex::new(Session::new(adapter, config.session.clone()))),
            outgoing: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            epoch: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    pub async fn participant_id(&self) -> Option<ParticipantId> {
        self.session.lock().await.participant_id()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.session.lock().await.roster().users().to_vec()
    }

    /// Run `f` against the canvas adapter.
    pub async fn canvas<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(self.session.lock().await.adapter())
    }

    /// Connect, join a room and start the background tasks.
    ///
    /// Resolves once the server accepted or rejected the join.
    pub async fn join(&mut self, request: JoinRequest) -> Result<ParticipantId, ClientError> {
        let join_msg = self.session.lock().await.begin_join(request)?;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.session.lock().await.transport_lost();
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let sent = match join_msg.encode() {
            Ok(encoded) => ws_writer.send(Message::Binary(encoded.into())).await.is_ok(),
            Err(e) => {
                self.session.lock().await.transport_lost();
                return Err(e.into());
            }
        };
        if !sent {
            self.session.lock().await.transport_lost();
            return Err(ClientError::ConnectionClosed);
        }

        let verdict = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerMessage::decode(&bytes) {
                        Ok(msg @ ServerMessage::JoinAccepted(_))
                        | Ok(msg @ ServerMessage::JoinRejected { .. }) => break msg,
                        Ok(other) => debug!("Ignoring {:?} before join verdict", other),
                        Err(e) => warn!("Malformed frame from server: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.session.lock().await.transport_lost();
                    return Err(ClientError::ConnectionClosed);
                }
                Some(Err(e)) => {
                    self.session.lock().await.transport_lost();
                    return Err(ClientError::Connect(e.to_string()));
                }
                Some(Ok(_)) => {}
            }
        };

        let participant_id = {
            let mut session = self.session.lock().await;
            match session.handle_server(verdict) {
                Some(SessionEvent::Rejected { reason }) => {
                    drop(session);
                    let _ = ws_writer.close().await;
                    return Err(ClientError::Rejected(reason));
                }
                Some(event) => {
                    let id = session.participant_id();
                    let _ = self.event_tx.try_send(event);
                    id
                }
                None => None,
            }
        };
        let Some(participant_id) = participant_id else {
            self.session.lock().await.transport_lost();
            return Err(ClientError::ConnectionClosed);
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(self.config.outgoing_capacity.max(1));
        *self.outgoing.lock().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let leaving = matches!(msg, ClientMessage::Leave);
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Dropping unencodable {}: {e}", msg.name());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
                if leaving {
                    let _ = ws_writer.close().await;
                    break;
                }
            }
        });

        // Reader task: feed server messages through the session
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();
        let outgoing = self.outgoing.clone();
        let current_epoch = self.epoch.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!("Dropping malformed frame from server: {e}");
                                continue;
                            }
                        };
                        if current_epoch.load(Ordering::SeqCst) != epoch {
                            break;
                        }
                        let event = session.lock().await.handle_server(server_msg);
                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            if current_epoch.load(Ordering::SeqCst) == epoch {
                outgoing.lock().await.take();
                let lost = session.lock().await.transport_lost();
                if let Some(evt) = lost {
                    let _ = event_tx.send(evt).await;
                }
            }
        });

        let capture = self.session.lock().await.take_capture();
        if let Some(capture) = capture {
            tokio::spawn(capture_pump(
                capture,
                Arc::downgrade(&self.session),
                self.outgoing.clone(),
            ));
        }

        info!("Joined room as {participant_id}");
        Ok(participant_id)
    }

    /// Submit an operation drawn outside the adapter's pen.
    pub async fn draw(&self, draft: Operation) -> Result<(), ClientError> {
        let msg = self.session.lock().await.capture(draft)?;
        self.send(msg).await
    }

    /// Undo the last local object. Returns `false` if there was nothing to undo.
    pub async fn undo(&self) -> Result<bool, ClientError> {
        let msg = self.session.lock().await.undo()?;
        match msg {
            Some(msg) => self.send(msg).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Clear the canvas for everyone in the room.
    pub async fn clear(&self) -> Result<(), ClientError> {
        let msg = self.session.lock().await.clear()?;
        self.send(msg).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the room and close the socket. No-op when disconnected.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let msg = self.session.lock().await.leave();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let sender = self.outgoing.lock().await.take();
        match (msg, sender) {
            (Some(msg), Some(sender)) => sender
                .send(msg)
                .await
                .map_err(|_| ClientError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let sender = self.outgoing.lock().await.clone();
        let sender = sender.ok_or(ClientError::ConnectionClosed)?;
        sender
            .send(msg)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

async fn capture_pump<A: CanvasAdapter + 'static>(
    mut capture: CaptureStream,
    session: Weak<Mutex<Session<A>>>,
    outgoing: Outgoing,
) {
    while let Some(draft) = capture.next().await {
        let Some(shared) = session.upgrade() else {
            break;
        };
        let msg = {
            let mut session = shared.lock().await;
            if session.state() != SessionState::Joined {
                debug!("Not joined, discarding captured {}", draft.kind.name());
                continue;
            }
            session.capture(draft)
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to capture operation: {e}");
                continue;
            }
        };
        let sender = outgoing.lock().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(msg).await;
        }
    }
}
