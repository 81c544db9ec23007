//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌─ Room "abc123" ── log, sequence ── BroadcastGroup
//!             ├── Connection ──┤                                        │
//! Client B ──┘   (per socket)  └─ Room "k9x2"  ...          ┌───────────┼───────────┐
//!                                                           ▼           ▼           ▼
//!                                                       Client A    Client B    Client C
//! ```
//!
//! One task per socket. Each task multiplexes inbound frames and the room
//! stream with `tokio::select!`; a failure in one socket never touches the
//! others. Whatever ends the loop, the participant leaves its room.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::SubscriptionError;
use crate::connection::Connection;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{RegistryConfig, RoomRegistry};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Drop superseded log entries when a room is cleared
    pub truncate_log_on_clear: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_room: 100,
            broadcast_capacity: 256,
            truncate_log_on_clear: false,
        }
    }
}

impl From<&ServerConfig> for RegistryConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_participants_per_room: config.max_participants_per_room,
            broadcast_capacity: config.broadcast_capacity,
            truncate_log_on_clear: config.truncate_log_on_clear,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_rooms: usize,
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(RegistryConfig::from(&config)));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Whiteboard server listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut connection = Connection::new(registry, addr.to_string());
        let result = Self::pump(&mut connection, &mut ws_sender, &mut ws_receiver, &stats, addr).await;

        // Transport closure is an implicit leave.
        connection.leave().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn pump(
        connection: &mut Connection,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        stats: &RwLock<ServerStats>,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientMessage::decode(&bytes) {
                                Ok(client_msg) => {
                                    for reply in connection.handle(client_msg).await {
                                        send(ws_sender, &reply).await?;
                                    }
                                }
                                Err(e) => {
                                    warn!("Dropping malformed frame from {addr}: {e}");
                                    stats.write().await.malformed_frames += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Text(_))) => {
                            warn!("Dropping text frame from {addr}");
                            stats.write().await.malformed_frames += 1;
                        }

                        Some(Err(e)) => return Err(e.into()),

                        Some(Ok(_)) => {}
                    }
                }

                event = connection.next_event() => {
                    match event {
                        Ok(msg) => send(ws_sender, &msg).await?,
                        Err(SubscriptionError::Lagged(n)) => {
                            warn!("Peer {addr} lagged by {n} events, disconnecting");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        Err(SubscriptionError::Closed) => {
                            debug!("Room stream closed for {addr}");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Server statistics, with the current room count.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
