//! WebSocket relay with one room per document.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── ws://host/{room} ── Room ── ReplicaStore (authority)
//! Client B ──┘                          │
//!                                       ├── awareness cache
//!                                       └── BroadcastGroup
//!                                                │
//!                                     ┌──────────┼───────────┐
//!                                     ▼          ▼           ▼
//!                                  Client A   Client B    Client C
//! ```
//!
//! Each room keeps an authoritative replica so late joiners catch up from
//! the relay alone, plus the latest awareness frame of every peer so they
//! see who is already present. Rooms are created on first connection and
//! removed when the last connection leaves.
//!
//! The room name is checked during the HTTP upgrade. Invalid names are
//! refused with 400 and full rooms with 403; clients treat both as final.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::replica::{ReplicaStore, StateVector};

/// Host the relay binds when `SCRIBE_RELAY_HOST` is unset.
pub const DEFAULT_RELAY_HOST: &str = "localhost";
/// Port the relay binds when `SCRIBE_RELAY_PORT` is unset.
pub const DEFAULT_RELAY_PORT: u16 = 1234;
/// Connections allowed per room when `SCRIBE_RELAY_MAX_PEERS` is unset.
pub const DEFAULT_MAX_PEERS: usize = 100;

pub const HOST_ENV: &str = "SCRIBE_RELAY_HOST";
pub const PORT_ENV: &str = "SCRIBE_RELAY_PORT";
pub const MAX_PEERS_ENV: &str = "SCRIBE_RELAY_MAX_PEERS";

/// Longest accepted room name, in bytes.
pub const MAX_ROOM_NAME_LEN: usize = 128;

/// Peer id the relay stamps on its own sync frames.
pub const RELAY_PEER_ID: Uuid = Uuid::nil();

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

// ───────────────────────── Configuration ─────────────────────────

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections admitted per room
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{DEFAULT_RELAY_HOST}:{DEFAULT_RELAY_PORT}"),
            max_peers_per_room: DEFAULT_MAX_PEERS,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `SCRIBE_RELAY_HOST`, `SCRIBE_RELAY_PORT` and
    /// `SCRIBE_RELAY_MAX_PEERS`. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let host = lookup(HOST_ENV)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string());
        let port = parse_var(&lookup, PORT_ENV).unwrap_or(DEFAULT_RELAY_PORT);
        config.bind_addr = format!("{host}:{port}");

        if let Some(max) = parse_var::<usize>(&lookup, MAX_PEERS_ENV) {
            if max == 0 {
                log::warn!("Ignoring {MAX_PEERS_ENV}=0");
            } else {
                config.max_peers_per_room = max;
            }
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

// ───────────────────────── Errors ─────────────────────────

/// Errors that end one relay connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why a connection was refused during the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomRejection {
    #[error("invalid room name {0:?}")]
    InvalidName(String),
    #[error("room {room} is full ({max} peers)")]
    RoomFull { room: String, max: usize },
    #[error("room unavailable: {0}")]
    Unavailable(String),
}

impl RoomRejection {
    /// HTTP status the upgrade is refused with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidName(_) => StatusCode::BAD_REQUEST,
            Self::RoomFull { .. } => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Extract and check the room name from a request path such as `/doc-42`.
///
/// Names are 1 to 128 bytes of ASCII letters, digits, `.`, `_` and `-`.
pub fn room_from_path(path: &str) -> Result<&str, RoomRejection> {
    let name = path.strip_prefix('/').unwrap_or(path);
    let valid = !name.is_empty()
        && name.len() <= MAX_ROOM_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(name)
    } else {
        Err(RoomRejection::InvalidName(name.to_string()))
    }
}

// ───────────────────────── Rooms ─────────────────────────

struct Room {
    name: String,
    replica: tokio::sync::Mutex<ReplicaStore>,
    broadcast: BroadcastGroup,
    /// Latest awareness frame per present peer
    awareness: tokio::sync::Mutex<HashMap<Uuid, SyncMessage>>,
}

impl Room {
    fn new(name: &str, broadcast_capacity: usize) -> Result<Self, RoomRejection> {
        let replica = ReplicaStore::new().map_err(|e| RoomRejection::Unavailable(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            replica: tokio::sync::Mutex::new(replica),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

struct Admission {
    room: Arc<Room>,
    events: broadcast::Receiver<Envelope>,
}

/// Room map. Admission runs inside the synchronous upgrade callback, so the
/// map sits behind a std mutex that is never held across an await.
struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    max_peers_per_room: usize,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    fn new(config: &RelayConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            max_peers_per_room: config.max_peers_per_room,
            broadcast_capacity: config.broadcast_capacity,
        }
    }

    fn admit(&self, path: &str, conn_id: Uuid, addr: SocketAddr) -> Result<Admission, RoomRejection> {
        let name = room_from_path(path)?;
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);

        let room = match rooms.get(name) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(Room::new(name, self.broadcast_capacity)?);
                rooms.insert(name.to_string(), room.clone());
                log::info!("Room {name} created");
                room
            }
        };

        if room.broadcast.peer_count() >= self.max_peers_per_room {
            return Err(RoomRejection::RoomFull {
                room: name.to_string(),
                max: self.max_peers_per_room,
            });
        }
        let events = room.broadcast.add_peer(conn_id, addr);
        Ok(Admission { room, events })
    }

    /// Drop a connection; the room goes with its last connection.
    fn release(&self, room: &Arc<Room>, conn_id: &Uuid) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        room.broadcast.remove_peer(conn_id);
        if room.broadcast.peer_count() == 0
            && rooms.get(&room.name).is_some_and(|r| Arc::ptr_eq(r, room))
        {
            rooms.remove(&room.name);
            log::info!("Room {} removed (empty)", room.name);
        }
    }

    fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn len(&self) -> usize {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// ───────────────────────── Server ─────────────────────────

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames lagging connections skipped; each lag is answered with the
    /// full room state
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a relay. Nothing is bound until [`run`](Self::run).
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(&config)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Address [`run`](Self::run) binds.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Server-wide counters, with the number of open rooms filled in.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.len();
        stats
    }

    /// Fan-out counters of `room`, if it is open.
    pub fn room_stats(&self, room: &str) -> Option<BroadcastStats> {
        self.registry.get(room).map(|r| r.broadcast.stats())
    }

    /// Number of rooms with at least one connection.
    pub fn room_count(&self) -> usize {
        self.registry.len()
    }

    /// Connections currently in `room`.
    pub fn peer_count(&self, room: &str) -> usize {
        self.registry
            .get(room)
            .map_or(0, |r| r.broadcast.peer_count())
    }

    /// Authoritative content of `room`, if it is open.
    pub async fn room_content(&self, room: &str) -> Option<String> {
        let room = self.registry.get(room)?;
        let content = room.replica.lock().await.snapshot();
        Some(content)
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), RelayError> {
    let conn_id = Uuid::new_v4();
    let mut admission = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match registry.admit(request.uri().path(), conn_id, addr) {
            Ok(admitted) => {
                admission = Some(admitted);
                Ok(response)
            }
            Err(rejection) => {
                log::info!("Refused {addr} for {}: {rejection}", request.uri().path());
                Err(rejection.into_response())
            }
        }
    };
    let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;

    let (ws, Admission { room, events }) = match (handshake, admission) {
        (Ok(ws), Some(admitted)) => (ws, admitted),
        (Ok(_), None) => return Ok(()),
        (Err(e), Some(admitted)) => {
            registry.release(&admitted.room, &conn_id);
            return Err(e.into());
        }
        (Err(_), None) => {
            stats.write().await.rejected_connections += 1;
            return Ok(());
        }
    };

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("{addr} joined room {} ({} peers)", room.name, room.broadcast.peer_count());

    let mut connection = Connection {
        conn_id,
        addr,
        room,
        client_peer: None,
    };
    let result = connection.pump(ws, events, &stats).await;
    connection.depart().await;
    registry.release(&connection.room, &conn_id);

    stats.write().await.active_connections -= 1;
    log::info!("{addr} left room {}", connection.room.name);
    result
}

struct Connection {
    conn_id: Uuid,
    addr: SocketAddr,
    room: Arc<Room>,
    /// Peer id the client stamps on its frames, learned from the first one
    client_peer: Option<Uuid>,
}

impl Connection {
    async fn pump(
        &mut self,
        ws: WebSocketStream<TcpStream>,
        mut events: broadcast::Receiver<Envelope>,
        stats: &RwLock<RelayStats>,
    ) -> Result<(), RelayError> {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                self.client_peer.get_or_insert(msg.peer_id);
                                self.handle(msg, &mut sink).await?;
                            }
                            Err(e) => log::warn!("Failed to decode frame from {}: {e}", self.addr),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },

                envelope = events.recv() => match envelope {
                    Ok(envelope) if envelope.from == self.conn_id => {}
                    Ok(envelope) => {
                        sink.send(Message::Binary(envelope.frame.to_vec().into())).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("{} lagged by {skipped} frames; resending full state", self.addr);
                        self.room.broadcast.record_dropped(skipped);
                        stats.write().await.messages_dropped += skipped;
                        let full = {
                            let mut replica = self.room.replica.lock().await;
                            replica.missing_since(&StateVector::default())
                        };
                        send(&mut sink, &SyncMessage::sync_step2(RELAY_PEER_ID, &full)).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn handle(&self, msg: SyncMessage, sink: &mut WsSink) -> Result<(), RelayError> {
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let state_vector = match msg.state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Bad state vector from {}: {e}", self.addr);
                        return Ok(());
                    }
                };
                let (answer, own) = {
                    let mut replica = self.room.replica.lock().await;
                    let missing = replica.missing_since(&state_vector);
                    (
                        SyncMessage::sync_step2(RELAY_PEER_ID, &missing),
                        SyncMessage::sync_step1(RELAY_PEER_ID, &replica.state_vector()),
                    )
                };
                send(sink, &answer).await?;
                send(sink, &own).await?;

                let present: Vec<SyncMessage> = self
                    .room
                    .awareness
                    .lock()
                    .await
                    .values()
                    .filter(|m| m.peer_id != msg.peer_id)
                    .cloned()
                    .collect();
                for frame in &present {
                    send(sink, frame).await?;
                }
            }

            MessageType::SyncStep2 | MessageType::Update => {
                let batch = match msg.operations() {
                    Ok(batch) if batch.is_empty() => return Ok(()),
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("Dropping undecodable operations from {}: {e}", self.addr);
                        return Ok(());
                    }
                };
                let applied = self.room.replica.lock().await.apply_remote_batch(batch);
                match applied {
                    Ok(_) => {
                        let relayed = SyncMessage {
                            msg_type: MessageType::Update,
                            ..msg
                        };
                        self.room.broadcast.broadcast(self.conn_id, &relayed)?;
                    }
                    Err(e) => log::warn!("Dropping operations from {}: {e}", self.addr),
                }
            }

            MessageType::Awareness => {
                let state = match msg.awareness_state() {
                    Ok(state) => state,
                    Err(e) => {
                        log::trace!("Dropping awareness from {}: {e}", self.addr);
                        return Ok(());
                    }
                };
                {
                    let mut cache = self.room.awareness.lock().await;
                    match state {
                        Some(_) => {
                            let newer = cache.get(&msg.peer_id).map_or(true, |c| msg.clock > c.clock);
                            if !newer {
                                return Ok(());
                            }
                            cache.insert(msg.peer_id, msg.clone());
                        }
                        None => {
                            cache.remove(&msg.peer_id);
                        }
                    }
                }
                self.room.broadcast.broadcast(self.conn_id, &msg)?;
            }
        }
        Ok(())
    }

    /// Tell the room this client is gone unless it already said so.
    async fn depart(&self) {
        let Some(peer) = self.client_peer else {
            return;
        };
        let last = self.room.awareness.lock().await.remove(&peer);
        if let Some(last) = last {
            let farewell = SyncMessage::awareness(peer, last.clock + 1, None);
            if let Err(e) = self.room.broadcast.broadcast(self.conn_id, &farewell) {
                log::warn!("Failed to announce departure of {peer}: {e}");
            }
        }
    }
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), RelayError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
