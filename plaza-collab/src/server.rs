//! WebSocket relay: signaling plus per-space document rooms.
//!
//! ```text
//!               ┌── /signal ──────▸ PeerRegistry ──▸ per-peer outbox
//! TCP accept ───┤
//!               └── /doc/{space} ─▸ DocumentRoom
//!                                     ├── SpaceDocument (authoritative, in memory)
//!                                     └── BroadcastGroup (fan-out)
//! ```
//!
//! Rooms live only while a sync client is attached. When a signaling
//! socket closes, the relay deletes that peer's entry and owned
//! screen-shares from the room document itself, so a crashed client never
//! leaves a ghost behind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use plaza_core::{Collection, ScreenShareEntry, SpaceDocument};

use crate::broadcast::{BroadcastGroup, ConnectionId, Frame};
use crate::events::{ClientEvent, ServerEvent};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::registry::{Departure, PeerRegistry, SpawnRegion};

/// Origin id used for frames the relay itself produces.
const RELAY_ORIGIN: ConnectionId = 0;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document room
    pub broadcast_capacity: usize,
    /// Join/leave events kept per space
    pub activity_history: usize,
    /// Seconds between `space-activity` broadcasts (0 disables)
    pub activity_interval_secs: u64,
    /// Region initial positions are drawn from
    pub spawn: SpawnRegion,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            activity_history: 20,
            activity_interval_secs: 30,
            spawn: SpawnRegion::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PLAZA_BIND_ADDR`, `PLAZA_BROADCAST_CAPACITY`
    /// and `PLAZA_ACTIVITY_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("PLAZA_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = env_parse("PLAZA_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity;
        }
        if let Some(secs) = env_parse("PLAZA_ACTIVITY_INTERVAL_SECS") {
            config.activity_interval_secs = secs;
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={raw}");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_spaces: usize,
    pub active_rooms: usize,
    pub ghosts_purged: u64,
}

/// Authoritative document for one space.
struct DocumentRoom {
    doc: SpaceDocument,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: SpaceDocument::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

struct Shared {
    config: ServerConfig,
    registry: PeerRegistry,
    rooms: RwLock<HashMap<String, DocumentRoom>>,
    stats: RwLock<ServerStats>,
    next_conn: AtomicU64,
}

type Socket = WebSocketStream<TcpStream>;

enum Route {
    Signal,
    Document(String),
}

fn route(path: &str) -> Option<Route> {
    if path == "/signal" {
        return Some(Route::Signal);
    }
    let space = path.strip_prefix("/doc/")?;
    if space.is_empty() || space.contains('/') {
        return None;
    }
    Some(Route::Document(space.to_string()))
}

#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = PeerRegistry::new(config.spawn, config.activity_history);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                next_conn: AtomicU64::new(RELAY_ORIGIN + 1),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.shared.registry
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let interval = self.shared.config.activity_interval_secs;
        if interval > 0 {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let sent = shared.registry.broadcast_activity().await;
                    log::trace!("Sent space-activity to {sent} peers");
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), RelayError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;

        let Some(route) = route(&path) else {
            log::warn!("Rejecting {addr}: unknown path {path}");
            let mut ws = ws;
            ws.close(None).await?;
            return Ok(());
        };

        let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket connection {conn} established from {addr} on {path}");

        let result = match route {
            Route::Signal => Self::handle_signaling(ws, conn, &shared).await,
            Route::Document(space_id) => Self::handle_document(ws, conn, &space_id, &shared).await,
        };

        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {conn} from {addr} closed");
        result
    }

    // ---------------------------------------------------------------
    // Signaling
    // ---------------------------------------------------------------

    async fn handle_signaling(ws: Socket, conn: ConnectionId, shared: &Arc<Shared>) -> Result<(), RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = shared.registry.connect(conn, tx).await;
        log::debug!("Connection {conn} is peer {peer_id}");

        let result = Self::signaling_loop(ws, &peer_id, rx, shared).await;

        // Runs on every exit path, including socket errors.
        if let Some(departure) = shared.registry.disconnect(&peer_id).await {
            Self::purge_ghost(shared, &departure).await;
        }
        result
    }

    async fn signaling_loop(
        ws: Socket,
        peer_id: &str,
        mut outbox: mpsc::UnboundedReceiver<ServerEvent>,
        shared: &Arc<Shared>,
    ) -> Result<(), RelayError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientEvent::from_json(&text) {
                                Ok(event) => Self::handle_client_event(shared, peer_id, event).await,
                                Err(e) => {
                                    log::warn!("Bad signaling frame from {peer_id}: {e}");
                                    let reply = ServerEvent::Error { message: e.to_string() };
                                    ws_sender.send(Message::Text(reply.to_json()?.into())).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {peer_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                event = outbox.recv() => {
                    let Some(event) = event else { break };
                    log::trace!("-> {peer_id}: {}", event.name());
                    ws_sender.send(Message::Text(event.to_json()?.into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_client_event(shared: &Shared, peer_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::JoinSpace { space_id, username } => {
                shared.registry.join_space(peer_id, &space_id, &username).await;
            }
            ClientEvent::Signal { to, signal } => {
                shared.registry.relay_signal(peer_id, &to, signal).await;
            }
            ClientEvent::ScreenShareStarted { share_id } => {
                shared.registry.announce_share(peer_id, &share_id, true).await;
            }
            ClientEvent::ScreenShareStopped { share_id } => {
                shared.registry.announce_share(peer_id, &share_id, false).await;
            }
            ClientEvent::GetSpaceInfo { space_id } => {
                shared.registry.space_info(peer_id, &space_id).await;
            }
        }
    }

    /// Delete a departed peer's entry and owned shares from the room.
    async fn purge_ghost(shared: &Shared, departure: &Departure) {
        let purged = {
            let rooms = shared.rooms.read().await;
            let Some(room) = rooms.get(&departure.space_id) else {
                return;
            };
            let mut deltas = Vec::new();
            deltas.extend(room.doc.delete(Collection::Peers, &departure.peer_id));
            for (share_id, share) in room.doc.entries::<ScreenShareEntry>() {
                if share.peer_id == departure.peer_id {
                    deltas.extend(room.doc.delete(Collection::ScreenShares, &share_id));
                }
            }
            for delta in &deltas {
                let msg = SyncMessage::update(&departure.space_id, 0, delta.clone());
                if let Err(e) = room.broadcast.broadcast(RELAY_ORIGIN, &msg) {
                    log::error!("Failed to broadcast purge for {}: {e}", departure.peer_id);
                }
            }
            deltas.len()
        };
        if purged > 0 {
            log::info!(
                "Purged {purged} stale entries of {} from space {}",
                departure.peer_id,
                departure.space_id
            );
            shared.stats.write().await.ghosts_purged += 1;
        }
    }

    // ---------------------------------------------------------------
    // Document sync
    // ---------------------------------------------------------------

    async fn handle_document(
        ws: Socket,
        conn: ConnectionId,
        space_id: &str,
        shared: &Arc<Shared>,
    ) -> Result<(), RelayError> {
        let (group, rx) = {
            let mut rooms = shared.rooms.write().await;
            let room = rooms
                .entry(space_id.to_string())
                .or_insert_with(|| DocumentRoom::new(shared.config.broadcast_capacity));
            let group = room.broadcast.clone();
            let rx = group.add_member(conn).await;
            shared.stats.write().await.active_rooms = rooms.len();
            (group, rx)
        };
        log::debug!("Connection {conn} synced to space {space_id}");

        let result = Self::document_loop(ws, conn, space_id, rx, &group, shared).await;

        // Cleanup: leave the group and drop the room if it is empty.
        group.remove_member(conn).await;
        let mut rooms = shared.rooms.write().await;
        if let Some(room) = rooms.get(space_id) {
            if Arc::ptr_eq(&room.broadcast, &group) && room.broadcast.member_count().await == 0 {
                rooms.remove(space_id);
                log::info!("Room {space_id} removed (empty)");
            }
        }
        shared.stats.write().await.active_rooms = rooms.len();
        result
    }

    async fn document_loop(
        ws: Socket,
        conn: ConnectionId,
        space_id: &str,
        mut broadcast_rx: broadcast::Receiver<Arc<Frame>>,
        group: &BroadcastGroup,
        shared: &Shared,
    ) -> Result<(), RelayError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode sync frame from {conn}: {e}");
                                    continue;
                                }
                            };
                            if sync_msg.space_id != space_id {
                                log::warn!(
                                    "{}",
                                    ProtocolError::WrongSpace { expected: space_id.to_string(), got: sync_msg.space_id }
                                );
                                continue;
                            }
                            for reply in Self::handle_sync_message(shared, conn, space_id, group, sync_msg, bytes).await {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on sync connection {conn}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == conn {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Sync connection {conn} lagged by {n} frames, resending full state");
                            group.record_dropped(n);
                            let full = {
                                let rooms = shared.rooms.read().await;
                                rooms.get(space_id).map(|r| r.doc.full_state())
                            };
                            if let Some(full) = full {
                                let msg = SyncMessage::sync_step2(space_id, full);
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one inbound sync message; returns replies for the sender.
    async fn handle_sync_message(
        shared: &Shared,
        conn: ConnectionId,
        space_id: &str,
        group: &BroadcastGroup,
        msg: SyncMessage,
        raw: Vec<u8>,
    ) -> Vec<SyncMessage> {
        let rooms = shared.rooms.read().await;
        let Some(room) = rooms.get(space_id) else {
            return Vec::new();
        };

        match msg.msg_type {
            MessageType::SyncStep1 => match room.doc.diff(&msg.payload) {
                Ok(diff) => vec![
                    SyncMessage::sync_step2(space_id, diff),
                    SyncMessage::sync_step1(space_id, room.doc.state_vector()),
                ],
                Err(e) => {
                    log::warn!("Bad state vector from {conn}: {e}");
                    Vec::new()
                }
            },
            MessageType::SyncStep2 | MessageType::Update => {
                if let Err(e) = room.doc.apply_update(&msg.payload) {
                    log::warn!("Rejected update from {conn}: {e}");
                    return Vec::new();
                }
                let update = if msg.msg_type == MessageType::Update {
                    raw
                } else {
                    // Peers only understand incremental updates on the fan-out.
                    match SyncMessage::update(space_id, msg.clock, msg.payload).encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("Failed to re-encode sync step 2: {e}");
                            return Vec::new();
                        }
                    }
                };
                group.broadcast_raw(conn, update);
                Vec::new()
            }
            MessageType::Ping => vec![SyncMessage::pong(space_id)],
            MessageType::Pong => Vec::new(),
        }
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_spaces = self.shared.registry.space_count().await;
        stats.active_rooms = self.shared.rooms.read().await.len();
        stats
    }

    /// Snapshot of a room's document, if the room is live.
    pub async fn room_state(&self, space_id: &str) -> Option<Vec<u8>> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(space_id).map(|r| r.doc.full_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_core::Entity;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.activity_interval_secs, 30);
        assert_eq!(config.spawn, SpawnRegion { min: 1800.0, max: 2200.0 });
    }

    #[test]
    fn test_routes() {
        assert!(matches!(route("/signal"), Some(Route::Signal)));
        assert!(matches!(route("/doc/demo"), Some(Route::Document(s)) if s == "demo"));
        assert!(route("/doc/").is_none());
        assert!(route("/doc/a/b").is_none());
        assert!(route("/").is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_spaces, 0);
        assert_eq!(stats.active_rooms, 0);
        assert!(server.room_state("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_ghost_purge_removes_peer_and_shares() {
        let server = RelayServer::with_defaults();
        let shared = server.shared.clone();
        {
            let mut rooms = shared.rooms.write().await;
            let room = rooms.entry("demo".into()).or_insert_with(|| DocumentRoom::new(8));
            room.doc.set(Collection::Peers, "p1", &plaza_core::PeerEntry::new("Alice", 0.0, 0.0).to_fields());
            room.doc.set(Collection::Peers, "p2", &plaza_core::PeerEntry::new("Bob", 0.0, 0.0).to_fields());
            let share = ScreenShareEntry {
                peer_id: "p1".into(),
                username: "Alice".into(),
                x: 0.0,
                y: 0.0,
                width: 640.0,
                height: 480.0,
            };
            room.doc.set(Collection::ScreenShares, "s1", &share.to_fields());
        }
        let mut rx = {
            let rooms = shared.rooms.read().await;
            rooms["demo"].broadcast.add_member(7).await
        };

        RelayServer::purge_ghost(
            &shared,
            &Departure {
                peer_id: "p1".into(),
                space_id: "demo".into(),
                username: "Alice".into(),
                space_closed: false,
            },
        )
        .await;

        let rooms = shared.rooms.read().await;
        let doc = &rooms["demo"].doc;
        assert!(!doc.contains(Collection::Peers, "p1"));
        assert!(doc.contains(Collection::Peers, "p2"));
        assert_eq!(doc.len(Collection::ScreenShares), 0);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, RELAY_ORIGIN);
        assert_eq!(SyncMessage::decode(&frame.bytes).unwrap().msg_type, MessageType::Update);
        assert_eq!(server.stats().await.ghosts_purged, 1);
    }
}
