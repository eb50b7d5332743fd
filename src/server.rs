//! WebSocket sequencer with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document_id) ── SequencedLog ── BroadcastGroup
//! Client B ──┘                                │
//!                                   ┌─────────┼─────────┐
//!                                   ▼         ▼         ▼
//!                                Client A  Client B  Client C
//! ```
//!
//! Each document room keeps the authoritative operation log and a
//! broadcast group for fan-out. The server assigns every accepted
//! operation the next version in receipt order; the submitter gets an
//! `operation_processed` ack while everyone else receives
//! `operation_applied`. Because version assignment and publication
//! happen under the same lock, broadcasts leave the room in strictly
//! ascending version order.
//!
//! Clients identify themselves in the connection URL:
//! `/ws/{document_id}/{user_id}?username=...&avatar_url=...`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::protocol::{
    ClientMessage, Comment, CursorPosition, Operation, OperationType, Presence, ProtocolError,
    ServerMessage, Session, SyncStatus, now_millis,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per document room
    pub max_participants_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// Who is connecting, parsed from the handshake URL.
///
/// Path segments and query values are percent-decoded, mirroring the
/// encoding the client applies when it builds the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub document_id: String,
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl ClientIdentity {
    fn from_request(req: &Request) -> Result<Self, String> {
        let uri = req.uri();
        let mut segments = uri.path().trim_matches('/').split('/');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some("ws"), Some(doc), Some(user), None) if !doc.is_empty() && !user.is_empty() => {
                let mut username = None;
                let mut avatar_url = None;
                for pair in uri.query().unwrap_or("").split('&') {
                    let mut kv = pair.splitn(2, '=');
                    match (kv.next(), kv.next()) {
                        (Some("username"), Some(v)) if !v.is_empty() => {
                            username = Some(decoded(v)?);
                        }
                        (Some("avatar_url"), Some(v)) if !v.is_empty() => {
                            avatar_url = Some(decoded(v)?);
                        }
                        _ => {}
                    }
                }
                let user = decoded(user)?;
                Ok(Self {
                    document_id: decoded(doc)?,
                    username: username.unwrap_or_else(|| user.clone()),
                    user_id: user,
                    avatar_url,
                })
            }
            _ => Err(format!(
                "expected path /ws/{{document_id}}/{{user_id}}, got {}",
                uri.path()
            )),
        }
    }
}

fn decoded(value: &str) -> Result<String, String> {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .map_err(|e| format!("invalid percent-encoding in {value:?}: {e}"))
}

/// The authoritative, totally ordered operation log for one document.
struct SequencedLog {
    version: u64,
    operations: Vec<Operation>,
}

impl SequencedLog {
    fn new() -> Self {
        Self {
            version: 0,
            operations: Vec::new(),
        }
    }

    fn find(&self, id: Uuid) -> Option<&Operation> {
        self.operations.iter().rev().find(|op| op.id == id)
    }

    fn append(
        &mut self,
        id: Uuid,
        op_type: OperationType,
        path: Vec<String>,
        payload: serde_json::Value,
        origin_user: &str,
        dependencies: Vec<Uuid>,
    ) -> Operation {
        self.version += 1;
        let operation = Operation {
            id,
            op_type,
            path,
            payload,
            origin_user: origin_user.to_string(),
            timestamp: now_millis(),
            version: self.version,
            dependencies,
        };
        self.operations.push(operation.clone());
        operation
    }

    fn since(&self, from_version: u64) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.version > from_version)
            .cloned()
            .collect()
    }
}

/// One document room: authoritative log plus fan-out group.
pub struct DocumentRoom {
    document_id: String,
    log: Mutex<SequencedLog>,
    group: BroadcastGroup,
}

impl DocumentRoom {
    pub fn new(document_id: impl Into<String>, broadcast_capacity: usize) -> Self {
        Self {
            document_id: document_id.into(),
            log: Mutex::new(SequencedLog::new()),
            group: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub async fn current_version(&self) -> u64 {
        self.log.lock().await.version
    }

    /// Session record plus roster, for `session_joined`.
    pub async fn session_snapshot(&self) -> (Session, Vec<Presence>) {
        let version = self.log.lock().await.version;
        let mut roster = self.group.roster().await;
        roster.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut session = Session::new(&self.document_id);
        session.version = version;
        session.participants = roster.iter().map(|p| p.user_id.clone()).collect();
        (session, roster)
    }

    /// Sequence one operation and broadcast it to everyone else.
    ///
    /// Version assignment and publication happen under the log lock so
    /// the room never emits `operation_applied` out of order. A replay
    /// of an already-sequenced operation id returns the original
    /// without re-appending.
    pub async fn commit(
        &self,
        origin_user: &str,
        id: Uuid,
        op_type: OperationType,
        path: Vec<String>,
        payload: serde_json::Value,
        dependencies: Vec<Uuid>,
    ) -> Result<Operation, ProtocolError> {
        let mut log = self.log.lock().await;
        if let Some(existing) = log.find(id) {
            log::debug!("Operation {id} already sequenced at v{}", existing.version);
            return Ok(existing.clone());
        }

        let operation = log.append(id, op_type, path, payload, origin_user, dependencies);
        let applied = ServerMessage::OperationApplied {
            operation: operation.clone(),
            version: operation.version,
        };
        self.group.publish(&applied, Some(origin_user))?;
        Ok(operation)
    }

    /// Answer a catch-up request from the given watermark.
    pub async fn answer_sync(&self, from_version: u64) -> ServerMessage {
        let log = self.log.lock().await;
        if from_version >= log.version {
            ServerMessage::SyncResponse {
                status: SyncStatus::UpToDate,
                current_version: log.version,
                operations: Vec::new(),
                dashboard_state: None,
            }
        } else {
            ServerMessage::SyncResponse {
                status: SyncStatus::SyncRequired,
                current_version: log.version,
                operations: log.since(from_version),
                dashboard_state: None,
            }
        }
    }
}

/// Maps document ids to their rooms.
pub struct SessionHub {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    broadcast_capacity: usize,
}

impl SessionHub {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    pub async fn get_or_create(&self, document_id: &str) -> Arc<DocumentRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-checked
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }

        let room = Arc::new(DocumentRoom::new(document_id, self.broadcast_capacity));
        rooms.insert(document_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn remove_if_empty(&self, document_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            if room.group.participant_count().await == 0 {
                rooms.remove(document_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<SessionHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(SessionHub::new(config.broadcast_capacity));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<SessionHub>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut identity: Option<ClientIdentity> = None;
        let ws_stream =
            tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                match ClientIdentity::from_request(req) {
                    Ok(parsed) => {
                        identity = Some(parsed);
                        Ok(resp)
                    }
                    Err(reason) => {
                        log::warn!("Rejected handshake from {addr}: {reason}");
                        let mut response = ErrorResponse::new(Some(reason));
                        *response.status_mut() = StatusCode::BAD_REQUEST;
                        Err(response)
                    }
                }
            })
            .await?;

        let Some(identity) = identity else {
            // Handshake succeeded without running the callback; nothing to serve.
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let room = hub.get_or_create(&identity.document_id).await;

        if room.group.participant_count().await >= config.max_participants_per_room {
            log::warn!(
                "Room {} is full, refusing {}",
                identity.document_id,
                identity.user_id
            );
            let refusal = ServerMessage::Error {
                message: "room is full".to_string(),
            };
            ws_sender.send(Message::Text(refusal.encode()?.into())).await?;
            ws_sender.send(Message::Close(None)).await?;
            let mut s = stats.write().await;
            s.active_connections -= 1;
            return Ok(());
        }

        let mut presence = Presence::new(&identity.user_id, &identity.username);
        if let Some(url) = &identity.avatar_url {
            presence = presence.with_avatar(url);
        }
        let mut room_rx = room.group.join(presence.clone()).await;

        // The new participant gets the session and roster directly.
        let (session, roster) = room.session_snapshot().await;
        let joined = ServerMessage::SessionJoined {
            session,
            presence: roster,
        };
        ws_sender.send(Message::Text(joined.encode()?.into())).await?;

        // Everyone else learns about the new participant.
        let announce = ServerMessage::UserJoined {
            user_id: identity.user_id.clone(),
            presence,
        };
        if let Err(e) = room.group.publish(&announce, Some(&identity.user_id)) {
            log::error!("Failed to announce {}: {e}", identity.user_id);
        }

        {
            let mut s = stats.write().await;
            s.active_rooms = hub.room_count().await;
        }
        log::info!(
            "{} joined document {} from {addr}",
            identity.user_id,
            identity.document_id
        );

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            match ClientMessage::decode(raw.as_str()) {
                                Ok(frame) => {
                                    if let Some(reply) =
                                        Self::handle_frame(&identity, &room, frame).await?
                                    {
                                        ws_sender
                                            .send(Message::Text(reply.encode()?.into()))
                                            .await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!(
                                        "Malformed frame from {} ({addr}): {e}",
                                        identity.user_id
                                    );
                                    let err = ServerMessage::Error {
                                        message: format!("malformed message: {e}"),
                                    };
                                    ws_sender
                                        .send(Message::Text(err.encode()?.into()))
                                        .await?;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = room_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Never echo a participant's own frames back.
                            if frame.origin.as_deref() == Some(identity.user_id.as_str()) {
                                continue;
                            }
                            ws_sender
                                .send(Message::Text(frame.payload.clone().into()))
                                .await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("{} lagged by {n} frames", identity.user_id);
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: leave the room and tell the others.
        room.group.leave(&identity.user_id).await;
        let mut remaining: Vec<String> = room
            .group
            .roster()
            .await
            .iter()
            .map(|p| p.user_id.clone())
            .collect();
        remaining.sort();
        let left = ServerMessage::UserLeft {
            user_id: identity.user_id.clone(),
            remaining_participants: remaining,
        };
        if let Err(e) = room.group.publish(&left, Some(&identity.user_id)) {
            log::error!("Failed to announce departure of {}: {e}", identity.user_id);
        }
        if hub.remove_if_empty(&identity.document_id).await {
            log::info!("Room {} removed (empty)", identity.document_id);
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = hub.room_count().await;
        }

        Ok(())
    }

    /// Process one decoded frame. Returns a direct reply for the
    /// sender; room-wide effects are published inside.
    async fn handle_frame(
        identity: &ClientIdentity,
        room: &DocumentRoom,
        frame: ClientMessage,
    ) -> Result<Option<ServerMessage>, ProtocolError> {
        match frame {
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),

            ClientMessage::Operation {
                operation_id,
                operation_type,
                path,
                operation_data,
                version,
                dependencies,
            } => {
                let operation = room
                    .commit(
                        &identity.user_id,
                        operation_id,
                        operation_type,
                        path,
                        operation_data,
                        dependencies,
                    )
                    .await?;
                log::debug!(
                    "{} op {} sequenced at v{} (client base v{version})",
                    identity.user_id,
                    operation_id,
                    operation.version
                );
                Ok(Some(ServerMessage::OperationProcessed {
                    operation_id,
                    new_version: operation.version,
                }))
            }

            ClientMessage::CursorMove {
                x, y, element_id, ..
            } => {
                let mut cursor = CursorPosition::new(x, y);
                if let Some(element) = element_id {
                    cursor = cursor.with_element(element);
                }
                let moved = ServerMessage::CursorMoved {
                    user_id: identity.user_id.clone(),
                    cursor,
                };
                room.group.publish(&moved, Some(&identity.user_id))?;
                Ok(None)
            }

            ClientMessage::ActivityUpdate { action, element_id } => {
                let updated = ServerMessage::ActivityUpdated {
                    user_id: identity.user_id.clone(),
                    action,
                    element_id,
                };
                room.group.publish(&updated, Some(&identity.user_id))?;
                Ok(None)
            }

            ClientMessage::SyncRequest { from_version } => {
                log::debug!(
                    "{} requested sync from v{from_version}",
                    identity.user_id
                );
                Ok(Some(room.answer_sync(from_version).await))
            }

            ClientMessage::AddComment {
                comment_id,
                element_id,
                text,
                position,
                parent_id,
                user_id,
                username,
            } => {
                if user_id != identity.user_id {
                    log::warn!(
                        "Comment author {user_id} does not match connection {}",
                        identity.user_id
                    );
                }
                let comment = Comment {
                    id: comment_id,
                    element_id,
                    text,
                    position,
                    author: identity.user_id.clone(),
                    author_name: username,
                    timestamp: now_millis(),
                    resolved: false,
                    replies: Vec::new(),
                };
                let added = ServerMessage::CommentAdded { comment, parent_id };
                // Everyone, origin included: the origin reconciles by id.
                room.group.publish(&added, None)?;
                Ok(None)
            }

            ClientMessage::ResolveComment { comment_id } => {
                let resolved = ServerMessage::CommentResolved { comment_id };
                room.group.publish(&resolved, None)?;
                Ok(None)
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }
}
