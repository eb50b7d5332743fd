//! The collaboration engine a dashboard embeds.
//!
//! [`CollabClient`] owns one [`ConnectionManager`] plus the local
//! replica (operation log, presence roster, comment store) and wires
//! them together: inbound frames mutate the replica and surface as
//! [`EngineEvent`]s, outbound edits go through the single-in-flight
//! submission path. A background dispatch task drives everything; the
//! embedding application only calls the async methods here and drains
//! the event channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::comments::CommentStore;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy,
};
use crate::history::{self, VersionGroup};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientMessage, Comment, CursorPosition, Operation, OperationDraft, Presence, ServerMessage,
    Session, now_millis,
};
use crate::session::{
    ApplyOutcome, AckOutcome, DEFAULT_ACK_TIMEOUT, PendingError, PendingSlot, SessionState,
    SubmitError,
};
use crate::sync::{SyncCoordinator, SyncOutcome};

/// Default ping cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Who the local user is.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl ClientProfile {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// How long a submitted operation may wait for its ack.
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Events emitted by the engine for the embedding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connected { resumed: bool },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted; `connect()` must be called again.
    ConnectionFailed { reason: String },
    Closed,
    SessionJoined { session: Session },
    UserJoined { presence: Presence },
    UserLeft { user_id: String },
    /// A remote operation was applied to the local log.
    RemoteOperation { operation: Operation },
    /// The local in-flight operation was confirmed at its version.
    OperationConfirmed { operation: Operation },
    OperationFailed { operation_id: Uuid, error: PendingError },
    CursorMoved { user_id: String, cursor: CursorPosition },
    ActivityUpdated {
        user_id: String,
        action: String,
        element_id: Option<String>,
    },
    SyncCompleted { outcome: SyncOutcome },
    CommentAdded { comment: Comment },
    CommentResolved { comment_id: Uuid },
    ServerError { message: String },
}

/// Everything the dispatch task and the API mutate, under one lock so
/// the log, roster and comments never observe each other mid-update.
struct EngineState {
    session: SessionState,
    sync: SyncCoordinator,
    presence: PresenceTracker,
    comments: CommentStore,
}

/// The collaboration client.
pub struct CollabClient {
    document_id: String,
    profile: ClientProfile,
    connection: Arc<ConnectionManager>,
    state: Arc<Mutex<EngineState>>,
    conn_events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl CollabClient {
    pub fn new(
        config: ClientConfig,
        document_id: impl Into<String>,
        profile: ClientProfile,
    ) -> Self {
        let document_id = document_id.into();
        let url = endpoint_url(&config.server_url, &document_id, &profile);
        let (connection, conn_events) =
            ConnectionManager::new(url, config.reconnect.clone(), config.heartbeat_interval);
        let (event_tx, event_rx) = mpsc::channel(256);

        let state = EngineState {
            session: SessionState::new(&document_id, &profile.user_id)
                .with_ack_timeout(config.ack_timeout),
            sync: SyncCoordinator::new(),
            presence: PresenceTracker::new(&profile.user_id),
            comments: CommentStore::new(),
        };

        Self {
            document_id,
            profile,
            connection: Arc::new(connection),
            state: Arc::new(Mutex::new(state)),
            conn_events: Mutex::new(Some(conn_events)),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server. The first call spawns the dispatch task;
    /// later calls restart a failed or closed connection.
    pub async fn connect(&self) {
        if let Some(conn_events) = self.conn_events.lock().await.take() {
            tokio::spawn(run_dispatch(
                self.connection.clone(),
                self.state.clone(),
                self.event_tx.clone(),
                conn_events,
            ));
        }
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect("client requested disconnect").await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Submit a local edit.
    ///
    /// Fails while disconnected or while another operation is still
    /// awaiting its acknowledgment.
    pub async fn submit(&self, draft: OperationDraft) -> Result<Operation, SubmitError> {
        if self.connection.status().await != ConnectionStatus::Connected {
            return Err(SubmitError::NotConnected);
        }

        let mut engine = self.state.lock().await;
        let (operation, frame) = engine.session.submit(draft)?;
        if !send_frame(&self.connection, &frame) {
            // The connection dropped between the status check and the
            // send; unwind the optimistic staging.
            engine.session.reject_pending("connection lost");
            engine.session.clear_failed();
            return Err(SubmitError::NotConnected);
        }
        Ok(operation)
    }

    /// Resubmit the failed operation, if any.
    pub async fn retry_failed(&self) -> Option<Operation> {
        let mut engine = self.state.lock().await;
        let (operation, frame) = engine.session.retry_failed()?;
        send_frame(&self.connection, &frame);
        Some(operation)
    }

    /// Discard the failed operation, if any.
    pub async fn clear_failed(&self) -> Option<Operation> {
        self.state.lock().await.session.clear_failed()
    }

    /// Manually request a catch-up sync from the current watermark.
    pub async fn request_sync(&self) -> bool {
        let frame = {
            let mut engine = self.state.lock().await;
            let engine = &mut *engine;
            engine.sync.request(&engine.session)
        };
        match frame {
            Some(frame) => send_frame(&self.connection, &frame),
            None => false,
        }
    }

    // ── Presence ───────────────────────────────────────────────────

    /// Report local cursor motion. Rapid calls are coalesced; while
    /// disconnected the frame is silently dropped.
    pub async fn update_cursor(&self, cursor: CursorPosition) {
        let frame = {
            let mut engine = self.state.lock().await;
            engine.presence.update_local_cursor(cursor, now_millis())
        };
        if let Some(frame) = frame {
            send_frame(&self.connection, &frame);
        }
    }

    /// Announce what the local user is doing ("editing Revenue chart").
    pub async fn update_activity(&self, action: impl Into<String>, element_id: Option<String>) {
        let frame = ClientMessage::ActivityUpdate {
            action: action.into(),
            element_id,
        };
        send_frame(&self.connection, &frame);
    }

    // ── Comments ───────────────────────────────────────────────────

    /// Add a comment optimistically and announce it.
    pub async fn add_comment(
        &self,
        element_id: impl Into<String>,
        text: impl Into<String>,
        position: Option<CursorPosition>,
    ) -> Comment {
        let (comment, frame) = self.state.lock().await.comments.add(
            element_id,
            text,
            position,
            &self.profile.user_id,
            &self.profile.username,
        );
        send_frame(&self.connection, &frame);
        comment
    }

    /// Reply inside an existing thread.
    pub async fn reply_to_comment(
        &self,
        parent_id: Uuid,
        text: impl Into<String>,
    ) -> Option<Comment> {
        let (comment, frame) = self.state.lock().await.comments.reply(
            parent_id,
            text,
            &self.profile.user_id,
            &self.profile.username,
        )?;
        send_frame(&self.connection, &frame);
        Some(comment)
    }

    /// Mark a thread resolved. Returns false for unknown or
    /// already-resolved comments.
    pub async fn resolve_comment(&self, comment_id: Uuid) -> bool {
        let frame = self.state.lock().await.comments.resolve(comment_id);
        match frame {
            Some(frame) => {
                send_frame(&self.connection, &frame);
                true
            }
            None => false,
        }
    }

    // ── Read access ────────────────────────────────────────────────

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    pub async fn session(&self) -> Session {
        self.state.lock().await.session.session().clone()
    }

    pub async fn watermark(&self) -> u64 {
        self.state.lock().await.session.watermark()
    }

    pub async fn pending(&self) -> PendingSlot {
        self.state.lock().await.session.pending().clone()
    }

    pub async fn active_presences(&self) -> Vec<Presence> {
        self.state
            .lock()
            .await
            .presence
            .active_presences()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn comment_threads(&self) -> Vec<Comment> {
        self.state.lock().await.comments.threads().to_vec()
    }

    /// Version history projected from the local log, newest first.
    pub async fn history(&self) -> Vec<VersionGroup> {
        history::group_by_version(self.state.lock().await.session.log())
    }
}

fn endpoint_url(server_url: &str, document_id: &str, profile: &ClientProfile) -> String {
    let base = server_url.trim_end_matches('/');
    let mut url = format!(
        "{base}/ws/{}/{}?username={}",
        urlencoding::encode(document_id),
        urlencoding::encode(&profile.user_id),
        urlencoding::encode(&profile.username)
    );
    if let Some(avatar) = &profile.avatar_url {
        url.push_str("&avatar_url=");
        url.push_str(&urlencoding::encode(avatar));
    }
    url
}

fn send_frame(connection: &ConnectionManager, frame: &ClientMessage) -> bool {
    match frame.encode() {
        Ok(encoded) => connection.send(encoded),
        Err(e) => {
            log::error!("Failed to encode outbound frame: {e}");
            false
        }
    }
}

/// Background task: consumes connection events and drives the replica.
/// The ticker flushes throttled cursor frames and expires unanswered
/// operation acks.
async fn run_dispatch(
    connection: Arc<ConnectionManager>,
    state: Arc<Mutex<EngineState>>,
    event_tx: mpsc::Sender<EngineEvent>,
    mut conn_events: mpsc::Receiver<ConnectionEvent>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(33));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = conn_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::Opened { resumed } => {
                        let _ = event_tx.send(EngineEvent::Connected { resumed }).await;
                    }
                    ConnectionEvent::Message(msg) => {
                        handle_server_message(&connection, &state, &event_tx, msg).await;
                    }
                    ConnectionEvent::Lost { reason } => {
                        // A sync_request in flight died with the socket;
                        // forget it so the post-reconnect catch-up can
                        // request again.
                        state.lock().await.sync.reset();
                        let _ = event_tx.send(EngineEvent::Disconnected { reason }).await;
                    }
                    ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                        let _ = event_tx
                            .send(EngineEvent::Reconnecting { attempt, delay })
                            .await;
                    }
                    ConnectionEvent::Failed { reason } => {
                        let _ = event_tx.send(EngineEvent::ConnectionFailed { reason }).await;
                    }
                    ConnectionEvent::Closed => {
                        let _ = event_tx.send(EngineEvent::Closed).await;
                    }
                }
            }

            _ = ticker.tick() => {
                let (cursor_frame, expired) = {
                    let mut engine = state.lock().await;
                    (
                        engine.presence.flush_cursor(now_millis()),
                        engine.session.expire_pending(now_millis()),
                    )
                };
                if let Some(frame) = cursor_frame {
                    send_frame(&connection, &frame);
                }
                if let Some(operation_id) = expired {
                    let _ = event_tx
                        .send(EngineEvent::OperationFailed {
                            operation_id,
                            error: PendingError::AckTimeout,
                        })
                        .await;
                }
            }
        }
    }
}

async fn handle_server_message(
    connection: &ConnectionManager,
    state: &Mutex<EngineState>,
    event_tx: &mpsc::Sender<EngineEvent>,
    msg: ServerMessage,
) {
    let mut events: Vec<EngineEvent> = Vec::new();
    let mut outbound: Option<ClientMessage> = None;

    {
        let mut engine = state.lock().await;
        let engine = &mut *engine;
        match msg {
            ServerMessage::SessionJoined { session, presence } => {
                let server_version = session.version;
                engine.presence.replace_all(presence);
                engine.session.adopt_session(session.clone());
                // A watermark behind the server means we joined (or
                // rejoined) mid-stream; catch up before editing.
                if server_version > engine.session.watermark() {
                    outbound = engine.sync.request(&engine.session);
                }
                events.push(EngineEvent::SessionJoined { session });
            }

            ServerMessage::UserJoined { user_id, presence } => {
                engine.session.participant_joined(&user_id);
                engine.presence.upsert(presence.clone());
                events.push(EngineEvent::UserJoined { presence });
            }

            ServerMessage::UserLeft {
                user_id,
                remaining_participants,
            } => {
                engine.presence.remove(&user_id);
                engine.session.participants_replaced(remaining_participants);
                events.push(EngineEvent::UserLeft { user_id });
            }

            ServerMessage::OperationApplied { operation, .. } => {
                match engine.session.apply_remote(operation.clone()) {
                    ApplyOutcome::Applied => {
                        events.push(EngineEvent::RemoteOperation { operation });
                    }
                    ApplyOutcome::Duplicate => {
                        log::debug!("Dropped duplicate operation v{}", operation.version);
                    }
                    ApplyOutcome::GapDetected { have, incoming } => {
                        log::info!("Version gap: have v{have}, incoming v{incoming}");
                        outbound = engine.sync.request(&engine.session);
                    }
                }
            }

            ServerMessage::OperationProcessed {
                operation_id,
                new_version,
            } => match engine.session.acknowledge(operation_id, new_version) {
                AckOutcome::Confirmed(operation) => {
                    events.push(EngineEvent::OperationConfirmed { operation });
                }
                AckOutcome::Regressed { .. } | AckOutcome::NoPending => {}
            },

            ServerMessage::CursorMoved { user_id, cursor } => {
                engine.presence.cursor_moved(&user_id, cursor.clone());
                events.push(EngineEvent::CursorMoved { user_id, cursor });
            }

            ServerMessage::ActivityUpdated {
                user_id,
                action,
                element_id,
            } => {
                engine.presence.activity_updated(&user_id, &action);
                events.push(EngineEvent::ActivityUpdated {
                    user_id,
                    action,
                    element_id,
                });
            }

            ServerMessage::SyncResponse {
                status,
                current_version,
                operations,
                dashboard_state,
            } => {
                let outcome = engine.sync.apply_response(
                    &mut engine.session,
                    status,
                    current_version,
                    operations,
                    dashboard_state,
                );
                if matches!(outcome, SyncOutcome::Incomplete { .. }) {
                    outbound = engine.sync.request(&engine.session);
                }
                events.push(EngineEvent::SyncCompleted { outcome });
            }

            ServerMessage::CommentAdded { comment, parent_id } => {
                engine.comments.apply_added(comment.clone(), parent_id);
                events.push(EngineEvent::CommentAdded { comment });
            }

            ServerMessage::CommentResolved { comment_id } => {
                if engine.comments.apply_resolved(comment_id) {
                    events.push(EngineEvent::CommentResolved { comment_id });
                }
            }

            // Heartbeat bookkeeping happens at the connection layer.
            ServerMessage::Pong => {}

            ServerMessage::Error { message } => {
                if let Some(operation_id) = engine.session.reject_pending(&message) {
                    events.push(EngineEvent::OperationFailed {
                        operation_id,
                        error: PendingError::Rejected(message.clone()),
                    });
                }
                events.push(EngineEvent::ServerError { message });
            }
        }
    }

    if let Some(frame) = outbound {
        send_frame(connection, &frame);
    }
    for event in events {
        let _ = event_tx.send(event).await;
    }
}
