//! Connection lifecycle: connect, heartbeat, reconnect with backoff.
//!
//! The transport plumbing (tokio + tokio-tungstenite) is driven by two
//! small policy types that hold all the timing rules and are testable
//! without a socket:
//!
//! - [`ReconnectPolicy`] — exponential backoff, bounded attempts
//! - [`Heartbeat`] — ping cadence and the pong deadline
//!
//! The state machine is
//! `Disconnected → Connecting → Connected → {Closing | Reconnecting} → …`,
//! ending in [`ConnectionStatus::Failed`] once the attempt budget is
//! exhausted. A failed connection only recovers via a manual
//! [`ConnectionManager::connect`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ServerMessage};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Where the connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    /// Reconnect attempts exhausted; manual `connect()` required.
    Failed,
}

/// Snapshot of connection health, readable at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// Exponential backoff schedule for automatic reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based), or `None`
    /// once the attempt budget is spent.
    ///
    /// Attempt n waits `base * 2^n`: 1s, 2s, 4s, 8s, 16s with defaults.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.base_delay * 2u32.pow(attempt))
    }
}

/// Ping cadence tracking with an explicit pong deadline.
///
/// A pong must arrive before the *next* ping is due; otherwise the
/// link is considered dead and the reconnect path is taken.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            awaiting_pong: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record that a ping was sent; a pong is now owed.
    pub fn record_ping(&mut self) {
        self.awaiting_pong = true;
    }

    pub fn record_pong(&mut self) {
        self.awaiting_pong = false;
    }

    /// True when the previous ping was never answered.
    pub fn pong_overdue(&self) -> bool {
        self.awaiting_pong
    }
}

/// Events surfaced to the engine by the connection supervisor.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket open and handshake complete. `resumed` is true when this
    /// open followed an automatic reconnect.
    Opened { resumed: bool },
    /// A decoded inbound frame.
    Message(ServerMessage),
    /// Abnormal close; automatic reconnection will follow.
    Lost { reason: String },
    /// A reconnect attempt has been scheduled.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// All reconnect attempts failed; manual `connect()` required.
    Failed { reason: String },
    /// Clean, caller-requested close.
    Closed,
}

enum PumpExit {
    Clean,
    Abnormal(String),
}

/// Resolve once a shutdown has been requested (or the manager is gone).
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the WebSocket and its lifecycle.
///
/// `send` is non-blocking and never errors on disconnection: it
/// returns `false` and the caller decides whether to drop or surface
/// the failure.
pub struct ConnectionManager {
    url: String,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ConnectionState>>,
    out_tx: mpsc::Sender<String>,
    out_rx: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    resume: Arc<Notify>,
    supervisor_running: Arc<AtomicBool>,
}

impl ConnectionManager {
    /// Create a manager for `url` and return it together with the
    /// event stream the engine consumes.
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        heartbeat_interval: Duration,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Self {
            url: url.into(),
            policy,
            heartbeat_interval,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            out_tx,
            out_rx: Arc::new(Mutex::new(Some(out_rx))),
            event_tx,
            shutdown_tx,
            resume: Arc::new(Notify::new()),
            supervisor_running: Arc::new(AtomicBool::new(false)),
        };
        (manager, event_rx)
    }

    /// Current connection state snapshot.
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// Queue a frame for transmission.
    ///
    /// Returns `false` when the connection is not currently up or the
    /// outgoing buffer is full; the frame is dropped in that case.
    pub fn send(&self, frame: String) -> bool {
        if !self.supervisor_running.load(Ordering::Acquire) {
            return false;
        }
        if let Ok(state) = self.state.try_read() {
            if state.status != ConnectionStatus::Connected {
                return false;
            }
        } else {
            return false;
        }
        self.out_tx.try_send(frame).is_ok()
    }

    /// Start (or resume after failure/manual close) the connection.
    ///
    /// Spawns the supervisor task on first use; later calls wake a
    /// supervisor parked in the `Failed` or `Disconnected` state.
    pub async fn connect(&self) {
        let _ = self.shutdown_tx.send(false);

        if self.supervisor_running.swap(true, Ordering::AcqRel) {
            self.resume.notify_one();
            return;
        }

        let rx = self.out_rx.lock().await.take();
        let Some(out_rx) = rx else {
            // Supervisor already consumed the receiver.
            self.resume.notify_one();
            return;
        };

        let task = Supervisor {
            url: self.url.clone(),
            policy: self.policy.clone(),
            heartbeat_interval: self.heartbeat_interval,
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            resume: self.resume.clone(),
        };
        tokio::spawn(task.run(out_rx));
    }

    /// Request a clean close. The supervisor parks until the next
    /// `connect()`.
    pub async fn disconnect(&self, reason: &str) {
        log::info!("Disconnecting: {reason}");
        {
            let mut state = self.state.write().await;
            if state.status == ConnectionStatus::Connected {
                state.status = ConnectionStatus::Closing;
            }
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// The background task that owns the socket across reconnects.
struct Supervisor {
    url: String,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shutdown_rx: watch::Receiver<bool>,
    resume: Arc<Notify>,
}

impl Supervisor {
    async fn run(mut self, mut out_rx: mpsc::Receiver<String>) {
        let mut attempt: u32 = 0;
        let mut resumed = false;
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            {
                let mut state = self.state.write().await;
                state.status = if attempt == 0 && !resumed {
                    ConnectionStatus::Connecting
                } else {
                    ConnectionStatus::Reconnecting
                };
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws, _)) => {
                    // On open: reset the reconnect counter.
                    attempt = 0;
                    {
                        let mut state = self.state.write().await;
                        state.status = ConnectionStatus::Connected;
                        state.reconnect_attempts = 0;
                        state.last_error = None;
                    }
                    log::info!("Connected to {}", self.url);
                    let _ = self
                        .event_tx
                        .send(ConnectionEvent::Opened { resumed })
                        .await;
                    resumed = true;

                    match self.pump(ws, &mut out_rx).await {
                        PumpExit::Clean => {
                            if self.park_disconnected().await {
                                return;
                            }
                            attempt = 0;
                            resumed = false;
                            continue;
                        }
                        PumpExit::Abnormal(reason) => {
                            log::warn!("Connection lost: {reason}");
                            self.state.write().await.last_error = Some(reason.clone());
                            let _ = self.event_tx.send(ConnectionEvent::Lost { reason }).await;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", self.url);
                    self.state.write().await.last_error = Some(e.to_string());
                }
            }

            match self.policy.delay_for(attempt) {
                Some(delay) => {
                    log::info!(
                        "Scheduling reconnect attempt {} in {:?}",
                        attempt + 1,
                        delay
                    );
                    {
                        let mut state = self.state.write().await;
                        state.status = ConnectionStatus::Reconnecting;
                        state.reconnect_attempts = attempt + 1;
                    }
                    let _ = self
                        .event_tx
                        .send(ConnectionEvent::ReconnectScheduled { attempt, delay })
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_shutdown(&mut shutdown) => {
                            if self.park_disconnected().await {
                                return;
                            }
                            attempt = 0;
                            resumed = false;
                            continue;
                        }
                    }
                    attempt += 1;
                }
                None => {
                    let reason = self
                        .state
                        .read()
                        .await
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "connection lost".to_string());
                    log::error!(
                        "Giving up after {} reconnect attempts: {reason}",
                        self.policy.max_attempts
                    );
                    self.state.write().await.status = ConnectionStatus::Failed;
                    let _ = self.event_tx.send(ConnectionEvent::Failed { reason }).await;

                    // Park until a manual connect() wakes us.
                    self.resume.notified().await;
                    attempt = 0;
                    resumed = false;
                }
            }
        }
    }

    /// Mark the connection cleanly closed and park until the next
    /// `connect()`. Returns true if the event channel is gone and the
    /// supervisor should exit entirely.
    async fn park_disconnected(&mut self) -> bool {
        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Disconnected;
            state.reconnect_attempts = 0;
        }
        if self.event_tx.send(ConnectionEvent::Closed).await.is_err() {
            return true;
        }
        self.resume.notified().await;
        false
    }

    /// Drive one established socket until it closes.
    async fn pump(&mut self, ws: WsStream, out_rx: &mut mpsc::Receiver<String>) -> PumpExit {
        let (mut sink, mut stream) = ws.split();
        let mut shutdown = self.shutdown_rx.clone();
        let mut heartbeat = Heartbeat::new(self.heartbeat_interval);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                return PumpExit::Abnormal(format!("write failed: {e}"));
                            }
                        }
                        None => return PumpExit::Clean,
                    }
                }

                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(raw))) => {
                            match ServerMessage::decode(raw.as_str()) {
                                Ok(ServerMessage::Pong) => {
                                    heartbeat.record_pong();
                                    let _ = self.event_tx.send(
                                        ConnectionEvent::Message(ServerMessage::Pong)).await;
                                }
                                Ok(msg) => {
                                    let _ = self.event_tx.send(
                                        ConnectionEvent::Message(msg)).await;
                                }
                                Err(e) => {
                                    // Protocol errors never close the connection.
                                    log::warn!("Dropping undecodable frame: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return PumpExit::Abnormal("write failed".to_string());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            if *shutdown.borrow() {
                                return PumpExit::Clean;
                            }
                            return PumpExit::Abnormal("closed by peer".to_string());
                        }
                        Some(Err(e)) => {
                            return PumpExit::Abnormal(format!("transport error: {e}"));
                        }
                        _ => {}
                    }
                }

                _ = ticker.tick() => {
                    if heartbeat.pong_overdue() {
                        return PumpExit::Abnormal("pong deadline missed".to_string());
                    }
                    match ClientMessage::Ping.encode() {
                        Ok(frame) => {
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                return PumpExit::Abnormal("write failed".to_string());
                            }
                            heartbeat.record_ping();
                        }
                        Err(e) => log::error!("Failed to encode ping: {e}"),
                    }
                }

                _ = wait_shutdown(&mut shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::Clean;
                }
            }
        }
    }
}
