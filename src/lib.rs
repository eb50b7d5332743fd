//! # dashsync — real-time dashboard collaboration engine
//!
//! Keeps any number of dashboard editors converged on one document
//! through a central sequencer: every edit becomes a versioned
//! operation, the server assigns versions in receipt order, and
//! clients apply the resulting log strictly ascending. Presence
//! (cursors, activity) and threaded comments ride the same WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄──────────────────► │ CollabServer │
//! │  (per user)  │   JSON {type,data}   │ (sequencer)  │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ SessionState │                      │ SequencedLog │
//! │ (replica)    │                      │ (authority)  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │   (fan-out)   │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and the shared data model
//! - [`connection`] — socket lifecycle, heartbeat, reconnect backoff
//! - [`session`] — versioned operation log and the in-flight slot
//! - [`sync`] — catch-up replay and snapshot fallback
//! - [`presence`] — participant roster, cursors, activity
//! - [`comments`] — append-only threaded comments
//! - [`history`] — version history projection over the log
//! - [`broadcast`] — room fan-out with backpressure
//! - [`server`] — reference sequencer
//! - [`client`] — the engine a dashboard embeds

pub mod protocol;
pub mod connection;
pub mod session;
pub mod sync;
pub mod presence;
pub mod comments;
pub mod history;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, Comment, CursorColor, CursorPosition, Operation, OperationDraft,
    OperationType, Presence, PresenceStatus, ProtocolError, ServerMessage, Session, SyncStatus,
};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, Heartbeat,
    ReconnectPolicy,
};
pub use session::{
    AckOutcome, ApplyOutcome, PendingError, PendingSlot, SessionState, SubmitError,
};
pub use sync::{SyncCoordinator, SyncOutcome};
pub use presence::{CURSOR_SEND_INTERVAL, PresenceTracker, screen_position};
pub use comments::CommentStore;
pub use history::{VersionGroup, filter_by_type, group_by_version, operations_up_to, search};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use server::{CollabServer, DocumentRoom, ServerConfig, ServerStats, SessionHub};
pub use client::{ClientConfig, ClientProfile, CollabClient, EngineEvent};
