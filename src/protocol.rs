//! Wire protocol and shared data model.
//!
//! Every frame is a JSON text message with the envelope:
//!
//! ```text
//! { "type": "<snake_case message name>", "data": { ... } }
//! ```
//!
//! [`ClientMessage`] and [`ServerMessage`] are adjacently tagged serde
//! enums, so the envelope falls out of the derive. Unknown `type`
//! values fail to decode; receivers log and drop such frames without
//! closing the connection.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Errors arising from encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
}

// ───────────────────────────────────────────────────────────────────
// Data model
// ───────────────────────────────────────────────────────────────────

/// Kind of document mutation carried by an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Move,
    Style,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
            OperationType::Style => "style",
        }
    }
}

/// An atomic, versioned mutation to the shared document.
///
/// Immutable once the server has assigned `version`. A version of 0
/// marks a locally optimistic operation that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub op_type: OperationType,
    /// Ordered list of keys addressing the mutated element.
    pub path: Vec<String>,
    pub payload: Value,
    pub origin_user: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Server-assigned position in the total order (0 = unsequenced).
    pub version: u64,
    /// Operations that must already be applied locally.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
}

/// The fields a caller supplies when submitting a local edit.
#[derive(Debug, Clone)]
pub struct OperationDraft {
    pub op_type: OperationType,
    pub path: Vec<String>,
    pub payload: Value,
    pub dependencies: Vec<Uuid>,
}

impl OperationDraft {
    pub fn new(op_type: OperationType, path: Vec<String>, payload: Value) -> Self {
        Self {
            op_type,
            path,
            payload,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Server-tracked collaborative context for one shared document.
///
/// Clients hold a read-replica updated only through inbound protocol
/// events. `version` is monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub document_id: String,
    pub version: u64,
    pub participants: BTreeSet<String>,
    pub pending_op_count: usize,
}

impl Session {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            version: 0,
            participants: BTreeSet::new(),
            pending_op_count: 0,
        }
    }
}

/// Participant availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Editing,
    Offline,
}

impl PresenceStatus {
    /// Whether this participant should appear in live presence listings.
    pub fn is_live(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

/// Cursor position in percentage coordinates.
///
/// `x` and `y` are clamped to `[0, 100]`; pixel positions are always
/// recomputed from these percentages and the current container size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub element_ref: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            element_ref: None,
        }
        .clamped()
    }

    pub fn with_element(mut self, element_ref: impl Into<String>) -> Self {
        self.element_ref = Some(element_ref.into());
        self
    }

    /// Clamp both coordinates into `[0, 100]`.
    pub fn clamped(mut self) -> Self {
        self.x = self.x.clamp(0.0, 100.0);
        self.y = self.y.clamp(0.0, 100.0);
        self
    }
}

/// RGBA color assigned to a participant's cursor and highlights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Derive a stable, vivid color from a user id.
    ///
    /// The hue comes from a hash of the id; saturation and lightness
    /// are fixed high so cursors stay readable on light backgrounds.
    pub fn from_user_id(user_id: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let hue = (hasher.finish() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Ephemeral per-participant state, overwritten wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    pub status: PresenceStatus,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub current_action: Option<String>,
    pub color: CursorColor,
}

impl Presence {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = CursorColor::from_user_id(&user_id);
        Self {
            user_id,
            username: username.into(),
            avatar_ref: None,
            status: PresenceStatus::Online,
            cursor: None,
            current_action: None,
            color,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// A threaded annotation anchored to a dashboard element.
///
/// Comments live outside the operation version stream and may outlive
/// the element they annotate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    /// Element id, or `"general"` for unanchored comments.
    pub element_id: String,
    pub text: String,
    #[serde(default)]
    pub position: Option<CursorPosition>,
    /// Authoring user id.
    pub author: String,
    pub author_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub resolved: bool,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

/// Outcome field of a `sync_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    UpToDate,
    SyncRequired,
}

// ───────────────────────────────────────────────────────────────────
// Envelope enums
// ───────────────────────────────────────────────────────────────────

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Operation {
        operation_id: Uuid,
        operation_type: OperationType,
        path: Vec<String>,
        operation_data: Value,
        /// The client's version at submission time.
        version: u64,
        #[serde(default)]
        dependencies: Vec<Uuid>,
    },
    CursorMove {
        x: f32,
        y: f32,
        #[serde(default)]
        element_id: Option<String>,
        #[serde(default)]
        element_type: Option<String>,
    },
    ActivityUpdate {
        action: String,
        #[serde(default)]
        element_id: Option<String>,
    },
    SyncRequest {
        from_version: u64,
    },
    AddComment {
        comment_id: Uuid,
        element_id: String,
        text: String,
        #[serde(default)]
        position: Option<CursorPosition>,
        /// Set when this comment is a reply to an existing thread.
        #[serde(default)]
        parent_id: Option<Uuid>,
        user_id: String,
        username: String,
    },
    ResolveComment {
        comment_id: Uuid,
    },
}

/// Frames the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionJoined {
        session: Session,
        presence: Vec<Presence>,
    },
    UserJoined {
        user_id: String,
        presence: Presence,
    },
    UserLeft {
        user_id: String,
        remaining_participants: Vec<String>,
    },
    OperationApplied {
        operation: Operation,
        version: u64,
    },
    OperationProcessed {
        operation_id: Uuid,
        new_version: u64,
    },
    CursorMoved {
        user_id: String,
        cursor: CursorPosition,
    },
    ActivityUpdated {
        user_id: String,
        action: String,
        #[serde(default)]
        element_id: Option<String>,
    },
    SyncResponse {
        status: SyncStatus,
        current_version: u64,
        #[serde(default)]
        operations: Vec<Operation>,
        #[serde(default)]
        dashboard_state: Option<Value>,
    },
    CommentAdded {
        comment: Comment,
        /// Present when the comment is a reply inside an existing thread.
        #[serde(default)]
        parent_id: Option<Uuid>,
    },
    CommentResolved {
        comment_id: Uuid,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ClientMessage {
    /// Serialize to the JSON wire envelope.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize from the JSON wire envelope.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }
}
