//! Versioned operation log and local session replica.
//!
//! The authoritative log is owned by the server; this is the client's
//! read-replica, mutated only through inbound protocol events. Remote
//! operations apply strictly in ascending version order; anything out
//! of sequence is reported as a gap for the sync coordinator.
//!
//! A client may have at most one unconfirmed operation in flight. The
//! slot is the tagged state [`PendingSlot`] so a second submission
//! while one is pending is rejected at the type level rather than
//! racing a boolean flag.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::protocol::{ClientMessage, Operation, OperationDraft, Session, now_millis};

/// Default time a submitted operation may wait for its ack.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of feeding one remote operation into the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Appended and version advanced.
    Applied,
    /// Version already applied; redelivery is a no-op.
    Duplicate,
    /// Out-of-sequence version or unsatisfied dependency; the caller
    /// must request a sync from `have`.
    GapDetected { have: u64, incoming: u64 },
}

/// Why an in-flight operation ended up in the failed slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    #[error("acknowledgment timed out")]
    AckTimeout,
    #[error("rejected by server: {0}")]
    Rejected(String),
}

/// The single in-flight-operation slot.
#[derive(Debug, Clone)]
pub enum PendingSlot {
    Idle,
    Pending {
        op: Operation,
        /// Submission time, milliseconds since the Unix epoch.
        since: u64,
    },
    Failed {
        op: Operation,
        error: PendingError,
    },
}

impl PendingSlot {
    pub fn is_idle(&self) -> bool {
        matches!(self, PendingSlot::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PendingSlot::Pending { .. })
    }
}

/// Errors surfaced synchronously when submitting an operation.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("an operation is already awaiting acknowledgment")]
    OperationPending,
    #[error("not connected")]
    NotConnected,
}

/// Outcome of an `operation_processed` acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The optimistic operation is confirmed at this version.
    Confirmed(Operation),
    /// The ack reported a version at or below the local watermark;
    /// the slot is cleared but the log is left untouched.
    Regressed { local: u64, acked: u64 },
    /// No operation was awaiting acknowledgment.
    NoPending,
}

/// Client-side session replica: ordered log, watermark, pending slot.
pub struct SessionState {
    session: Session,
    local_user: String,
    log: Vec<Operation>,
    applied_ids: HashSet<Uuid>,
    pending: PendingSlot,
    ack_timeout_ms: u64,
}

impl SessionState {
    pub fn new(document_id: impl Into<String>, local_user: impl Into<String>) -> Self {
        Self {
            session: Session::new(document_id),
            local_user: local_user.into(),
            log: Vec::new(),
            applied_ids: HashSet::new(),
            pending: PendingSlot::Idle,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Last confirmed-applied version; the resume point for catch-up.
    pub fn watermark(&self) -> u64 {
        self.session.version
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn pending(&self) -> &PendingSlot {
        &self.pending
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Adopt the server's session snapshot from `session_joined`.
    ///
    /// Participants and metadata are taken wholesale; the version stays
    /// at the local watermark so a catch-up sync still fires when the
    /// server is ahead.
    pub fn adopt_session(&mut self, remote: Session) {
        if remote.version > self.session.version {
            log::debug!(
                "Server session at v{}, local log at v{}; sync required",
                remote.version,
                self.session.version
            );
        }
        self.session.document_id = remote.document_id;
        self.session.participants = remote.participants;
        self.session.pending_op_count = remote.pending_op_count;
    }

    pub fn participant_joined(&mut self, user_id: &str) {
        self.session.participants.insert(user_id.to_string());
    }

    pub fn participants_replaced(&mut self, remaining: Vec<String>) {
        self.session.participants = remaining.into_iter().collect();
    }

    /// Apply one remote operation, enforcing strict ascending order.
    pub fn apply_remote(&mut self, op: Operation) -> ApplyOutcome {
        let have = self.session.version;

        if op.version <= have || self.applied_ids.contains(&op.id) {
            return ApplyOutcome::Duplicate;
        }
        if op.version != have + 1 {
            return ApplyOutcome::GapDetected {
                have,
                incoming: op.version,
            };
        }
        if !self.dependencies_satisfied(&op) {
            return ApplyOutcome::GapDetected {
                have,
                incoming: op.version,
            };
        }

        self.applied_ids.insert(op.id);
        self.session.version = op.version;
        self.log.push(op);
        ApplyOutcome::Applied
    }

    fn dependencies_satisfied(&self, op: &Operation) -> bool {
        op.dependencies
            .iter()
            .all(|dep| self.applied_ids.contains(dep))
    }

    /// Create and stage a locally optimistic operation.
    ///
    /// Returns the staged operation together with the wire message to
    /// transmit. Fails while another operation is pending; a leftover
    /// failed operation is discarded and replaced.
    pub fn submit(
        &mut self,
        draft: OperationDraft,
    ) -> Result<(Operation, ClientMessage), SubmitError> {
        match &self.pending {
            PendingSlot::Pending { .. } => return Err(SubmitError::OperationPending),
            PendingSlot::Failed { op, .. } => {
                log::info!("Discarding unresolved failed operation {}", op.id);
            }
            PendingSlot::Idle => {}
        }

        let op = Operation {
            id: Uuid::new_v4(),
            op_type: draft.op_type,
            path: draft.path,
            payload: draft.payload,
            origin_user: self.local_user.clone(),
            timestamp: now_millis(),
            version: 0,
            dependencies: draft.dependencies,
        };

        let message = ClientMessage::Operation {
            operation_id: op.id,
            operation_type: op.op_type,
            path: op.path.clone(),
            operation_data: op.payload.clone(),
            version: self.session.version,
            dependencies: op.dependencies.clone(),
        };

        self.pending = PendingSlot::Pending {
            op: op.clone(),
            since: now_millis(),
        };
        self.session.pending_op_count = 1;

        Ok((op, message))
    }

    /// Handle `operation_processed { operation_id, new_version }`.
    ///
    /// An ack whose id does not match the in-flight operation is stale
    /// (its operation timed out or was abandoned); it is ignored and
    /// the current operation keeps waiting for its own ack.
    pub fn acknowledge(&mut self, operation_id: Uuid, new_version: u64) -> AckOutcome {
        match &self.pending {
            PendingSlot::Pending { op, .. } if op.id != operation_id => {
                log::warn!(
                    "Stale operation_processed for {operation_id} while {} is pending",
                    op.id
                );
                return AckOutcome::NoPending;
            }
            PendingSlot::Pending { .. } => {}
            _ => {
                log::warn!("operation_processed with no operation pending");
                return AckOutcome::NoPending;
            }
        }
        let PendingSlot::Pending { op, .. } = std::mem::replace(&mut self.pending, PendingSlot::Idle)
        else {
            unreachable!();
        };

        self.session.pending_op_count = 0;

        if new_version <= self.session.version {
            // The ack is consumed, but local state never moves backwards.
            log::warn!(
                "operation_processed reported v{new_version} at or below local v{}",
                self.session.version
            );
            return AckOutcome::Regressed {
                local: self.session.version,
                acked: new_version,
            };
        }

        let mut confirmed = op;
        confirmed.version = new_version;
        self.applied_ids.insert(confirmed.id);
        self.session.version = new_version;
        self.log.push(confirmed.clone());
        AckOutcome::Confirmed(confirmed)
    }

    /// Move a pending operation whose ack never arrived into the
    /// failed slot. Returns the operation id when the deadline passed.
    pub fn expire_pending(&mut self, now_ms: u64) -> Option<Uuid> {
        let PendingSlot::Pending { op, since } = &self.pending else {
            return None;
        };
        if now_ms.saturating_sub(*since) < self.ack_timeout_ms {
            return None;
        }

        let id = op.id;
        log::warn!("Operation {id} unacknowledged after {}ms", self.ack_timeout_ms);
        let PendingSlot::Pending { op, .. } = std::mem::replace(&mut self.pending, PendingSlot::Idle)
        else {
            unreachable!();
        };
        self.pending = PendingSlot::Failed {
            op,
            error: PendingError::AckTimeout,
        };
        self.session.pending_op_count = 0;
        Some(id)
    }

    /// Mark the in-flight operation rejected by the server.
    pub fn reject_pending(&mut self, message: &str) -> Option<Uuid> {
        let PendingSlot::Pending { op, .. } = std::mem::replace(&mut self.pending, PendingSlot::Idle)
        else {
            return None;
        };
        let id = op.id;
        self.pending = PendingSlot::Failed {
            op,
            error: PendingError::Rejected(message.to_string()),
        };
        self.session.pending_op_count = 0;
        Some(id)
    }

    /// Resubmit a failed operation.
    ///
    /// The operation keeps its id: if the original transmission did
    /// land and only the ack was lost, the sequencer's per-id dedup
    /// makes the retry exactly-once instead of double-applying it.
    pub fn retry_failed(&mut self) -> Option<(Operation, ClientMessage)> {
        let PendingSlot::Failed { mut op, .. } =
            std::mem::replace(&mut self.pending, PendingSlot::Idle)
        else {
            return None;
        };
        op.timestamp = now_millis();

        let message = ClientMessage::Operation {
            operation_id: op.id,
            operation_type: op.op_type,
            path: op.path.clone(),
            operation_data: op.payload.clone(),
            version: self.session.version,
            dependencies: op.dependencies.clone(),
        };
        self.pending = PendingSlot::Pending {
            op: op.clone(),
            since: now_millis(),
        };
        self.session.pending_op_count = 1;
        Some((op, message))
    }

    /// Drop a failed operation without retrying.
    pub fn clear_failed(&mut self) -> Option<Operation> {
        let PendingSlot::Failed { op, .. } = std::mem::replace(&mut self.pending, PendingSlot::Idle)
        else {
            return None;
        };
        Some(op)
    }

    /// Wholesale-replace local state from a snapshot at `version`.
    ///
    /// Used by the sync fallback path when replay is impossible. The
    /// log restarts empty at the snapshot version; the snapshot payload
    /// itself is opaque to the engine and handed to the consumer.
    pub fn reset_to_snapshot(&mut self, version: u64) {
        self.log.clear();
        self.applied_ids.clear();
        self.session.version = version;
    }
}
