//! Catch-up synchronization after a detected version gap.
//!
//! Whenever the log refuses an out-of-sequence operation, the
//! coordinator asks the server for everything past the local watermark
//! and replays the answer through the normal apply path, so catch-up
//! obeys the same ordering rules as live traffic. When replay is not
//! possible the server ships a full snapshot instead and local state
//! is replaced wholesale.

use serde_json::Value;

use crate::protocol::{ClientMessage, Operation, SyncStatus};
use crate::session::{ApplyOutcome, SessionState};

/// What a completed sync exchange did to local state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The server confirmed the local watermark is current.
    AlreadyCurrent,
    /// Missed operations were replayed in version order.
    Replayed { applied: usize, version: u64 },
    /// The log was discarded and replaced from a snapshot. The payload
    /// is the opaque dashboard state for the consumer to render.
    SnapshotRestored { version: u64, state: Value },
    /// The replay batch itself had a hole and no snapshot was offered;
    /// another sync round is required.
    Incomplete { have: u64 },
}

/// Drives the sync_request / sync_response exchange.
///
/// At most one sync is in flight at a time; a second gap detected while
/// waiting for a response does not produce a second request.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    in_flight: bool,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight
    }

    /// Build a catch-up request from the current watermark.
    ///
    /// Returns `None` when a sync is already in flight.
    pub fn request(&mut self, state: &SessionState) -> Option<ClientMessage> {
        if self.in_flight {
            log::debug!("Sync already in flight, not re-requesting");
            return None;
        }
        self.in_flight = true;
        let from_version = state.watermark();
        log::info!("Requesting sync from v{from_version}");
        Some(ClientMessage::SyncRequest { from_version })
    }

    /// Forget an in-flight request whose response can no longer
    /// arrive, e.g. because the connection dropped mid-exchange. The
    /// next gap or rejoin may then request again.
    pub fn reset(&mut self) {
        if self.in_flight {
            log::debug!("Abandoning in-flight sync request");
        }
        self.in_flight = false;
    }

    /// Apply a `sync_response` to local state.
    pub fn apply_response(
        &mut self,
        state: &mut SessionState,
        status: SyncStatus,
        current_version: u64,
        operations: Vec<Operation>,
        dashboard_state: Option<Value>,
    ) -> SyncOutcome {
        self.in_flight = false;

        if status == SyncStatus::UpToDate {
            if current_version != state.watermark() {
                log::warn!(
                    "Server reports up_to_date at v{current_version} but local is v{}",
                    state.watermark()
                );
            }
            return SyncOutcome::AlreadyCurrent;
        }

        if !operations.is_empty() {
            match Self::replay(state, operations) {
                Ok(applied) => {
                    log::info!(
                        "Replayed {applied} operation(s), now at v{}",
                        state.watermark()
                    );
                    return SyncOutcome::Replayed {
                        applied,
                        version: state.watermark(),
                    };
                }
                Err(have) => {
                    log::warn!("Replay batch had a hole past v{have}");
                    if dashboard_state.is_none() {
                        return SyncOutcome::Incomplete { have };
                    }
                }
            }
        }

        match dashboard_state {
            Some(snapshot) => {
                state.reset_to_snapshot(current_version);
                log::info!("Restored snapshot at v{current_version}");
                SyncOutcome::SnapshotRestored {
                    version: current_version,
                    state: snapshot,
                }
            }
            None => {
                // sync_required with neither ops nor snapshot: nothing
                // usable arrived, ask again from the same watermark.
                log::warn!("Empty sync_required response");
                SyncOutcome::Incomplete {
                    have: state.watermark(),
                }
            }
        }
    }

    /// Replay a batch in ascending version order through the normal
    /// apply path. Duplicates are skipped, so replaying a batch that
    /// overlaps already-applied versions converges to the same state.
    fn replay(state: &mut SessionState, mut operations: Vec<Operation>) -> Result<usize, u64> {
        operations.sort_by_key(|op| op.version);

        let mut applied = 0;
        for op in operations {
            match state.apply_remote(op) {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::Duplicate => {}
                ApplyOutcome::GapDetected { have, .. } => return Err(have),
            }
        }
        Ok(applied)
    }
}
