//! Live participant roster and cursor handling.
//!
//! Each user's presence record is replaced wholesale by the latest
//! update for that user; there is no per-field merging. Cursor
//! positions travel as `[0, 100]` percentages and only become pixels
//! through [`screen_position`], so every participant sees cursors at
//! the same relative spot regardless of viewport size.
//!
//! Outbound local cursor motion is coalesced: at most one cursor frame
//! per [`CURSOR_SEND_INTERVAL`], always carrying the newest position.

use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::{ClientMessage, CursorPosition, Presence, PresenceStatus};

/// Minimum spacing between outbound cursor frames, roughly 30Hz.
pub const CURSOR_SEND_INTERVAL: Duration = Duration::from_millis(33);

/// Project a percentage cursor onto a pixel viewport.
pub fn screen_position(cursor: &CursorPosition, width: f32, height: f32) -> (f32, f32) {
    (cursor.x / 100.0 * width, cursor.y / 100.0 * height)
}

/// Roster of remote participants plus the local cursor throttle.
pub struct PresenceTracker {
    local_user_id: String,
    participants: HashMap<String, Presence>,
    interval_ms: u64,
    last_cursor_sent: Option<u64>,
    /// Newest cursor withheld by the throttle, waiting for the next slot.
    deferred_cursor: Option<CursorPosition>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            participants: HashMap::new(),
            interval_ms: CURSOR_SEND_INTERVAL.as_millis() as u64,
            last_cursor_sent: None,
            deferred_cursor: None,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    // ── Inbound updates ────────────────────────────────────────────

    /// Replace the whole roster, e.g. from `session_joined`.
    pub fn replace_all(&mut self, roster: Vec<Presence>) {
        self.participants.clear();
        for presence in roster {
            if presence.user_id != self.local_user_id {
                self.participants.insert(presence.user_id.clone(), presence);
            }
        }
    }

    /// Insert or wholesale-overwrite one participant's record.
    pub fn upsert(&mut self, presence: Presence) {
        if presence.user_id == self.local_user_id {
            return;
        }
        self.participants.insert(presence.user_id.clone(), presence);
    }

    /// Remove a departed participant. Returns the removed record.
    pub fn remove(&mut self, user_id: &str) -> Option<Presence> {
        self.participants.remove(user_id)
    }

    /// Apply a remote cursor move. Unknown users are ignored; their
    /// join frame has not arrived yet and the next one will carry the
    /// full record anyway.
    pub fn cursor_moved(&mut self, user_id: &str, cursor: CursorPosition) {
        match self.participants.get_mut(user_id) {
            Some(presence) => presence.cursor = Some(cursor.clamped()),
            None => log::debug!("Cursor move for unknown user {user_id}"),
        }
    }

    /// Apply a remote activity change. An empty action clears it and
    /// drops the user back to plain online.
    pub fn activity_updated(&mut self, user_id: &str, action: &str) {
        let Some(presence) = self.participants.get_mut(user_id) else {
            log::debug!("Activity update for unknown user {user_id}");
            return;
        };
        if action.is_empty() {
            presence.current_action = None;
            if presence.status == PresenceStatus::Editing {
                presence.status = PresenceStatus::Online;
            }
        } else {
            presence.current_action = Some(action.to_string());
            presence.status = PresenceStatus::Editing;
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, user_id: &str) -> Option<&Presence> {
        self.participants.get(user_id)
    }

    /// Remote participants who are not offline, sorted by user id for
    /// stable rendering order.
    pub fn active_presences(&self) -> Vec<&Presence> {
        let mut live: Vec<&Presence> = self
            .participants
            .values()
            .filter(|p| p.status.is_live())
            .collect();
        live.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        live
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    // ── Outbound local cursor ──────────────────────────────────────

    /// Register local cursor motion.
    ///
    /// Returns the frame to send when the throttle window is open;
    /// otherwise the position is deferred and a later
    /// [`flush_cursor`](Self::flush_cursor) emits the newest one.
    pub fn update_local_cursor(
        &mut self,
        cursor: CursorPosition,
        now_ms: u64,
    ) -> Option<ClientMessage> {
        let cursor = cursor.clamped();
        if self.window_open(now_ms) {
            self.last_cursor_sent = Some(now_ms);
            self.deferred_cursor = None;
            Some(Self::cursor_frame(cursor))
        } else {
            self.deferred_cursor = Some(cursor);
            None
        }
    }

    /// Emit a deferred cursor position once the throttle window opens.
    pub fn flush_cursor(&mut self, now_ms: u64) -> Option<ClientMessage> {
        if self.deferred_cursor.is_none() || !self.window_open(now_ms) {
            return None;
        }
        self.last_cursor_sent = Some(now_ms);
        let cursor = self.deferred_cursor.take()?;
        Some(Self::cursor_frame(cursor))
    }

    fn window_open(&self, now_ms: u64) -> bool {
        match self.last_cursor_sent {
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
            None => true,
        }
    }

    fn cursor_frame(cursor: CursorPosition) -> ClientMessage {
        ClientMessage::CursorMove {
            x: cursor.x,
            y: cursor.y,
            element_id: cursor.element_ref,
            element_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(user_id: &str) -> Presence {
        Presence::new(user_id, user_id.to_uppercase())
    }

    #[test]
    fn test_upsert_overwrites_wholesale() {
        let mut tracker = PresenceTracker::new("me");
        let mut first = presence("bob");
        first.cursor = Some(CursorPosition::new(10.0, 20.0));
        first.current_action = Some("editing chart".into());
        tracker.upsert(first);

        // A fresh record with no cursor replaces everything.
        tracker.upsert(presence("bob"));
        let bob = tracker.get("bob").unwrap();
        assert!(bob.cursor.is_none());
        assert!(bob.current_action.is_none());
    }

    #[test]
    fn test_local_user_is_not_tracked() {
        let mut tracker = PresenceTracker::new("me");
        tracker.upsert(presence("me"));
        tracker.replace_all(vec![presence("me"), presence("bob")]);

        assert!(tracker.get("me").is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_active_presences_excludes_offline() {
        let mut tracker = PresenceTracker::new("me");
        tracker.upsert(presence("alice"));
        let mut gone = presence("bob");
        gone.status = PresenceStatus::Offline;
        tracker.upsert(gone);
        let mut away = presence("carol");
        away.status = PresenceStatus::Away;
        tracker.upsert(away);

        let live = tracker.active_presences();
        let ids: Vec<&str> = live.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "carol"]);
    }

    #[test]
    fn test_remote_cursor_is_clamped() {
        let mut tracker = PresenceTracker::new("me");
        tracker.upsert(presence("bob"));
        tracker.cursor_moved(
            "bob",
            CursorPosition {
                x: 150.0,
                y: -3.0,
                element_ref: None,
            },
        );

        let cursor = tracker.get("bob").unwrap().cursor.clone().unwrap();
        assert_eq!(cursor.x, 100.0);
        assert_eq!(cursor.y, 0.0);
    }

    #[test]
    fn test_cursor_move_for_unknown_user_is_ignored() {
        let mut tracker = PresenceTracker::new("me");
        tracker.cursor_moved("ghost", CursorPosition::new(1.0, 1.0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_activity_update_sets_and_clears_editing() {
        let mut tracker = PresenceTracker::new("me");
        tracker.upsert(presence("bob"));

        tracker.activity_updated("bob", "editing Revenue chart");
        let bob = tracker.get("bob").unwrap();
        assert_eq!(bob.status, PresenceStatus::Editing);
        assert_eq!(bob.current_action.as_deref(), Some("editing Revenue chart"));

        tracker.activity_updated("bob", "");
        let bob = tracker.get("bob").unwrap();
        assert_eq!(bob.status, PresenceStatus::Online);
        assert!(bob.current_action.is_none());
    }

    #[test]
    fn test_screen_position_scales_with_viewport() {
        let cursor = CursorPosition::new(50.0, 50.0);
        assert_eq!(screen_position(&cursor, 1920.0, 1080.0), (960.0, 540.0));
        assert_eq!(screen_position(&cursor, 800.0, 600.0), (400.0, 300.0));

        let corner = CursorPosition::new(100.0, 0.0);
        assert_eq!(screen_position(&corner, 1000.0, 500.0), (1000.0, 0.0));
    }

    #[test]
    fn test_cursor_throttle_coalesces_to_newest() {
        let mut tracker =
            PresenceTracker::new("me").with_interval(Duration::from_millis(33));

        // First move goes out immediately.
        let sent = tracker.update_local_cursor(CursorPosition::new(1.0, 1.0), 1000);
        assert!(sent.is_some());

        // Rapid moves inside the window are deferred.
        assert!(tracker
            .update_local_cursor(CursorPosition::new(2.0, 2.0), 1010)
            .is_none());
        assert!(tracker
            .update_local_cursor(CursorPosition::new(3.0, 3.0), 1020)
            .is_none());

        // Still inside the window: nothing flushes.
        assert!(tracker.flush_cursor(1030).is_none());

        // Window opens: only the newest deferred position is emitted.
        match tracker.flush_cursor(1040) {
            Some(ClientMessage::CursorMove { x, y, .. }) => {
                assert_eq!((x, y), (3.0, 3.0));
            }
            other => panic!("expected CursorMove, got {other:?}"),
        }

        // Nothing left to flush.
        assert!(tracker.flush_cursor(2000).is_none());
    }

    #[test]
    fn test_outbound_cursor_is_clamped() {
        let mut tracker = PresenceTracker::new("me");
        let frame = tracker.update_local_cursor(
            CursorPosition {
                x: 120.0,
                y: 50.0,
                element_ref: Some("chart-1".into()),
            },
            0,
        );
        match frame {
            Some(ClientMessage::CursorMove { x, element_id, .. }) => {
                assert_eq!(x, 100.0);
                assert_eq!(element_id.as_deref(), Some("chart-1"));
            }
            other => panic!("expected CursorMove, got {other:?}"),
        }
    }
}
