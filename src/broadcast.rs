//! Fan-out of pre-encoded frames to everyone in a document room.
//!
//! Each document gets one tokio broadcast channel; every connected
//! participant holds an independent receiver buffering up to
//! `capacity` frames. A frame is encoded once and shared as an `Arc`,
//! so fan-out never re-serializes. Frames carry their origin user so
//! receivers can drop their own echoes without decoding the payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};

use crate::protocol::{Presence, ProtocolError, ServerMessage};

/// One encoded frame travelling through a room channel.
#[derive(Debug)]
pub struct RoomFrame {
    /// User the frame originated from; `None` for frames every
    /// participant should receive, the origin included.
    pub origin: Option<String>,
    pub payload: String,
}

impl RoomFrame {
    pub fn from_user(origin: impl Into<String>, payload: String) -> Arc<Self> {
        Arc::new(Self {
            origin: Some(origin.into()),
            payload,
        })
    }

    pub fn to_everyone(payload: String) -> Arc<Self> {
        Arc::new(Self {
            origin: None,
            payload,
        })
    }
}

/// Snapshot of broadcast health for one room.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_participants: usize,
}

/// Frame counter kept in atomics so publishing never takes a lock.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
}

/// One document room's fan-out channel plus its participant roster.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    participants: Arc<RwLock<HashMap<String, Presence>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver frame buffer; a participant that
    /// falls further behind than this starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            participants: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Register a participant and hand back their frame receiver.
    pub async fn join(&self, presence: Presence) -> broadcast::Receiver<Arc<RoomFrame>> {
        let mut participants = self.participants.write().await;
        participants.insert(presence.user_id.clone(), presence);
        self.sender.subscribe()
    }

    pub async fn leave(&self, user_id: &str) -> Option<Presence> {
        let mut participants = self.participants.write().await;
        participants.remove(user_id)
    }

    /// Encode once and publish to every subscriber. Receivers skip
    /// frames whose origin matches their own user id.
    pub fn publish(
        &self,
        msg: &ServerMessage,
        origin: Option<&str>,
    ) -> Result<usize, ProtocolError> {
        let payload = msg.encode()?;
        let frame = match origin {
            Some(user) => RoomFrame::from_user(user, payload),
            None => RoomFrame::to_everyone(payload),
        };
        Ok(self.publish_raw(frame))
    }

    /// Publish an already-encoded frame. Lock-free.
    pub fn publish_raw(&self, frame: Arc<RoomFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Current roster, for `session_joined` payloads.
    pub async fn roster(&self) -> Vec<Presence> {
        self.participants.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.participants.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let participants = self.participants.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            active_participants: participants.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(user_id: &str) -> Presence {
        Presence::new(user_id, user_id.to_uppercase())
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let group = BroadcastGroup::new(16);

        let _rx = group.join(presence("alice")).await;
        assert_eq!(group.participant_count().await, 1);
        assert!(group.contains("alice").await);

        group.leave("alice").await;
        assert_eq!(group.participant_count().await, 0);
        assert!(!group.contains("alice").await);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_receivers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.join(presence("alice")).await;
        let mut rx2 = group.join(presence("bob")).await;
        let mut rx3 = group.join(presence("carol")).await;

        let count = group.publish(&ServerMessage::Pong, Some("alice")).unwrap();
        // All three receive it; skipping the origin is the receiver's job.
        assert_eq!(count, 3);

        let frame = rx1.recv().await.unwrap();
        assert_eq!(frame.origin.as_deref(), Some("alice"));
        assert_eq!(rx2.recv().await.unwrap().payload, frame.payload);
        assert_eq!(rx3.recv().await.unwrap().payload, frame.payload);
    }

    #[tokio::test]
    async fn test_publish_raw_shares_one_allocation() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.join(presence("alice")).await;

        let frame = RoomFrame::to_everyone(String::from(r#"{"type":"pong"}"#));
        let count = group.publish_raw(frame.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &frame));
        assert!(received.origin.is_none());
    }

    #[tokio::test]
    async fn test_stats_count_frames_and_participants() {
        let group = BroadcastGroup::new(16);
        let _rx = group.join(presence("alice")).await;

        group.publish(&ServerMessage::Pong, None).unwrap();
        group.publish(&ServerMessage::Pong, None).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_participants, 1);
    }

    #[tokio::test]
    async fn test_roster_lists_participants() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.join(presence("alice")).await;
        let _rx2 = group.join(presence("bob")).await;

        let roster = group.roster().await;
        assert_eq!(roster.len(), 2);
        let ids: Vec<&str> = roster.iter().map(|p| p.user_id.as_str()).collect();
        assert!(ids.contains(&"alice"));
        assert!(ids.contains(&"bob"));
    }
}
