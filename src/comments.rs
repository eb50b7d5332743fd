//! Threaded comments anchored to dashboard elements.
//!
//! The store is append-only: comments are added and replied to, never
//! edited or deleted, and resolving a thread only flips a flag.
//! Local additions are optimistic; the server's `comment_added` echo
//! reconciles by id, so applying it is idempotent.

use uuid::Uuid;

use crate::protocol::{ClientMessage, Comment, CursorPosition, now_millis};

/// Element id used for comments not anchored to any element.
pub const GENERAL_THREAD: &str = "general";

/// Append-only threaded comment store.
#[derive(Debug, Default)]
pub struct CommentStore {
    threads: Vec<Comment>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Local, optimistic mutations ────────────────────────────────

    /// Add a top-level comment and return the frame announcing it.
    pub fn add(
        &mut self,
        element_id: impl Into<String>,
        text: impl Into<String>,
        position: Option<CursorPosition>,
        author: &str,
        author_name: &str,
    ) -> (Comment, ClientMessage) {
        let comment = Comment {
            id: Uuid::new_v4(),
            element_id: element_id.into(),
            text: text.into(),
            position,
            author: author.to_string(),
            author_name: author_name.to_string(),
            timestamp: now_millis(),
            resolved: false,
            replies: Vec::new(),
        };
        let message = Self::frame(&comment, None);
        self.threads.push(comment.clone());
        (comment, message)
    }

    /// Reply inside an existing thread. Returns `None` when the parent
    /// is unknown.
    pub fn reply(
        &mut self,
        parent_id: Uuid,
        text: impl Into<String>,
        author: &str,
        author_name: &str,
    ) -> Option<(Comment, ClientMessage)> {
        let parent = Self::find_mut(&mut self.threads, parent_id)?;
        let reply = Comment {
            id: Uuid::new_v4(),
            element_id: parent.element_id.clone(),
            text: text.into(),
            position: None,
            author: author.to_string(),
            author_name: author_name.to_string(),
            timestamp: now_millis(),
            resolved: false,
            replies: Vec::new(),
        };
        let message = Self::frame(&reply, Some(parent_id));
        parent.replies.push(reply.clone());
        Some((reply, message))
    }

    /// Flip the resolved flag on a thread and return the frame, or
    /// `None` for an unknown or already-resolved comment.
    pub fn resolve(&mut self, comment_id: Uuid) -> Option<ClientMessage> {
        let comment = Self::find_mut(&mut self.threads, comment_id)?;
        if comment.resolved {
            return None;
        }
        comment.resolved = true;
        Some(ClientMessage::ResolveComment { comment_id })
    }

    // ── Inbound reconciliation ─────────────────────────────────────

    /// Apply a `comment_added` broadcast.
    ///
    /// A comment whose id is already present is replaced wholesale
    /// with the server's record, so the local optimistic copy and the
    /// echo converge. Replies with an unknown parent fall back to a
    /// top-level thread rather than being dropped.
    pub fn apply_added(&mut self, comment: Comment, parent_id: Option<Uuid>) {
        if let Some(existing) = Self::find_mut(&mut self.threads, comment.id) {
            *existing = comment;
            return;
        }
        match parent_id.and_then(|id| Self::find_mut(&mut self.threads, id)) {
            Some(parent) => parent.replies.push(comment),
            None => {
                if parent_id.is_some() {
                    log::warn!("Reply {} to unknown thread, keeping top-level", comment.id);
                }
                self.threads.push(comment);
            }
        }
    }

    /// Apply a `comment_resolved` broadcast. Idempotent.
    pub fn apply_resolved(&mut self, comment_id: Uuid) -> bool {
        match Self::find_mut(&mut self.threads, comment_id) {
            Some(comment) => {
                comment.resolved = true;
                true
            }
            None => {
                log::debug!("Resolve for unknown comment {comment_id}");
                false
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn threads(&self) -> &[Comment] {
        &self.threads
    }

    pub fn get(&self, comment_id: Uuid) -> Option<&Comment> {
        Self::find(&self.threads, comment_id)
    }

    /// Top-level threads anchored to one element, in arrival order.
    pub fn for_element(&self, element_id: &str) -> Vec<&Comment> {
        self.threads
            .iter()
            .filter(|c| c.element_id == element_id)
            .collect()
    }

    /// Total comment count, replies included.
    pub fn total_count(&self) -> usize {
        fn count(comments: &[Comment]) -> usize {
            comments.iter().map(|c| 1 + count(&c.replies)).sum()
        }
        count(&self.threads)
    }

    /// Unresolved comments, replies included.
    pub fn unresolved_count(&self) -> usize {
        self.total_count() - self.resolved_count()
    }

    /// Resolved comments, replies included.
    pub fn resolved_count(&self) -> usize {
        fn count(comments: &[Comment]) -> usize {
            comments
                .iter()
                .map(|c| usize::from(c.resolved) + count(&c.replies))
                .sum()
        }
        count(&self.threads)
    }

    fn frame(comment: &Comment, parent_id: Option<Uuid>) -> ClientMessage {
        ClientMessage::AddComment {
            comment_id: comment.id,
            element_id: comment.element_id.clone(),
            text: comment.text.clone(),
            position: comment.position.clone(),
            parent_id,
            user_id: comment.author.clone(),
            username: comment.author_name.clone(),
        }
    }

    fn find(comments: &[Comment], id: Uuid) -> Option<&Comment> {
        for comment in comments {
            if comment.id == id {
                return Some(comment);
            }
            if let Some(found) = Self::find(&comment.replies, id) {
                return Some(found);
            }
        }
        None
    }

    fn find_mut(comments: &mut [Comment], id: Uuid) -> Option<&mut Comment> {
        for comment in comments {
            if comment.id == id {
                return Some(comment);
            }
            if let Some(found) = Self::find_mut(&mut comment.replies, id) {
                return Some(found);
            }
        }
        None
    }
}
