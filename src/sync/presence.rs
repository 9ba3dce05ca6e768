//! Presence and cursor tracking for the collaborators of one document.
//!
//! This is ephemeral state rebuilt from relay events:
//! - Who is connected (with a deterministic colour per collaborator)
//! - Where their caret or selection is
//! - When they were last active
//!
//! The tracker is owned by the coordinator and is never shared across tasks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use super::change::{Position, Range};
use super::CollaboratorId;
use crate::config::DEFAULT_ACTIVE_WINDOW;

/// Colours handed out to collaborators
const PALETTE: [&str; 14] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#22c55e", // green
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
    "#14b8a6", // teal
    "#a855f7", // purple
    "#84cc16", // lime
    "#6366f1", // indigo
    "#d946ef", // fuchsia
    "#0ea5e9", // sky
];

/// Colour for a collaborator id, stable across sessions and clients
pub fn color_for(id: &str) -> &'static str {
    let digest = Sha256::digest(id.as_bytes());
    let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    PALETTE[idx % PALETTE.len()]
}

/// Another user connected to the same document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: CollaboratorId,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Last activity (milliseconds since epoch)
    pub last_active_ms: i64,
}

impl Collaborator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            color: color_for(&id).to_string(),
            id,
            name: name.into(),
            avatar: None,
            last_active_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar;
        self
    }
}

/// Caret or selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CursorPosition {
    Caret(Position),
    Selection(Range),
}

impl CursorPosition {
    pub fn has_selection(&self) -> bool {
        matches!(self, CursorPosition::Selection(range) if !range.is_empty())
    }

    /// Where the caret is drawn
    pub fn head(&self) -> Position {
        match self {
            CursorPosition::Caret(at) => *at,
            CursorPosition::Selection(range) => range.to,
        }
    }
}

/// Latest cursor report of one collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub collaborator_id: CollaboratorId,
    pub position: CursorPosition,
    pub updated_at_ms: i64,
}

/// Errors related to presence operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("Collaborator not found: {0}")]
    CollaboratorNotFound(CollaboratorId),

    #[error("Invalid cursor position")]
    InvalidCursor,
}

/// Collaborators and cursors of the current document
#[derive(Debug)]
pub struct PresenceTracker {
    collaborators: HashMap<CollaboratorId, Collaborator>,
    cursors: HashMap<CollaboratorId, CursorState>,
    active_window: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVE_WINDOW)
    }
}

impl PresenceTracker {
    pub fn new(active_window: Duration) -> Self {
        Self {
            collaborators: HashMap::new(),
            cursors: HashMap::new(),
            active_window,
        }
    }

    /// Insert or replace a collaborator; returns true if it was not known yet
    pub fn upsert_collaborator(&mut self, collaborator: Collaborator) -> bool {
        self.collaborators
            .insert(collaborator.id.clone(), collaborator)
            .is_none()
    }

    /// Remove a collaborator together with its cursor
    pub fn remove_collaborator(&mut self, id: &str) -> Option<Collaborator> {
        self.cursors.remove(id);
        self.collaborators.remove(id)
    }

    /// Record a caret or selection for a known collaborator
    pub fn update_cursor(
        &mut self,
        id: &str,
        position: CursorPosition,
        timestamp_ms: i64,
    ) -> Result<(), PresenceError> {
        if let CursorPosition::Selection(range) = position {
            if range.is_inverted() {
                return Err(PresenceError::InvalidCursor);
            }
        }

        let collaborator = self
            .collaborators
            .get_mut(id)
            .ok_or_else(|| PresenceError::CollaboratorNotFound(id.to_string()))?;
        collaborator.last_active_ms = collaborator.last_active_ms.max(timestamp_ms);

        self.cursors.insert(
            id.to_string(),
            CursorState {
                collaborator_id: id.to_string(),
                position,
                updated_at_ms: timestamp_ms,
            },
        );
        Ok(())
    }

    /// Mark a collaborator as active at `timestamp_ms`
    pub fn touch(&mut self, id: &str, timestamp_ms: i64) {
        if let Some(collaborator) = self.collaborators.get_mut(id) {
            collaborator.last_active_ms = collaborator.last_active_ms.max(timestamp_ms);
        }
    }

    /// Whether the collaborator was seen within the activity window before `now_ms`.
    /// Display hint only; stale collaborators are not evicted.
    pub fn is_active_at(&self, id: &str, now_ms: i64) -> bool {
        let window = self.active_window.as_millis() as i64;
        self.collaborators
            .get(id)
            .map(|c| now_ms - c.last_active_ms < window)
            .unwrap_or(false)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.is_active_at(id, chrono::Utc::now().timestamp_millis())
    }

    pub fn get(&self, id: &str) -> Option<&Collaborator> {
        self.collaborators.get(id)
    }

    pub fn cursor(&self, id: &str) -> Option<&CursorState> {
        self.cursors.get(id)
    }

    /// Snapshot of all collaborators, ordered by id
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut all: Vec<_> = self.collaborators.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Snapshot of all cursors, ordered by collaborator id
    pub fn cursors(&self) -> Vec<CursorState> {
        let mut all: Vec<_> = self.cursors.values().cloned().collect();
        all.sort_by(|a, b| a.collaborator_id.cmp(&b.collaborator_id));
        all
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// Forget everything (the relay resends the member list on reconnect)
    pub fn clear(&mut self) {
        self.collaborators.clear();
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(30))
    }

    #[test]
    fn test_color_is_deterministic() {
        assert_eq!(color_for("user-1"), color_for("user-1"));
        assert!(PALETTE.contains(&color_for("user-2")));

        let collaborator = Collaborator::new("user-1", "Alice");
        assert_eq!(collaborator.color, color_for("user-1"));
    }

    #[test]
    fn test_upsert_keeps_ids_unique() {
        let mut presence = tracker();

        assert!(presence.upsert_collaborator(Collaborator::new("u1", "Alice")));
        assert!(!presence.upsert_collaborator(Collaborator::new("u1", "Alice B.")));
        assert!(presence.upsert_collaborator(Collaborator::new("u2", "Bob")));

        assert_eq!(presence.len(), 2);
        assert_eq!(presence.get("u1").unwrap().name, "Alice B.");
    }

    #[test]
    fn test_join_then_leave_clears_everything() {
        let mut presence = tracker();
        presence.upsert_collaborator(Collaborator::new("U1", "Alice"));
        presence
            .update_cursor("U1", CursorPosition::Caret(Position::new(0, 3)), 1_000)
            .unwrap();
        assert!(presence.cursor("U1").is_some());

        let removed = presence.remove_collaborator("U1");
        assert!(removed.is_some());
        assert!(presence.get("U1").is_none());
        assert!(presence.cursor("U1").is_none());
        assert!(presence.cursors().is_empty());
    }

    #[test]
    fn test_cursor_for_unknown_collaborator() {
        let mut presence = tracker();
        let result = presence.update_cursor("ghost", CursorPosition::Caret(Position::new(1, 1)), 0);
        assert_eq!(
            result,
            Err(PresenceError::CollaboratorNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn test_selection_cursor() {
        let mut presence = tracker();
        presence.upsert_collaborator(Collaborator::new("u1", "Alice"));

        let selection = CursorPosition::Selection(Range::between((1, 0), (1, 4)));
        presence.update_cursor("u1", selection, 5).unwrap();

        let state = presence.cursor("u1").unwrap();
        assert!(state.position.has_selection());
        assert_eq!(state.position.head(), Position::new(1, 4));

        let inverted = CursorPosition::Selection(Range::between((2, 0), (1, 0)));
        assert_eq!(
            presence.update_cursor("u1", inverted, 6),
            Err(PresenceError::InvalidCursor)
        );
    }

    #[test]
    fn test_activity_window() {
        let mut presence = tracker();
        let mut alice = Collaborator::new("u1", "Alice");
        alice.last_active_ms = 10_000;
        presence.upsert_collaborator(alice);

        assert!(presence.is_active_at("u1", 39_999));
        assert!(!presence.is_active_at("u1", 40_000));

        presence.touch("u1", 35_000);
        assert!(presence.is_active_at("u1", 60_000));
        // touches never move the activity time backwards
        presence.touch("u1", 20_000);
        assert!(presence.is_active_at("u1", 64_999));
        assert!(!presence.is_active_at("nobody", 0));
    }

    #[test]
    fn test_clear() {
        let mut presence = tracker();
        presence.upsert_collaborator(Collaborator::new("u1", "Alice"));
        presence.upsert_collaborator(Collaborator::new("u2", "Bob"));
        presence.clear();
        assert!(presence.is_empty());
    }
}
