/// Participant presence for collaborative editing
/// Tracks who is in a session, where their cursor is and what they have selected
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Operation, OperationKind, UserId};

/// Cursor and selection highlight colors, handed out in join order
pub const CURSOR_PALETTE: [&str; 10] = [
    "#E53935", "#1E88E5", "#43A047", "#FB8C00", "#8E24AA", "#00ACC1", "#F4511E", "#3949AB",
    "#7CB342", "#D81B60",
];

/// Color for the participant joining at `index` (zero-based join order)
pub fn color_for_index(index: usize) -> &'static str {
    CURSOR_PALETTE[index % CURSOR_PALETTE.len()]
}

/// What a participant may do in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_edit: bool,
    pub can_comment: bool,
    pub can_lock: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            can_edit: true,
            can_comment: true,
            can_lock: true,
        }
    }
}

/// User joining a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,

    #[serde(default)]
    pub permissions: Permissions,
}

impl User {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            permissions: Permissions::default(),
        }
    }
}

/// Caret position of a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub user_id: UserId,

    /// Character offset into the document text
    pub position: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,

    pub color: String,
    pub updated_at: DateTime<Utc>,
}

/// Selected character range `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub user_id: UserId,
    pub start: usize,
    pub end: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl Selection {
    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// A user's state in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub cursor: Cursor,
    pub selection: Option<Selection>,
    pub permissions: Permissions,
    pub color: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,

    /// Latest session version this participant is known to have seen.
    /// Edits without a base version are rebased from here.
    #[serde(default)]
    pub acked_version: u64,
}

impl Participant {
    pub fn new(user: &User, cursor: Cursor, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            color: cursor.color.clone(),
            cursor,
            selection: None,
            permissions: user.permissions,
            joined_at: now,
            last_seen: now,
            is_active: true,
            acked_version: 0,
        }
    }

    /// Record that the participant has seen `version`; never moves backwards
    pub fn acknowledge(&mut self, version: u64) {
        self.acked_version = self.acked_version.max(version);
    }

    /// Update last activity timestamp
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.is_active = true;
    }

    /// Recompute `is_active`; returns true when the flag changed
    pub fn refresh_activity(&mut self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let active = now - self.last_seen < threshold;
        let changed = active != self.is_active;
        self.is_active = active;
        changed
    }
}

/// Pure cursor and selection arithmetic
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorManager;

impl CursorManager {
    pub fn new() -> Self {
        Self
    }

    /// Fresh cursor at the start of the document
    pub fn create_cursor(&self, user_id: &UserId, color: &str, now: DateTime<Utc>) -> Cursor {
        Cursor {
            user_id: user_id.clone(),
            position: 0,
            block_id: None,
            color: color.to_string(),
            updated_at: now,
        }
    }

    /// Cursor moved to a new offset, clamped to the document length
    pub fn update_cursor(
        &self,
        cursor: &Cursor,
        position: usize,
        block_id: Option<String>,
        doc_len: usize,
        now: DateTime<Utc>,
    ) -> Cursor {
        Cursor {
            position: position.min(doc_len),
            block_id,
            updated_at: now,
            ..cursor.clone()
        }
    }

    /// Normalised selection clamped to the document length
    pub fn update_selection(
        &self,
        user_id: &UserId,
        start: usize,
        end: usize,
        block_id: Option<String>,
        doc_len: usize,
    ) -> Selection {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Selection {
            user_id: user_id.clone(),
            start: start.min(doc_len),
            end: end.min(doc_len),
            block_id,
        }
    }

    /// Where `offset` ends up after `op` has been applied.
    ///
    /// A caret sitting exactly at an insert point stays in front of the new text
    /// unless it belongs to the author, whose caret follows what they typed.
    pub fn transform_offset(&self, offset: usize, op: &Operation, owner: &UserId) -> usize {
        let start = op.position.start;
        match &op.kind {
            OperationKind::Insert { content } => {
                let len = content.chars().count();
                if offset > start || (offset == start && op.user_id == *owner) {
                    offset.saturating_add(len)
                } else {
                    offset
                }
            }
            OperationKind::Delete { length, .. } => {
                if offset <= start {
                    offset
                } else if offset >= start.saturating_add(*length) {
                    offset - length
                } else {
                    start
                }
            }
            OperationKind::Replace {
                content,
                original_content,
            } => {
                let removed = original_content.chars().count();
                let inserted = content.chars().count();
                if offset <= start {
                    offset
                } else if offset >= start.saturating_add(removed) {
                    offset - removed + inserted
                } else {
                    start.saturating_add(inserted)
                }
            }
            _ => offset,
        }
    }

    pub fn transform_cursor(&self, cursor: &Cursor, op: &Operation) -> Cursor {
        Cursor {
            position: self.transform_offset(cursor.position, op, &cursor.user_id),
            ..cursor.clone()
        }
    }

    pub fn transform_selection(&self, selection: &Selection, op: &Operation) -> Selection {
        let start = self.transform_offset(selection.start, op, &selection.user_id);
        let end = self.transform_offset(selection.end, op, &selection.user_id);
        Selection {
            start,
            end: end.max(start),
            ..selection.clone()
        }
    }
}
