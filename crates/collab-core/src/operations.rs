/// Collaborative document operations
/// These operations represent edits that are transformed and replicated across participants
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

use crate::{LockType, UserId};

/// Unique operation identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Formatting attributes, ordered so merged maps serialize identically on every replica
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Discriminant of an operation, as it appears in the wire `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Delete,
    Retain,
    Format,
    Move,
    Replace,
    Split,
    Merge,
    Lock,
    Unlock,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Retain => "retain",
            OperationType::Format => "format",
            OperationType::Move => "move",
            OperationType::Replace => "replace",
            OperationType::Split => "split",
            OperationType::Merge => "merge",
            OperationType::Lock => "lock",
            OperationType::Unlock => "unlock",
        }
    }

    /// Structural operations rearrange blocks and are never composed
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OperationType::Split | OperationType::Merge | OperationType::Move
        )
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character offsets (Unicode scalar values) into the document text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub start: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl Position {
    pub const fn at(start: usize) -> Self {
        Self { start, end: None }
    }

    pub const fn range(start: usize, end: usize) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn end_or_start(&self) -> usize {
        self.end.unwrap_or(self.start).max(self.start)
    }

    /// Move the whole position by a signed character delta, saturating at zero
    pub fn shifted(&self, delta: isize) -> Self {
        let shift = |value: usize| value.saturating_add_signed(delta);
        Self {
            start: shift(self.start),
            end: self.end.map(shift),
        }
    }
}

/// Type-specific payload of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum OperationKind {
    #[serde(rename_all = "camelCase")]
    Insert { content: String },

    #[serde(rename_all = "camelCase")]
    Delete {
        length: usize,
        /// Removed text, when the author knows it; required to invert the delete
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Retain { length: usize },

    #[serde(rename_all = "camelCase")]
    Format { attributes: Attributes },

    #[serde(rename_all = "camelCase")]
    Move {
        block_id: String,
        from_index: usize,
        to_index: usize,
    },

    #[serde(rename_all = "camelCase")]
    Replace {
        content: String,
        original_content: String,
    },

    #[serde(rename_all = "camelCase")]
    Split {
        block_id: String,
        new_block_id: String,
        offset: usize,
    },

    #[serde(rename_all = "camelCase")]
    Merge {
        block_id: String,
        merged_block_id: String,
        offset: usize,
    },

    #[serde(rename_all = "camelCase")]
    Lock {
        block_id: String,
        lock_type: LockType,
    },

    #[serde(rename_all = "camelCase")]
    Unlock {
        block_id: String,
        lock_type: LockType,
    },
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationKind::Insert { .. } => OperationType::Insert,
            OperationKind::Delete { .. } => OperationType::Delete,
            OperationKind::Retain { .. } => OperationType::Retain,
            OperationKind::Format { .. } => OperationType::Format,
            OperationKind::Move { .. } => OperationType::Move,
            OperationKind::Replace { .. } => OperationType::Replace,
            OperationKind::Split { .. } => OperationType::Split,
            OperationKind::Merge { .. } => OperationType::Merge,
            OperationKind::Lock { .. } => OperationType::Lock,
            OperationKind::Unlock { .. } => OperationType::Unlock,
        }
    }

    /// Block targeted by a structural or locking operation
    pub fn block_id(&self) -> Option<&str> {
        match self {
            OperationKind::Move { block_id, .. }
            | OperationKind::Split { block_id, .. }
            | OperationKind::Merge { block_id, .. }
            | OperationKind::Lock { block_id, .. }
            | OperationKind::Unlock { block_id, .. } => Some(block_id),
            _ => None,
        }
    }
}

/// Free-form operation metadata with the keys the core understands lifted out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    /// Content block the edit belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,

    /// Session version the author had seen when creating the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An immutable edit intent. Transforms produce new values, they never mutate one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    /// User who created this operation
    pub user_id: UserId,

    pub position: Position,

    /// The actual operation
    pub kind: OperationKind,

    /// Timestamp when operation was created (client time)
    pub timestamp: DateTime<Utc>,

    pub metadata: OperationMetadata,
}

impl Operation {
    pub fn new(user_id: impl Into<UserId>, position: Position, kind: OperationKind) -> Self {
        Self {
            id: OperationId::new(),
            user_id: user_id.into(),
            position,
            kind,
            timestamp: Utc::now(),
            metadata: OperationMetadata::default(),
        }
    }

    pub fn insert(user_id: impl Into<UserId>, start: usize, content: impl Into<String>) -> Self {
        Self::new(
            user_id,
            Position::at(start),
            OperationKind::Insert {
                content: content.into(),
            },
        )
    }

    /// Delete `removed` starting at `start`, recording the text so the delete can be inverted
    pub fn delete(user_id: impl Into<UserId>, start: usize, removed: impl Into<String>) -> Self {
        let removed = removed.into();
        let length = removed.chars().count();
        Self::new(
            user_id,
            Position::range(start, start.saturating_add(length)),
            OperationKind::Delete {
                length,
                content: Some(removed),
            },
        )
    }

    /// Delete `length` characters without knowing their content
    pub fn delete_len(user_id: impl Into<UserId>, start: usize, length: usize) -> Self {
        Self::new(
            user_id,
            Position::range(start, start.saturating_add(length)),
            OperationKind::Delete {
                length,
                content: None,
            },
        )
    }

    pub fn retain(user_id: impl Into<UserId>, start: usize, length: usize) -> Self {
        Self::new(
            user_id,
            Position::range(start, start.saturating_add(length)),
            OperationKind::Retain { length },
        )
    }

    pub fn format(
        user_id: impl Into<UserId>,
        start: usize,
        end: usize,
        attributes: Attributes,
    ) -> Self {
        Self::new(
            user_id,
            Position::range(start, end),
            OperationKind::Format { attributes },
        )
    }

    pub fn replace(
        user_id: impl Into<UserId>,
        start: usize,
        original_content: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let original_content = original_content.into();
        let end = start.saturating_add(original_content.chars().count());
        Self::new(
            user_id,
            Position::range(start, end),
            OperationKind::Replace {
                content: content.into(),
                original_content,
            },
        )
    }

    pub fn move_block(
        user_id: impl Into<UserId>,
        block_id: impl Into<String>,
        from_index: usize,
        to_index: usize,
    ) -> Self {
        Self::new(
            user_id,
            Position::at(from_index),
            OperationKind::Move {
                block_id: block_id.into(),
                from_index,
                to_index,
            },
        )
    }

    pub fn split(
        user_id: impl Into<UserId>,
        block_id: impl Into<String>,
        new_block_id: impl Into<String>,
        offset: usize,
    ) -> Self {
        Self::new(
            user_id,
            Position::at(offset),
            OperationKind::Split {
                block_id: block_id.into(),
                new_block_id: new_block_id.into(),
                offset,
            },
        )
    }

    pub fn merge(
        user_id: impl Into<UserId>,
        block_id: impl Into<String>,
        merged_block_id: impl Into<String>,
        offset: usize,
    ) -> Self {
        Self::new(
            user_id,
            Position::at(offset),
            OperationKind::Merge {
                block_id: block_id.into(),
                merged_block_id: merged_block_id.into(),
                offset,
            },
        )
    }

    pub fn lock(user_id: impl Into<UserId>, block_id: impl Into<String>, lock_type: LockType) -> Self {
        Self::new(
            user_id,
            Position::at(0),
            OperationKind::Lock {
                block_id: block_id.into(),
                lock_type,
            },
        )
    }

    pub fn unlock(
        user_id: impl Into<UserId>,
        block_id: impl Into<String>,
        lock_type: LockType,
    ) -> Self {
        Self::new(
            user_id,
            Position::at(0),
            OperationKind::Unlock {
                block_id: block_id.into(),
                lock_type,
            },
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = OperationId(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_block(mut self, block_id: impl Into<String>) -> Self {
        self.metadata.block_id = Some(block_id.into());
        self
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.metadata.base_version = Some(version);
        self
    }

    pub fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    pub fn is_structural(&self) -> bool {
        self.op_type().is_structural()
    }

    /// Block this operation touches: the structural target, else the metadata block
    pub fn block_id(&self) -> Option<&str> {
        self.kind
            .block_id()
            .or(self.metadata.block_id.as_deref())
    }

    /// Rebuild this operation with a new position and payload, keeping identity and authorship
    pub fn derive(&self, position: Position, kind: OperationKind) -> Self {
        Self {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            position,
            kind,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
    }

    /// Same payload at a different position
    pub fn at_position(&self, position: Position) -> Self {
        self.derive(position, self.kind.clone())
    }

    /// Half-open character range this operation covers in the text it was authored against.
    /// Ends that do not fit in `usize` saturate; see [`Operation::checked_span`].
    pub fn span(&self) -> (usize, usize) {
        self.checked_span()
            .unwrap_or((self.position.start, usize::MAX))
    }

    /// Like [`Operation::span`], `None` when the end overflows
    pub fn checked_span(&self) -> Option<(usize, usize)> {
        let start = self.position.start;
        let end = match &self.kind {
            OperationKind::Insert { .. } => start,
            OperationKind::Delete { length, .. } | OperationKind::Retain { length } => {
                start.checked_add(*length)?
            }
            OperationKind::Replace {
                original_content, ..
            } => start.checked_add(original_content.chars().count())?,
            _ => self.position.end_or_start(),
        };
        Some((start, end))
    }

    /// Whether this operation addresses text offsets (as opposed to blocks or locks)
    pub fn is_text_edit(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::Insert { .. }
                | OperationKind::Delete { .. }
                | OperationKind::Retain { .. }
                | OperationKind::Format { .. }
                | OperationKind::Replace { .. }
        )
    }

    /// Net change in document length, in characters
    pub fn length_delta(&self) -> isize {
        match &self.kind {
            OperationKind::Insert { content } => content.chars().count() as isize,
            OperationKind::Delete { length, .. } => 0isize.saturating_sub_unsigned(*length),
            OperationKind::Replace {
                content,
                original_content,
            } => content.chars().count() as isize - original_content.chars().count() as isize,
            _ => 0,
        }
    }
}

/// Stable JSON shape of an operation: `{id, type, userId, position, data, timestamp, metadata}`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    id: OperationId,
    #[serde(rename = "type")]
    op_type: OperationType,
    user_id: UserId,
    position: Position,
    #[serde(default)]
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: OperationMetadata,
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let tagged = serde_json::to_value(&self.kind).map_err(S::Error::custom)?;
        let data = tagged
            .get("data")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        WireOperation {
            id: self.id.clone(),
            op_type: self.op_type(),
            user_id: self.user_id.clone(),
            position: self.position,
            data,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = WireOperation::deserialize(deserializer)?;
        let kind: OperationKind = serde_json::from_value(serde_json::json!({
            "type": wire.op_type,
            "data": wire.data,
        }))
        .map_err(|e| D::Error::custom(format!("invalid {} payload: {}", wire.op_type, e)))?;

        Ok(Operation {
            id: wire.id,
            user_id: wire.user_id,
            position: wire.position,
            kind,
            timestamp: wire.timestamp,
            metadata: wire.metadata,
        })
    }
}

/// An operation as it was committed to a session, with the version it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOperation {
    pub operation: Operation,
    pub version: u64,
    pub applied_at: DateTime<Utc>,
}

/// Append-only operation history of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationLog {
    /// All operations in commit order
    pub entries: Vec<AppliedOperation>,

    /// Index by operation ID for fast lookup
    #[serde(skip)]
    operation_index: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a committed operation to the log
    pub fn push(&mut self, entry: AppliedOperation) {
        let id = entry.operation.id.clone();
        self.entries.push(entry);
        self.operation_index.insert(id, self.entries.len() - 1);
    }

    /// Get operation by ID
    pub fn get(&self, id: &OperationId) -> Option<&AppliedOperation> {
        self.operation_index
            .get(id)
            .and_then(|&idx| self.entries.get(idx))
    }

    /// Entries committed after the given session version
    pub fn since_version(&self, version: u64) -> impl Iterator<Item = &AppliedOperation> {
        self.entries.iter().filter(move |entry| entry.version > version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppliedOperation> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let op = Operation::replace("alice", 3, "old", "new").with_id("op-1");
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["id"], "op-1");
        assert_eq!(json["type"], "replace");
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["position"]["start"], 3);
        assert_eq!(json["position"]["end"], 6);
        assert_eq!(json["data"]["originalContent"], "old");
        assert_eq!(json["data"]["content"], "new");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_parse_foreign_operation() {
        let json = r#"{
            "id": "client-42",
            "type": "insert",
            "userId": "bob",
            "position": {"start": 5},
            "data": {"content": "hi"},
            "timestamp": "2024-03-01T12:00:00Z",
            "metadata": {"blockId": "p1", "source": "mobile"}
        }"#;

        let op: Operation = serde_json::from_str(json).unwrap();
        assert_eq!(op.id, OperationId::from("client-42"));
        assert_eq!(op.position, Position::at(5));
        assert_eq!(
            op.kind,
            OperationKind::Insert {
                content: "hi".to_string()
            }
        );
        assert_eq!(op.block_id(), Some("p1"));
        assert_eq!(op.metadata.extra["source"], "mobile");
    }

    #[test]
    fn test_rejects_mismatched_payload() {
        let json = r#"{
            "id": "x",
            "type": "delete",
            "userId": "bob",
            "position": {"start": 0},
            "data": {"content": "no length"},
            "timestamp": "2024-03-01T12:00:00Z"
        }"#;

        assert!(serde_json::from_str::<Operation>(json).is_err());
    }

    #[test]
    fn test_span_and_delta() {
        let delete = Operation::delete("a", 2, "xyz");
        assert_eq!(delete.span(), (2, 5));
        assert_eq!(delete.length_delta(), -3);

        let insert = Operation::insert("a", 4, "héllo");
        assert_eq!(insert.span(), (4, 4));
        assert_eq!(insert.length_delta(), 5);
    }

    #[test]
    fn test_span_saturates_on_overflowing_wire_input() {
        let huge = Operation::delete_len("a", usize::MAX, 1);
        assert_eq!(huge.checked_span(), None);
        assert_eq!(huge.span(), (usize::MAX, usize::MAX));

        let wide = Operation::delete_len("a", 0, usize::MAX);
        assert_eq!(wide.length_delta(), isize::MIN);
    }

    #[test]
    fn test_operation_log_lookup() {
        let mut log = OperationLog::new();
        for version in 1..=3 {
            log.push(AppliedOperation {
                operation: Operation::insert("a", 0, "x"),
                version,
                applied_at: Utc::now(),
            });
        }

        let id = log.entries[1].operation.id.clone();
        assert_eq!(log.get(&id).map(|e| e.version), Some(2));
        assert_eq!(log.since_version(1).count(), 2);
    }
}
