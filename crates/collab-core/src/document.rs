/// Collaborative document state, mutated only by applying operations inside a session
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Attributes, CollaborationError, Operation, OperationId, OperationKind, Result, UserId};

/// Formatting applied to a character range. Ranges are kept in write order, so where
/// two ranges cover the same character the later one decides each attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRange {
    pub start: usize,
    pub end: usize,
    pub attributes: Attributes,
    pub applied_by: UserId,
    pub operation_id: OperationId,
    pub timestamp: DateTime<Utc>,
}

impl FormatRange {
    fn order_key(&self) -> (DateTime<Utc>, &UserId, &OperationId) {
        (self.timestamp, &self.applied_by, &self.operation_id)
    }
}

/// Embedded media anchored at a character offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    pub url: String,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub text: String,
    pub formatting: Vec<FormatRange>,
    pub media: Vec<MediaItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
}

/// Ordered content blocks; only `move`, `split` and `merge` touch it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub blocks: Vec<Block>,
}

impl DocumentStructure {
    pub fn position_of(&self, block_id: &str) -> Option<usize> {
        self.blocks.iter().position(|block| block.id == block_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub last_edit_by: Option<UserId>,
    pub last_edit_at: Option<DateTime<Utc>>,
    pub character_count: usize,
    pub word_count: usize,
    pub block_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeDocument {
    pub content: DocumentContent,
    pub structure: DocumentStructure,
    pub metadata: DocumentMetadata,
    pub version: u64,
    pub checksum: String,
}

impl Default for CollaborativeDocument {
    fn default() -> Self {
        Self::from_text("")
    }
}

impl CollaborativeDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut document = Self {
            checksum: compute_checksum(&text),
            content: DocumentContent {
                text,
                ..Default::default()
            },
            structure: DocumentStructure::default(),
            metadata: DocumentMetadata::default(),
            version: 0,
        };
        document.refresh_counts();
        document
    }

    pub fn with_blocks<I, S>(mut self, block_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.structure.blocks = block_ids
            .into_iter()
            .map(|id| Block { id: id.into() })
            .collect();
        self.refresh_counts();
        self
    }

    pub fn text(&self) -> &str {
        &self.content.text
    }

    pub fn char_len(&self) -> usize {
        self.content.text.chars().count()
    }

    /// Whether the stored checksum matches the current text
    pub fn verify_checksum(&self) -> bool {
        self.checksum == compute_checksum(&self.content.text)
    }

    /// Apply an operation. On error the document is left untouched.
    pub fn apply(&mut self, op: &Operation, now: DateTime<Utc>) -> Result<()> {
        let start = op.position.start;

        match &op.kind {
            OperationKind::Insert { content } => {
                let text = splice(&self.content.text, start, 0, content)?;
                self.content.text = text;
                self.shift_anchors(start, 0, content.chars().count());
            }

            OperationKind::Delete { length, .. } => {
                let text = splice(&self.content.text, start, *length, "")?;
                self.content.text = text;
                self.shift_anchors(start, *length, 0);
            }

            OperationKind::Replace {
                content,
                original_content,
            } => {
                let removed = original_content.chars().count();
                let text = splice(&self.content.text, start, removed, content)?;
                self.content.text = text;
                self.shift_anchors(start, removed, content.chars().count());
            }

            OperationKind::Retain { length } => {
                self.check_range(start, offset_end(start, *length)?)?;
            }

            OperationKind::Format { attributes } => {
                let end = op.position.end_or_start();
                self.check_range(start, end)?;
                let range = FormatRange {
                    start,
                    end,
                    attributes: attributes.clone(),
                    applied_by: op.user_id.clone(),
                    operation_id: op.id.clone(),
                    timestamp: op.timestamp,
                };
                let at = self
                    .content
                    .formatting
                    .partition_point(|existing| existing.order_key() <= range.order_key());
                self.content.formatting.insert(at, range);
            }

            OperationKind::Move {
                block_id, to_index, ..
            } => {
                let from = self.find_block(block_id)?;
                if *to_index >= self.structure.blocks.len() {
                    return Err(CollaborationError::InvalidOperation(format!(
                        "move target {} out of range ({} blocks)",
                        to_index,
                        self.structure.blocks.len()
                    )));
                }
                let block = self.structure.blocks.remove(from);
                self.structure.blocks.insert(*to_index, block);
            }

            OperationKind::Split {
                block_id,
                new_block_id,
                ..
            } => {
                let index = self.find_block(block_id)?;
                if self.structure.position_of(new_block_id).is_some() {
                    return Err(CollaborationError::InvalidOperation(format!(
                        "block {} already exists",
                        new_block_id
                    )));
                }
                self.structure.blocks.insert(
                    index + 1,
                    Block {
                        id: new_block_id.clone(),
                    },
                );
            }

            OperationKind::Merge {
                block_id,
                merged_block_id,
                ..
            } => {
                self.find_block(block_id)?;
                let merged = self.find_block(merged_block_id)?;
                self.structure.blocks.remove(merged);
            }

            OperationKind::Lock { .. } | OperationKind::Unlock { .. } => {}
        }

        self.metadata.last_edit_by = Some(op.user_id.clone());
        self.metadata.last_edit_at = Some(now);
        self.version += 1;
        self.refresh_counts();
        self.checksum = compute_checksum(&self.content.text);

        Ok(())
    }

    /// Effective attributes of the character at `offset`. A `null` value clears the key.
    pub fn attributes_at(&self, offset: usize) -> Attributes {
        let mut attributes = Attributes::new();
        for range in &self.content.formatting {
            if range.start <= offset && offset < range.end {
                for (key, value) in &range.attributes {
                    if value.is_null() {
                        attributes.remove(key);
                    } else {
                        attributes.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        attributes
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        let len = self.char_len();
        if start > end || end > len {
            return Err(CollaborationError::InvalidOperation(format!(
                "range {}..{} outside document of length {}",
                start, end, len
            )));
        }
        Ok(())
    }

    fn find_block(&self, block_id: &str) -> Result<usize> {
        self.structure
            .position_of(block_id)
            .ok_or_else(|| CollaborationError::InvalidOperation(format!("unknown block {}", block_id)))
    }

    /// Keep formatting ranges and media anchored to the text they were applied to
    fn shift_anchors(&mut self, start: usize, removed: usize, inserted: usize) {
        let map = |offset: usize, is_end: bool| -> usize {
            let removed_end = start.saturating_add(removed);
            if offset < start || (offset == start && (is_end || removed > 0)) {
                offset
            } else if offset >= removed_end {
                offset - removed + inserted
            } else {
                start
            }
        };

        for range in &mut self.content.formatting {
            range.start = map(range.start, false);
            range.end = map(range.end, true).max(range.start);
        }
        self.content
            .formatting
            .retain(|range| range.end > range.start);

        for item in &mut self.content.media {
            item.offset = map(item.offset, false);
        }
    }

    fn refresh_counts(&mut self) {
        self.metadata.character_count = self.char_len();
        self.metadata.word_count = self.content.text.split_whitespace().count();
        self.metadata.block_count = self.structure.blocks.len();
    }
}

/// SHA-256 of the document text, lowercase hex
pub fn compute_checksum(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Replace `removed` characters at char offset `start` with `insert`
fn splice(text: &str, start: usize, removed: usize, insert: &str) -> Result<String> {
    let from = byte_offset(text, start)?;
    let to = byte_offset(text, offset_end(start, removed)?)?;

    let mut out = String::with_capacity(text.len() - (to - from) + insert.len());
    out.push_str(&text[..from]);
    out.push_str(insert);
    out.push_str(&text[to..]);
    Ok(out)
}

fn offset_end(start: usize, length: usize) -> Result<usize> {
    start.checked_add(length).ok_or_else(|| {
        CollaborationError::InvalidOperation(format!(
            "range starting at {} with length {} overflows",
            start, length
        ))
    })
}

fn byte_offset(text: &str, char_index: usize) -> Result<usize> {
    if char_index == 0 {
        return Ok(0);
    }
    text.char_indices()
        .map(|(byte, _)| byte)
        .chain(std::iter::once(text.len()))
        .nth(char_index)
        .ok_or_else(|| {
            CollaborationError::InvalidOperation(format!(
                "offset {} outside document of length {}",
                char_index,
                text.chars().count()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("bold".to_string(), serde_json::Value::Bool(true));
        attributes
    }

    #[test]
    fn test_insert_and_delete_by_char_offset() {
        let mut doc = CollaborativeDocument::from_text("naïve café");
        let now = Utc::now();

        doc.apply(&Operation::insert("a", 5, "!"), now).unwrap();
        assert_eq!(doc.text(), "naïve! café");

        doc.apply(&Operation::delete("a", 7, "café"), now).unwrap();
        assert_eq!(doc.text(), "naïve! ");
        assert_eq!(doc.version, 2);
        assert!(doc.verify_checksum());
        assert_eq!(doc.metadata.last_edit_by, Some(UserId::from("a")));
    }

    #[test]
    fn test_failed_apply_leaves_document_unchanged() {
        let mut doc = CollaborativeDocument::from_text("abc");
        let before = doc.clone();

        assert!(doc.apply(&Operation::delete_len("a", 2, 5), Utc::now()).is_err());
        assert!(doc.apply(&Operation::insert("a", 4, "x"), Utc::now()).is_err());
        assert!(doc
            .apply(&Operation::delete_len("a", usize::MAX, 1), Utc::now())
            .is_err());
        assert!(doc
            .apply(&Operation::retain("a", 1, usize::MAX), Utc::now())
            .is_err());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_replace_uses_original_length() {
        let mut doc = CollaborativeDocument::from_text("hello world");
        doc.apply(&Operation::replace("a", 6, "world", "there"), Utc::now())
            .unwrap();
        assert_eq!(doc.text(), "hello there");
    }

    #[test]
    fn test_formatting_follows_text() {
        let mut doc = CollaborativeDocument::from_text("0123456789");
        let now = Utc::now();

        doc.apply(&Operation::format("a", 2, 5, bold()), now).unwrap();
        doc.apply(&Operation::insert("a", 0, "xx"), now).unwrap();
        assert_eq!((doc.content.formatting[0].start, doc.content.formatting[0].end), (4, 7));

        doc.apply(&Operation::delete_len("a", 3, 9), now).unwrap();
        assert!(doc.content.formatting.is_empty());
    }

    #[test]
    fn test_later_format_wins_only_where_ranges_overlap() {
        let now = Utc::now();
        let mut italic = Attributes::new();
        italic.insert("italic".to_string(), serde_json::Value::Bool(true));
        let mut plain = Attributes::new();
        plain.insert("bold".to_string(), serde_json::Value::Null);

        let early = Operation::format("a", 0, 5, bold()).with_timestamp(now);
        let late = Operation::format("b", 3, 8, italic).with_timestamp(now + chrono::Duration::seconds(1));
        let cleared = Operation::format("c", 4, 6, plain).with_timestamp(now + chrono::Duration::seconds(2));

        let mut forward = CollaborativeDocument::from_text("0123456789");
        let mut reverse = forward.clone();
        for op in [&early, &late, &cleared] {
            forward.apply(op, now).unwrap();
        }
        for op in [&cleared, &late, &early] {
            reverse.apply(op, now).unwrap();
        }

        assert_eq!(forward.content.formatting, reverse.content.formatting);
        assert_eq!(forward.attributes_at(1).len(), 1);
        assert!(forward.attributes_at(1).contains_key("bold"));
        assert_eq!(forward.attributes_at(3).len(), 2);
        assert!(!forward.attributes_at(4).contains_key("bold"));
        assert!(forward.attributes_at(7).contains_key("italic"));
        assert!(forward.attributes_at(9).is_empty());
    }

    #[test]
    fn test_structural_operations() {
        let mut doc = CollaborativeDocument::new().with_blocks(["p1", "p2", "p3"]);
        let now = Utc::now();

        doc.apply(&Operation::move_block("a", "p1", 0, 2), now).unwrap();
        assert_eq!(ids(&doc), ["p2", "p3", "p1"]);

        doc.apply(&Operation::split("a", "p3", "p4", 3), now).unwrap();
        assert_eq!(ids(&doc), ["p2", "p3", "p4", "p1"]);

        doc.apply(&Operation::merge("a", "p3", "p4", 3), now).unwrap();
        assert_eq!(ids(&doc), ["p2", "p3", "p1"]);
        assert_eq!(doc.metadata.block_count, 3);

        assert!(doc.apply(&Operation::move_block("a", "zz", 0, 1), now).is_err());
    }

    #[test]
    fn test_checksum_is_function_of_text() {
        let a = CollaborativeDocument::from_text("same");
        let mut b = CollaborativeDocument::from_text("sam");
        b.apply(&Operation::insert("x", 3, "e"), Utc::now()).unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    fn ids(doc: &CollaborativeDocument) -> Vec<&str> {
        doc.structure.blocks.iter().map(|b| b.id.as_str()).collect()
    }
}
