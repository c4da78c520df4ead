/// Pairwise transform rules.
///
/// Every rule receives two concurrent operations authored against the same
/// document state and returns `op1'` (op1 rewritten to apply after op2) and
/// `op2'` (op2 rewritten to apply after op1). `None` cancels an operation.
use serde_json::json;
use thiserror::Error;

use crate::{
    Attributes, ConflictSeverity, ConflictType, Operation, OperationConflict, OperationKind,
    OperationType, Position, ResolutionStrategy,
};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("rule {rule} cannot handle {op1}/{op2} payloads")]
    PayloadMismatch {
        rule: &'static str,
        op1: OperationType,
        op2: OperationType,
    },

    #[error("invalid range {start}..{end} on operation {operation}")]
    InvalidRange {
        operation: String,
        start: usize,
        end: usize,
    },
}

/// What a rule decided, before conflict detectors run
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub op1_prime: Option<Operation>,
    pub op2_prime: Option<Operation>,
    pub conflicts: Vec<OperationConflict>,
    pub confidence: f32,
    pub details: serde_json::Value,
}

impl RuleOutcome {
    fn new(op1_prime: Option<Operation>, op2_prime: Option<Operation>) -> Self {
        Self {
            op1_prime,
            op2_prime,
            conflicts: Vec::new(),
            confidence: 1.0,
            details: serde_json::Value::Null,
        }
    }

    fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    fn with_conflict(mut self, conflict: OperationConflict) -> Self {
        self.conflicts.push(conflict);
        self
    }

    fn swapped(self) -> Self {
        Self {
            op1_prime: self.op2_prime,
            op2_prime: self.op1_prime,
            ..self
        }
    }
}

pub type TransformRule = fn(&Operation, &Operation) -> Result<RuleOutcome, TransformError>;

fn mismatch(rule: &'static str, op1: &Operation, op2: &Operation) -> TransformError {
    TransformError::PayloadMismatch {
        rule,
        op1: op1.op_type(),
        op2: op2.op_type(),
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn char_slice(text: &str, from: usize, to: usize) -> String {
    text.chars().skip(from).take(to.saturating_sub(from)).collect()
}

/// Total order used whenever two operations must be ranked identically on every replica
fn order_key(op: &Operation) -> (&str, &str) {
    (op.user_id.as_str(), op.id.0.as_str())
}

/// Whether `a` counts as the later write. Equal timestamps fall back to `(userId, id)`.
pub(crate) fn is_later(a: &Operation, b: &Operation) -> bool {
    a.timestamp > b.timestamp || (a.timestamp == b.timestamp && order_key(a) > order_key(b))
}

fn checked_span(op: &Operation) -> Result<(usize, usize), TransformError> {
    let invalid = |end: usize| TransformError::InvalidRange {
        operation: op.id.to_string(),
        start: op.position.start,
        end,
    };

    let (start, end) = op.checked_span().ok_or_else(|| invalid(usize::MAX))?;
    if let Some(declared_end) = op.position.end {
        if declared_end < start {
            return Err(invalid(declared_end));
        }
    }
    Ok((start, end))
}

/// Signed shift that removes `length` characters
fn back(length: usize) -> isize {
    0isize.saturating_sub_unsigned(length)
}

fn shift(op: &Operation, delta: isize) -> Operation {
    op.at_position(op.position.shifted(delta))
}

/// Both operations proceed unchanged
pub fn independent(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    Ok(RuleOutcome::new(Some(op1.clone()), Some(op2.clone())))
}

pub fn insert_insert(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (OperationKind::Insert { content: c1 }, OperationKind::Insert { content: c2 }) =
        (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("insert-insert", op1, op2));
    };

    let (p1, p2) = (op1.position.start, op2.position.start);
    let tie = p1 == p2;
    let op1_first = p1 < p2 || (tie && order_key(op1) < order_key(op2));

    let outcome = if op1_first {
        RuleOutcome::new(
            Some(op1.clone()),
            Some(shift(op2, char_len(c1) as isize)),
        )
    } else {
        RuleOutcome::new(
            Some(shift(op1, char_len(c2) as isize)),
            Some(op2.clone()),
        )
    };

    let first_user = if op1_first { &op1.user_id } else { &op2.user_id };
    Ok(outcome.with_details(json!({ "tieBreak": tie, "firstUser": first_user })))
}

pub fn insert_delete(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (
        OperationKind::Insert { content: inserted },
        OperationKind::Delete {
            length,
            content: removed,
        },
    ) = (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("insert-delete", op1, op2));
    };

    let p = op1.position.start;
    let (s, e) = checked_span(op2)?;
    let inserted_len = char_len(inserted);

    if p <= s {
        return Ok(RuleOutcome::new(
            Some(op1.clone()),
            Some(shift(op2, inserted_len as isize)),
        ));
    }

    if p >= e {
        return Ok(RuleOutcome::new(
            Some(shift(op1, back(*length))),
            Some(op2.clone()),
        ));
    }

    // Insert strictly inside the deleted window
    let k = p - s;
    let surround = |text: &str| {
        let mut out = char_slice(text, 0, k);
        out.push_str(inserted);
        out.push_str(&char_slice(text, k, char_len(text)));
        out
    };

    let insert_is_later = op1.timestamp > op2.timestamp;
    if let (true, Some(removed)) = (insert_is_later, removed) {
        if char_len(removed) == *length {
            let restored = op1.derive(
                Position::at(s),
                OperationKind::Insert {
                    content: surround(removed),
                },
            );
            return Ok(RuleOutcome::new(Some(restored), None)
                .with_confidence(0.9)
                .with_details(json!({ "resolution": "insert_preserved" })));
        }
    }

    let grown_length = length.saturating_add(inserted_len);
    let absorbing = op2.derive(
        Position::range(s, s.saturating_add(grown_length)),
        OperationKind::Delete {
            length: grown_length,
            content: removed.as_deref().map(surround),
        },
    );

    Ok(RuleOutcome::new(None, Some(absorbing))
        .with_confidence(0.9)
        .with_details(json!({ "resolution": "delete_absorbed_insert" })))
}

pub fn delete_insert(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    insert_delete(op2, op1).map(RuleOutcome::swapped)
}

/// Delete with `removed` characters taken out of `[cut_from, cut_to)` (relative to its own span)
fn trimmed_delete(
    op: &Operation,
    start: usize,
    length: usize,
    cut_from: usize,
    cut_to: usize,
) -> Option<Operation> {
    if length == 0 {
        return None;
    }

    let content = match &op.kind {
        OperationKind::Delete {
            content: Some(text),
            ..
        } => {
            let mut kept = char_slice(text, 0, cut_from);
            kept.push_str(&char_slice(text, cut_to, char_len(text)));
            Some(kept)
        }
        _ => None,
    };

    Some(op.derive(
        Position::range(start, start.saturating_add(length)),
        OperationKind::Delete { length, content },
    ))
}

pub fn delete_delete(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (OperationKind::Delete { length: n1, .. }, OperationKind::Delete { length: n2, .. }) =
        (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("delete-delete", op1, op2));
    };

    let (s1, e1) = checked_span(op1)?;
    let (s2, e2) = checked_span(op2)?;

    if e1 <= s2 {
        return Ok(RuleOutcome::new(
            Some(op1.clone()),
            Some(shift(op2, back(*n1))),
        ));
    }
    if e2 <= s1 {
        return Ok(RuleOutcome::new(
            Some(shift(op1, back(*n2))),
            Some(op2.clone()),
        ));
    }

    // Overlap: together they remove the merged span; each side removes what the other left
    let (lo, hi) = (s1.min(s2), e1.max(e2));
    let (overlap_from, overlap_to) = (s1.max(s2), e1.min(e2));
    let union = hi - lo;

    let op1_prime = trimmed_delete(op1, lo, union - n2, overlap_from - s1, overlap_to - s1);
    let op2_prime = trimmed_delete(op2, lo, union - n1, overlap_from - s2, overlap_to - s2);

    Ok(RuleOutcome::new(op1_prime, op2_prime)
        .with_details(json!({ "mergedRange": [lo, hi] })))
}

pub fn format_format(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (OperationKind::Format { attributes: a1 }, OperationKind::Format { attributes: a2 }) =
        (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("format-format", op1, op2));
    };

    let (s1, e1) = checked_span(op1)?;
    let (s2, e2) = checked_span(op2)?;
    if e1 <= s2 || e2 <= s1 {
        return independent(op1, op2);
    }

    let (older, newer) = if is_later(op1, op2) { (a2, a1) } else { (a1, a2) };
    let mut merged: Attributes = older.clone();
    let collisions: Vec<&String> = newer.keys().filter(|key| older.contains_key(*key)).collect();
    merged.extend(newer.iter().map(|(k, v)| (k.clone(), v.clone())));

    let confidence = if collisions.is_empty() { 1.0 } else { 0.9 };
    let overlap = [s1.max(s2), e1.min(e2)];
    let details = json!({
        "mergedAttributes": &merged,
        "collisions": collisions,
        "overlap": overlap,
    });

    // Partial overlaps keep their own ranges; the document orders the overlap by timestamp
    if (s1, e1) != (s2, e2) {
        return Ok(independent(op1, op2)?
            .with_confidence(confidence)
            .with_details(details));
    }

    let merged_kind = OperationKind::Format { attributes: merged };
    Ok(RuleOutcome::new(
        Some(op1.derive(op1.position, merged_kind.clone())),
        Some(op2.derive(op2.position, merged_kind)),
    )
    .with_confidence(confidence)
    .with_details(details))
}

/// Map a boundary through a delete of `[s, e)`
fn through_delete(offset: usize, s: usize, e: usize) -> usize {
    if offset <= s {
        offset
    } else if offset >= e {
        offset - (e - s)
    } else {
        s
    }
}

/// Rebuild a format or retain over a new range; empty ranges cancel the operation
fn reranged(op: &Operation, start: usize, end: usize) -> Option<Operation> {
    if end <= start {
        return None;
    }
    let kind = match &op.kind {
        OperationKind::Retain { .. } => OperationKind::Retain {
            length: end - start,
        },
        other => other.clone(),
    };
    Some(op.derive(Position::range(start, end), kind))
}

/// Text edit (insert/delete) against a range operation (format/retain) that does not change text
fn edit_vs_range(edit: &Operation, range: &Operation) -> Result<RuleOutcome, TransformError> {
    let (a, b) = checked_span(range)?;

    match &edit.kind {
        OperationKind::Insert { content } => {
            let p = edit.position.start;
            let len = char_len(content);
            let range_prime = if p <= a {
                reranged(range, a.saturating_add(len), b.saturating_add(len))
            } else if p < b {
                reranged(range, a, b.saturating_add(len))
            } else {
                Some(range.clone())
            };
            Ok(RuleOutcome::new(Some(edit.clone()), range_prime))
        }
        OperationKind::Delete { .. } => {
            let (s, e) = checked_span(edit)?;
            let range_prime = reranged(range, through_delete(a, s, e), through_delete(b, s, e));
            Ok(RuleOutcome::new(Some(edit.clone()), range_prime))
        }
        _ => Err(mismatch("edit-range", edit, range)),
    }
}

pub fn edit_range(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    edit_vs_range(op1, op2)
}

pub fn range_edit(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    edit_vs_range(op2, op1).map(RuleOutcome::swapped)
}

pub fn insert_replace(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (
        OperationKind::Insert { content: inserted },
        OperationKind::Replace {
            content,
            original_content,
        },
    ) = (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("insert-replace", op1, op2));
    };

    let p = op1.position.start;
    let (s, e) = checked_span(op2)?;
    let inserted_len = char_len(inserted);

    if p <= s {
        return Ok(RuleOutcome::new(
            Some(op1.clone()),
            Some(shift(op2, inserted_len as isize)),
        ));
    }
    if p >= e {
        return Ok(RuleOutcome::new(Some(shift(op1, op2.length_delta())), Some(op2.clone())));
    }

    // The replacement swallows text typed inside the range it replaces
    let k = p - s;
    let mut widened = char_slice(original_content, 0, k);
    widened.push_str(inserted);
    widened.push_str(&char_slice(original_content, k, char_len(original_content)));
    let end = s.saturating_add(char_len(&widened));

    let replace_prime = op2.derive(
        Position::range(s, end),
        OperationKind::Replace {
            content: content.clone(),
            original_content: widened,
        },
    );
    Ok(RuleOutcome::new(None, Some(replace_prime))
        .with_confidence(0.9)
        .with_details(json!({ "resolution": "replace_absorbed_insert" })))
}

pub fn replace_insert(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    insert_replace(op2, op1).map(RuleOutcome::swapped)
}

pub fn replace_replace(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (OperationKind::Replace { .. }, OperationKind::Replace { .. }) = (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("replace-replace", op1, op2));
    };
    overlapping_edits(op1, op2)
}

pub fn replace_delete(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    overlapping_edits(op1, op2)
}

pub fn delete_replace(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    overlapping_edits(op1, op2)
}

/// Range edits that rewrite text: disjoint ranges shift, overlapping ranges go to the later write
fn overlapping_edits(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (s1, e1) = checked_span(op1)?;
    let (s2, e2) = checked_span(op2)?;

    if e1 <= s2 {
        return Ok(RuleOutcome::new(
            Some(op1.clone()),
            Some(shift(op2, op1.length_delta())),
        ));
    }
    if e2 <= s1 {
        return Ok(RuleOutcome::new(
            Some(shift(op1, op2.length_delta())),
            Some(op2.clone()),
        ));
    }

    let op1_wins = is_later(op1, op2);
    let (winner, loser) = if op1_wins { (op1, op2) } else { (op2, op1) };

    let (winner_prime, confidence) = match (&winner.kind, &loser.kind) {
        (
            OperationKind::Replace { content, .. },
            OperationKind::Replace {
                content: loser_content,
                ..
            },
        ) if (s1, e1) == (s2, e2) => (
            winner.derive(
                Position::range(s1, s1.saturating_add(char_len(loser_content))),
                OperationKind::Replace {
                    content: content.clone(),
                    original_content: loser_content.clone(),
                },
            ),
            1.0,
        ),
        _ => (winner.clone(), 0.6),
    };

    let details = json!({ "winner": winner.id, "cancelled": loser.id });
    let outcome = if op1_wins {
        RuleOutcome::new(Some(winner_prime), None)
    } else {
        RuleOutcome::new(None, Some(winner_prime))
    };
    Ok(outcome.with_confidence(confidence).with_details(details))
}

pub fn move_move(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (
        OperationKind::Move {
            block_id: b1,
            to_index: t1,
            ..
        },
        OperationKind::Move {
            block_id: b2,
            to_index: t2,
            ..
        },
    ) = (&op1.kind, &op2.kind)
    else {
        return Err(mismatch("move-move", op1, op2));
    };

    if b1 != b2 {
        return independent(op1, op2);
    }

    // After the loser ran, the winner moves the block from where the loser left it
    let rebased = |winner: &Operation, from: usize, to: usize| {
        winner.derive(
            Position::at(from),
            OperationKind::Move {
                block_id: b1.clone(),
                from_index: from,
                to_index: to,
            },
        )
    };

    let outcome = if is_later(op1, op2) {
        RuleOutcome::new(Some(rebased(op1, *t2, *t1)), None)
    } else {
        RuleOutcome::new(None, Some(rebased(op2, *t1, *t2)))
    };
    Ok(outcome.with_details(json!({ "blockId": b1 })))
}

pub fn split_merge(op1: &Operation, op2: &Operation) -> Result<RuleOutcome, TransformError> {
    let (split, merge) = match (&op1.kind, &op2.kind) {
        (OperationKind::Split { .. }, OperationKind::Merge { .. }) => (op1, op2),
        (OperationKind::Merge { .. }, OperationKind::Split { .. }) => (op2, op1),
        _ => return Err(mismatch("split-merge", op1, op2)),
    };

    let (
        OperationKind::Split { block_id, .. },
        OperationKind::Merge {
            block_id: merge_target,
            merged_block_id,
            ..
        },
    ) = (&split.kind, &merge.kind)
    else {
        return Err(mismatch("split-merge", op1, op2));
    };

    if block_id != merge_target && block_id != merged_block_id {
        return independent(op1, op2);
    }

    let conflict = OperationConflict::new(
        ConflictType::StructuralConflict,
        ConflictSeverity::Critical,
        op1,
        Some(op2),
    )
    .with_strategy(ResolutionStrategy::Manual)
    .with_data(json!({ "blockId": block_id }));

    Ok(RuleOutcome::new(None, None)
        .with_confidence(0.0)
        .with_conflict(conflict)
        .with_details(json!({ "resolution": "both_cancelled", "blockId": block_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_insert_tie_is_symmetric() {
        let now = Utc::now();
        let a = Operation::insert("user1", 0, "Hello").with_timestamp(now);
        let b = Operation::insert("user2", 0, "World").with_timestamp(now);

        let ab = insert_insert(&a, &b).unwrap();
        let ba = insert_insert(&b, &a).unwrap();

        // user1 sorts first in both argument orders
        assert_eq!(ab.op1_prime.unwrap().position.start, 0);
        assert_eq!(ab.op2_prime.unwrap().position.start, 5);
        assert_eq!(ba.op1_prime.unwrap().position.start, 5);
        assert_eq!(ba.op2_prime.unwrap().position.start, 0);
    }

    #[test]
    fn test_insert_inside_later_delete_is_absorbed() {
        let now = Utc::now();
        let insert = Operation::insert("user1", 3, "XY").with_timestamp(now);
        let delete = Operation::delete("user2", 1, "bcde").with_timestamp(now + Duration::seconds(1));

        let outcome = insert_delete(&insert, &delete).unwrap();
        assert!(outcome.op1_prime.is_none());

        let grown = outcome.op2_prime.unwrap();
        assert_eq!(grown.position, Position::range(1, 7));
        assert_eq!(
            grown.kind,
            OperationKind::Delete {
                length: 6,
                content: Some("bcXYde".to_string())
            }
        );
    }

    #[test]
    fn test_later_insert_inside_delete_survives() {
        let now = Utc::now();
        let delete = Operation::delete("user2", 1, "bcde").with_timestamp(now);
        let insert = Operation::insert("user1", 3, "XY").with_timestamp(now + Duration::seconds(1));

        let outcome = insert_delete(&insert, &delete).unwrap();
        assert!(outcome.op2_prime.is_none());
        let restored = outcome.op1_prime.unwrap();
        assert_eq!(restored.position.start, 1);
        assert_eq!(
            restored.kind,
            OperationKind::Insert {
                content: "bcXYde".to_string()
            }
        );
    }

    #[test]
    fn test_delete_contained_in_other_is_absorbed() {
        let outer = Operation::delete("user1", 1, "bcde");
        let inner = Operation::delete("user2", 2, "cd");

        let outcome = delete_delete(&outer, &inner).unwrap();
        assert!(outcome.op2_prime.is_none());
        let remaining = outcome.op1_prime.unwrap();
        assert_eq!(remaining.position.start, 1);
        assert_eq!(
            remaining.kind,
            OperationKind::Delete {
                length: 2,
                content: Some("be".to_string())
            }
        );
    }

    #[test]
    fn test_move_same_block_later_wins() {
        let now = Utc::now();
        let early = Operation::move_block("user1", "p1", 0, 2).with_timestamp(now);
        let late = Operation::move_block("user2", "p1", 0, 1).with_timestamp(now + Duration::seconds(1));

        let outcome = move_move(&early, &late).unwrap();
        assert!(outcome.op1_prime.is_none());
        let winner = outcome.op2_prime.unwrap();
        assert_eq!(
            winner.kind,
            OperationKind::Move {
                block_id: "p1".to_string(),
                from_index: 2,
                to_index: 1
            }
        );
    }

    #[test]
    fn test_split_merge_same_block_cancels_both() {
        let split = Operation::split("user1", "p1", "p1b", 4);
        let merge = Operation::merge("user2", "p1", "p2", 10);

        let outcome = split_merge(&split, &merge).unwrap();
        assert!(outcome.op1_prime.is_none());
        assert!(outcome.op2_prime.is_none());
        assert_eq!(outcome.conflicts[0].severity, ConflictSeverity::Critical);
        assert_eq!(outcome.conflicts[0].conflict_type, ConflictType::StructuralConflict);
    }

    #[test]
    fn test_partially_overlapping_formats_keep_their_own_ranges() {
        let now = Utc::now();
        let mut bold = Attributes::new();
        bold.insert("bold".to_string(), json!(true));
        let mut italic = Attributes::new();
        italic.insert("italic".to_string(), json!(true));
        let early = Operation::format("user1", 0, 5, bold.clone()).with_timestamp(now);
        let late = Operation::format("user2", 3, 8, italic.clone()).with_timestamp(now + Duration::seconds(1));

        let outcome = format_format(&early, &late).unwrap();
        let early_prime = outcome.op1_prime.unwrap();
        let late_prime = outcome.op2_prime.unwrap();
        assert_eq!(early_prime.position, Position::range(0, 5));
        assert_eq!(early_prime.kind, OperationKind::Format { attributes: bold });
        assert_eq!(late_prime.position, Position::range(3, 8));
        assert_eq!(late_prime.kind, OperationKind::Format { attributes: italic });
        assert_eq!(outcome.details["overlap"], json!([3, 5]));
    }

    #[test]
    fn test_overflowing_range_is_an_error() {
        let insert = Operation::insert("user1", 0, "x");
        let delete = Operation::delete_len("user2", usize::MAX, 1);
        assert!(matches!(
            insert_delete(&insert, &delete),
            Err(TransformError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_mismatched_payload_is_an_error() {
        let insert = Operation::insert("user1", 0, "a");
        let format = Operation::format("user2", 0, 1, Attributes::new());
        assert!(matches!(
            delete_delete(&insert, &format),
            Err(TransformError::PayloadMismatch { .. })
        ));
    }
}
