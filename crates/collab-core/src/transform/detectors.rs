/// Conflict detectors run after every pairwise transform
use serde_json::json;

use crate::{ConflictSeverity, ConflictType, Operation, OperationConflict, OperationKind};

use super::TransformResult;

/// Inspects a transformed pair and reports a conflict when it recognises one
pub trait ConflictDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        op1: &Operation,
        op2: &Operation,
        result: &TransformResult,
    ) -> Option<OperationConflict>;
}

/// Whether two pre-state spans touch. Zero-width spans (inserts) touch anything they sit on.
fn spans_touch((a1, b1): (usize, usize), (a2, b2): (usize, usize)) -> bool {
    match (a1 == b1, a2 == b2) {
        (true, true) => a1 == a2,
        (true, false) => a2 <= a1 && a1 <= b2,
        (false, true) => a1 <= a2 && a2 <= b1,
        (false, false) => a1 < b2 && a2 < b1,
    }
}

/// Same timestamp, different authors, overlapping ranges
#[derive(Debug, Default)]
pub struct ConcurrentEditDetector;

impl ConflictDetector for ConcurrentEditDetector {
    fn name(&self) -> &'static str {
        "concurrent_edit"
    }

    fn detect(
        &self,
        op1: &Operation,
        op2: &Operation,
        _result: &TransformResult,
    ) -> Option<OperationConflict> {
        if op1.timestamp != op2.timestamp || op1.user_id == op2.user_id {
            return None;
        }
        if op1.is_structural() || op2.is_structural() || !spans_touch(op1.span(), op2.span()) {
            return None;
        }

        Some(
            OperationConflict::new(
                ConflictType::ConcurrentEdit,
                ConflictSeverity::Medium,
                op1,
                Some(op2),
            )
            .with_data(json!({ "range": [op1.span(), op2.span()] })),
        )
    }
}

/// An insert placed strictly inside a concurrent delete on the same block
#[derive(Debug, Default)]
pub struct ContentOverlapDetector;

impl ConflictDetector for ContentOverlapDetector {
    fn name(&self) -> &'static str {
        "content_overlap"
    }

    fn detect(
        &self,
        op1: &Operation,
        op2: &Operation,
        result: &TransformResult,
    ) -> Option<OperationConflict> {
        let (insert, delete) = match (&op1.kind, &op2.kind) {
            (OperationKind::Insert { .. }, OperationKind::Delete { .. }) => (op1, op2),
            (OperationKind::Delete { .. }, OperationKind::Insert { .. }) => (op2, op1),
            _ => return None,
        };
        if insert.block_id() != delete.block_id() {
            return None;
        }

        let p = insert.position.start;
        let (s, e) = delete.span();
        if !(s < p && p < e) {
            return None;
        }

        Some(
            OperationConflict::new(
                ConflictType::ContentOverlap,
                ConflictSeverity::High,
                op1,
                Some(op2),
            )
            .with_data(json!({
                "insertAt": p,
                "deleteRange": [s, e],
                "resolution": result.metadata.details.get("resolution"),
            })),
        )
    }
}

/// Two formats on overlapping ranges setting the same attribute key
#[derive(Debug, Default)]
pub struct FormatConflictDetector;

impl ConflictDetector for FormatConflictDetector {
    fn name(&self) -> &'static str {
        "format_conflict"
    }

    fn detect(
        &self,
        op1: &Operation,
        op2: &Operation,
        _result: &TransformResult,
    ) -> Option<OperationConflict> {
        let (OperationKind::Format { attributes: a1 }, OperationKind::Format { attributes: a2 }) =
            (&op1.kind, &op2.kind)
        else {
            return None;
        };
        if !spans_touch(op1.span(), op2.span()) {
            return None;
        }

        let keys: Vec<&String> = a1.keys().filter(|key| a2.contains_key(*key)).collect();
        if keys.is_empty() {
            return None;
        }

        Some(
            OperationConflict::new(
                ConflictType::FormatConflict,
                ConflictSeverity::Low,
                op1,
                Some(op2),
            )
            .with_data(json!({ "keys": keys })),
        )
    }
}

pub fn default_detectors() -> Vec<Box<dyn ConflictDetector>> {
    vec![
        Box::new(ConcurrentEditDetector),
        Box::new(ContentOverlapDetector),
        Box::new(FormatConflictDetector),
    ]
}
