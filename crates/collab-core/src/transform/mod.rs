/// Operational transform engine.
///
/// Rules are looked up by the ordered pair of operation types. Pairs without a
/// registered rule fall back to an identity transform with reduced confidence.
use std::collections::HashMap;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    CollaborationError, ConflictSeverity, ConflictType, Operation, OperationConflict, OperationId,
    OperationKind, OperationType, Position, ResolutionStrategy, Result,
};

mod detectors;
pub mod rules;

pub use detectors::{
    ConcurrentEditDetector, ConflictDetector, ContentOverlapDetector, FormatConflictDetector,
};
pub use rules::{RuleOutcome, TransformError, TransformRule};

const FALLBACK_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformMetadata {
    /// `"<op1 type>-<op2 type>"`
    pub rule: String,

    /// No rule was registered for the pair; both operations passed through unchanged
    pub fallback: bool,

    /// Rule-specific notes such as merged ranges or tie-break decisions
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    /// op1 rewritten to apply after op2, `None` when cancelled
    pub op1_prime: Option<Operation>,

    /// op2 rewritten to apply after op1, `None` when cancelled
    pub op2_prime: Option<Operation>,

    pub conflicts: Vec<OperationConflict>,
    pub confidence: f32,
    pub metadata: TransformMetadata,
}

/// Outcome of transforming one operation against a sequence of concurrent ones
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    pub operation: Option<Operation>,
    pub conflicts: Vec<OperationConflict>,

    /// Lowest confidence among the pairwise transforms
    pub confidence: f32,
}

pub struct OperationalTransformEngine {
    rules: HashMap<(OperationType, OperationType), TransformRule>,
    detectors: Vec<Box<dyn ConflictDetector>>,
    compose_window: Duration,
}

impl Default for OperationalTransformEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationalTransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationalTransformEngine")
            .field("rules", &self.rules.len())
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("compose_window", &self.compose_window)
            .finish()
    }
}

pub fn rule_key(op1: OperationType, op2: OperationType) -> String {
    format!("{}-{}", op1, op2)
}

impl OperationalTransformEngine {
    /// Engine with the built-in rules and detectors
    pub fn new() -> Self {
        use OperationType::*;

        let mut engine = Self {
            rules: HashMap::new(),
            detectors: detectors::default_detectors(),
            compose_window: Duration::milliseconds(1000),
        };

        engine.register_rule(Insert, Insert, rules::insert_insert);
        engine.register_rule(Insert, Delete, rules::insert_delete);
        engine.register_rule(Delete, Insert, rules::delete_insert);
        engine.register_rule(Delete, Delete, rules::delete_delete);
        engine.register_rule(Format, Format, rules::format_format);
        engine.register_rule(Move, Move, rules::move_move);
        engine.register_rule(Replace, Replace, rules::replace_replace);
        engine.register_rule(Split, Merge, rules::split_merge);
        engine.register_rule(Merge, Split, rules::split_merge);

        // Text edits against ranges that only annotate text
        for range in [Format, Retain] {
            for edit in [Insert, Delete] {
                engine.register_rule(edit, range, rules::edit_range);
                engine.register_rule(range, edit, rules::range_edit);
            }
        }
        engine.register_rule(Insert, Replace, rules::insert_replace);
        engine.register_rule(Replace, Insert, rules::replace_insert);
        engine.register_rule(Delete, Replace, rules::delete_replace);
        engine.register_rule(Replace, Delete, rules::replace_delete);
        engine.register_rule(Retain, Retain, rules::independent);

        // Structure and locks never move text offsets
        let text = [Insert, Delete, Retain, Format, Replace];
        let structural = [Move, Split, Merge];
        for s in structural {
            for t in text {
                engine.register_rule(s, t, rules::independent);
                engine.register_rule(t, s, rules::independent);
            }
        }
        let all = [
            Insert, Delete, Retain, Format, Move, Replace, Split, Merge, Lock, Unlock,
        ];
        for lock in [Lock, Unlock] {
            for other in all {
                engine.register_rule(lock, other, rules::independent);
                engine.register_rule(other, lock, rules::independent);
            }
        }

        engine
    }

    pub fn with_compose_window(mut self, window: Duration) -> Self {
        self.compose_window = window;
        self
    }

    /// Register or replace the rule for an ordered pair of operation types
    pub fn register_rule(&mut self, op1: OperationType, op2: OperationType, rule: TransformRule) {
        self.rules.insert((op1, op2), rule);
    }

    pub fn register_detector(&mut self, detector: Box<dyn ConflictDetector>) {
        self.detectors.push(detector);
    }

    pub fn has_rule(&self, op1: OperationType, op2: OperationType) -> bool {
        self.rules.contains_key(&(op1, op2))
    }

    /// Transform two concurrent operations authored against the same state
    pub fn transform(&self, op1: &Operation, op2: &Operation) -> TransformResult {
        let key = rule_key(op1.op_type(), op2.op_type());

        let mut result = match self.rules.get(&(op1.op_type(), op2.op_type())) {
            Some(rule) => match rule(op1, op2) {
                Ok(outcome) => TransformResult {
                    op1_prime: outcome.op1_prime,
                    op2_prime: outcome.op2_prime,
                    conflicts: outcome.conflicts,
                    confidence: outcome.confidence,
                    metadata: TransformMetadata {
                        rule: key,
                        fallback: false,
                        details: outcome.details,
                    },
                },
                Err(err) => {
                    warn!("Transform rule {} failed for {}: {}", key, op1.id, err);
                    return self.failed(op1, op2, key, err);
                }
            },
            None => {
                warn!("No transform rule for {}, passing operations through", key);
                TransformResult {
                    op1_prime: Some(op1.clone()),
                    op2_prime: Some(op2.clone()),
                    conflicts: Vec::new(),
                    confidence: FALLBACK_CONFIDENCE,
                    metadata: TransformMetadata {
                        rule: key,
                        fallback: true,
                        details: serde_json::Value::Null,
                    },
                }
            }
        };

        let detected: Vec<OperationConflict> = self
            .detectors
            .iter()
            .filter_map(|detector| detector.detect(op1, op2, &result))
            .collect();
        for conflict in &detected {
            debug!(
                "Detected {:?} ({:?}) between {} and {}",
                conflict.conflict_type, conflict.severity, op1.id, op2.id
            );
        }
        result.conflicts.extend(detected);

        result
    }

    fn failed(
        &self,
        op1: &Operation,
        op2: &Operation,
        rule: String,
        err: TransformError,
    ) -> TransformResult {
        let conflict = OperationConflict::new(
            ConflictType::TransformFailure,
            ConflictSeverity::Critical,
            op1,
            Some(op2),
        )
        .with_strategy(ResolutionStrategy::Manual)
        .with_data(json!({ "rule": rule, "error": err.to_string() }));

        TransformResult {
            op1_prime: None,
            op2_prime: Some(op2.clone()),
            conflicts: vec![conflict],
            confidence: 0.0,
            metadata: TransformMetadata {
                rule,
                fallback: false,
                details: json!({ "error": err.to_string() }),
            },
        }
    }

    /// Transform `op` so it applies after every operation in `concurrent`, in order
    pub fn integrate(&self, op: &Operation, concurrent: &[Operation]) -> Integration {
        let mut current = op.clone();
        let mut conflicts = Vec::new();
        let mut confidence = 1.0_f32;

        for other in concurrent {
            let result = self.transform(&current, other);
            confidence = confidence.min(result.confidence);
            conflicts.extend(result.conflicts);

            match result.op1_prime {
                Some(next) => current = next,
                None => {
                    debug!("Operation {} cancelled by {}", op.id, other.id);
                    return Integration {
                        operation: None,
                        conflicts,
                        confidence,
                    };
                }
            }
        }

        Integration {
            operation: Some(current),
            conflicts,
            confidence,
        }
    }

    /// `op` rewritten to apply after `concurrent`, or `None` when it was cancelled
    pub fn transform_against(&self, op: &Operation, concurrent: &[Operation]) -> Option<Operation> {
        self.integrate(op, concurrent).operation
    }

    /// Whether `op2` continues `op1` closely enough to fold into a single history entry
    pub fn can_compose(&self, op1: &Operation, op2: &Operation) -> bool {
        if op1.user_id != op2.user_id || op1.op_type() != op2.op_type() {
            return false;
        }
        if op1.is_structural() {
            return false;
        }
        let gap = op2.timestamp - op1.timestamp;
        if gap < Duration::zero() || gap >= self.compose_window {
            return false;
        }

        let (s1, e1) = op1.span();
        let (s2, e2) = op2.span();
        match (&op1.kind, &op2.kind) {
            (OperationKind::Insert { content }, OperationKind::Insert { .. }) => {
                let typed_end = s1 + content.chars().count();
                s1 <= s2 && s2 <= typed_end
            }
            (OperationKind::Delete { .. }, OperationKind::Delete { .. }) => e2 == s1 || s2 == s1,
            (OperationKind::Retain { .. }, OperationKind::Retain { .. }) => s2 == e1,
            (OperationKind::Format { .. }, OperationKind::Format { .. }) => (s1, e1) == (s2, e2),
            _ => false,
        }
    }

    /// Fold `op2` into `op1`. The result keeps op1's identity and op2's timestamp.
    pub fn compose(&self, op1: &Operation, op2: &Operation) -> Result<Operation> {
        if !self.can_compose(op1, op2) {
            return Err(CollaborationError::Compose(format!(
                "{} ({}) does not continue {} ({})",
                op2.id,
                op2.op_type(),
                op1.id,
                op1.op_type()
            )));
        }

        let (s1, e1) = op1.span();
        let (s2, _) = op2.span();

        let (position, kind) = match (&op1.kind, &op2.kind) {
            (OperationKind::Insert { content: c1 }, OperationKind::Insert { content: c2 }) => {
                let split = s2 - s1;
                let mut content: String = c1.chars().take(split).collect();
                content.push_str(c2);
                content.extend(c1.chars().skip(split));
                (Position::at(s1), OperationKind::Insert { content })
            }

            (
                OperationKind::Delete {
                    length: n1,
                    content: c1,
                },
                OperationKind::Delete {
                    length: n2,
                    content: c2,
                },
            ) => {
                let backspace = s2 != s1;
                let start = if backspace { s2 } else { s1 };
                let content = match (c1, c2) {
                    (Some(c1), Some(c2)) if backspace => Some(format!("{}{}", c2, c1)),
                    (Some(c1), Some(c2)) => Some(format!("{}{}", c1, c2)),
                    _ => None,
                };
                let length = n1.saturating_add(*n2);
                (
                    Position::range(start, start.saturating_add(length)),
                    OperationKind::Delete { length, content },
                )
            }

            (OperationKind::Retain { length: n1 }, OperationKind::Retain { length: n2 }) => {
                let length = n1.saturating_add(*n2);
                (
                    Position::range(s1, s1.saturating_add(length)),
                    OperationKind::Retain { length },
                )
            }

            (OperationKind::Format { attributes: a1 }, OperationKind::Format { attributes: a2 }) => {
                let mut attributes = a1.clone();
                attributes.extend(a2.iter().map(|(k, v)| (k.clone(), v.clone())));
                (Position::range(s1, e1), OperationKind::Format { attributes })
            }

            _ => {
                return Err(CollaborationError::Compose(format!(
                    "{} operations do not compose",
                    op1.op_type()
                )))
            }
        };

        let mut composed = op1.derive(position, kind);
        composed.timestamp = op2.timestamp;
        Ok(composed)
    }

    /// Operation that undoes `op`.
    ///
    /// A delete that did not record its removed text inverts to an empty insert.
    pub fn invert(&self, op: &Operation) -> Operation {
        let start = op.position.start;

        let (position, kind) = match &op.kind {
            OperationKind::Insert { content } => {
                let length = content.chars().count();
                (
                    Position::range(start, start.saturating_add(length)),
                    OperationKind::Delete {
                        length,
                        content: Some(content.clone()),
                    },
                )
            }

            OperationKind::Delete { content, .. } => (
                Position::at(start),
                OperationKind::Insert {
                    content: content.clone().unwrap_or_default(),
                },
            ),

            OperationKind::Retain { .. } => (op.position, op.kind.clone()),

            OperationKind::Format { attributes } => {
                let attributes = attributes
                    .iter()
                    .map(|(key, value)| {
                        let inverse = match value {
                            serde_json::Value::Bool(flag) => serde_json::Value::Bool(!flag),
                            _ => serde_json::Value::Null,
                        };
                        (key.clone(), inverse)
                    })
                    .collect();
                (op.position, OperationKind::Format { attributes })
            }

            OperationKind::Replace {
                content,
                original_content,
            } => (
                Position::range(start, start.saturating_add(content.chars().count())),
                OperationKind::Replace {
                    content: original_content.clone(),
                    original_content: content.clone(),
                },
            ),

            OperationKind::Move {
                block_id,
                from_index,
                to_index,
            } => (
                Position::at(*to_index),
                OperationKind::Move {
                    block_id: block_id.clone(),
                    from_index: *to_index,
                    to_index: *from_index,
                },
            ),

            OperationKind::Split {
                block_id,
                new_block_id,
                offset,
            } => (
                op.position,
                OperationKind::Merge {
                    block_id: block_id.clone(),
                    merged_block_id: new_block_id.clone(),
                    offset: *offset,
                },
            ),

            OperationKind::Merge {
                block_id,
                merged_block_id,
                offset,
            } => (
                op.position,
                OperationKind::Split {
                    block_id: block_id.clone(),
                    new_block_id: merged_block_id.clone(),
                    offset: *offset,
                },
            ),

            OperationKind::Lock {
                block_id,
                lock_type,
            } => (
                op.position,
                OperationKind::Unlock {
                    block_id: block_id.clone(),
                    lock_type: *lock_type,
                },
            ),

            OperationKind::Unlock {
                block_id,
                lock_type,
            } => (
                op.position,
                OperationKind::Lock {
                    block_id: block_id.clone(),
                    lock_type: *lock_type,
                },
            ),
        };

        let mut inverse = op.derive(position, kind);
        inverse.id = OperationId::new();
        inverse.timestamp = Utc::now();
        inverse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, CollaborativeDocument};

    fn apply_all(text: &str, ops: &[Option<Operation>]) -> String {
        let mut doc = CollaborativeDocument::from_text(text);
        for op in ops.iter().flatten() {
            doc.apply(op, Utc::now()).unwrap();
        }
        doc.text().to_string()
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let engine = OperationalTransformEngine::new();
        let now = Utc::now();
        let op1 = Operation::insert("user1", 0, "Hello").with_timestamp(now);
        let op2 = Operation::insert("user2", 0, "World").with_timestamp(now);

        let result = engine.transform(&op1, &op2);
        let left = apply_all("", &[Some(op1.clone()), result.op2_prime.clone()]);
        let right = apply_all("", &[Some(op2.clone()), result.op1_prime.clone()]);

        assert_eq!(left, "HelloWorld");
        assert_eq!(left, right);
        assert_eq!(result.metadata.rule, "insert-insert");
        assert!(result
            .conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::ConcurrentEdit));
    }

    #[test]
    fn test_overlapping_deletes_converge() {
        let engine = OperationalTransformEngine::new();
        let op1 = Operation::delete("user1", 1, "bc");
        let op2 = Operation::delete("user2", 2, "cde");

        let result = engine.transform(&op1, &op2);
        let left = apply_all("abcdef", &[Some(op1.clone()), result.op2_prime.clone()]);
        let right = apply_all("abcdef", &[Some(op2.clone()), result.op1_prime.clone()]);

        assert_eq!(left, "af");
        assert_eq!(right, "af");
        assert_eq!(result.metadata.details["mergedRange"], json!([1, 5]));
    }

    #[test]
    fn test_insert_inside_delete_raises_content_overlap() {
        let engine = OperationalTransformEngine::new();
        let now = Utc::now();
        let insert = Operation::insert("user1", 3, "XY").with_timestamp(now);
        let delete =
            Operation::delete("user2", 1, "bcde").with_timestamp(now + Duration::milliseconds(5));

        let result = engine.transform(&insert, &delete);
        let left = apply_all("abcdefg", &[Some(insert.clone()), result.op2_prime.clone()]);
        let right = apply_all("abcdefg", &[Some(delete.clone()), result.op1_prime.clone()]);

        assert_eq!(left, right);
        let overlap = result
            .conflicts
            .iter()
            .find(|c| c.conflict_type == ConflictType::ContentOverlap)
            .unwrap();
        assert_eq!(overlap.severity, ConflictSeverity::High);
    }

    #[test]
    fn test_missing_rule_falls_back_to_identity() {
        let mut engine = OperationalTransformEngine::new();
        engine.rules.remove(&(OperationType::Split, OperationType::Split));

        let op1 = Operation::split("user1", "p1", "p1b", 2);
        let op2 = Operation::split("user2", "p2", "p2b", 3);
        let result = engine.transform(&op1, &op2);

        assert!(result.metadata.fallback);
        assert_eq!(result.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(result.op1_prime, Some(op1));
        assert_eq!(result.op2_prime, Some(op2));
    }

    #[test]
    fn test_failed_rule_becomes_critical_conflict() {
        let engine = OperationalTransformEngine::new();
        let mut bad = Operation::format("user1", 5, 5, Attributes::new());
        bad.position.end = Some(2);
        let other = Operation::format("user2", 0, 3, Attributes::new());

        let result = engine.transform(&bad, &other);
        assert!(result.op1_prime.is_none());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::TransformFailure);
        assert_eq!(result.conflicts[0].severity, ConflictSeverity::Critical);
    }

    #[test]
    fn test_compose_typing_run() {
        let engine = OperationalTransformEngine::new();
        let now = Utc::now();
        let first = Operation::insert("a", 4, "he").with_timestamp(now);
        let second = Operation::insert("a", 6, "llo").with_timestamp(now + Duration::milliseconds(200));
        let late = Operation::insert("a", 9, "!").with_timestamp(now + Duration::seconds(5));

        assert!(engine.can_compose(&first, &second));
        assert!(!engine.can_compose(&second, &late));
        assert!(!engine.can_compose(&first, &Operation::insert("b", 6, "x").with_timestamp(now)));

        let composed = engine.compose(&first, &second).unwrap();
        assert_eq!(composed.id, first.id);
        assert_eq!(
            composed.kind,
            OperationKind::Insert {
                content: "hello".to_string()
            }
        );
        assert!(engine.compose(&second, &late).is_err());
    }

    #[test]
    fn test_compose_backspace_run() {
        let engine = OperationalTransformEngine::new();
        let now = Utc::now();
        let first = Operation::delete("a", 4, "o").with_timestamp(now);
        let second = Operation::delete("a", 3, "l").with_timestamp(now + Duration::milliseconds(100));

        let composed = engine.compose(&first, &second).unwrap();
        assert_eq!(composed.position.start, 3);
        assert_eq!(
            composed.kind,
            OperationKind::Delete {
                length: 2,
                content: Some("lo".to_string())
            }
        );
    }

    #[test]
    fn test_invert_restores_text() {
        let engine = OperationalTransformEngine::new();
        let now = Utc::now();
        let ops = [
            Operation::insert("a", 2, "XYZ"),
            Operation::delete("a", 1, "bcd"),
            Operation::replace("a", 0, "abc", "Q"),
        ];

        for op in ops {
            let mut doc = CollaborativeDocument::from_text("abcdefg");
            doc.apply(&op, now).unwrap();
            doc.apply(&engine.invert(&op), now).unwrap();
            assert_eq!(doc.text(), "abcdefg", "inverse of {} failed", op.op_type());
        }
    }

    #[test]
    fn test_invert_structural_and_format() {
        let engine = OperationalTransformEngine::new();

        let split = Operation::split("a", "p1", "p1b", 4);
        assert_eq!(engine.invert(&split).op_type(), OperationType::Merge);

        let mut attributes = Attributes::new();
        attributes.insert("bold".to_string(), json!(true));
        attributes.insert("color".to_string(), json!("red"));
        let format = Operation::format("a", 0, 3, attributes);
        let OperationKind::Format { attributes } = engine.invert(&format).kind else {
            panic!("expected format");
        };
        assert_eq!(attributes["bold"], json!(false));
        assert_eq!(attributes["color"], serde_json::Value::Null);
    }
}
