/// Conflict detection results and resolution for collaborative editing
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Operation, OperationId, UserId};

/// Unique conflict identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Two users edited overlapping text at the same instant
    ConcurrentEdit,

    /// An insert landed inside a concurrently deleted range
    ContentOverlap,

    /// Two formats set the same attribute on overlapping text
    FormatConflict,

    /// The operation was authored against a version the session never reached
    VersionMismatch,

    /// Structural edits on the same block that cannot both apply
    StructuralConflict,

    /// A transform rule failed
    TransformFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the outcome the transform rule already produced
    OperationalTransform,

    /// Last Write Wins - the operation with the later timestamp prevails
    LastWriteWins,

    /// User Priority - prefer operations from specific users
    UserPriority,

    /// Manual - require manual resolution
    Manual,
}

/// Represents a conflict between two operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConflict {
    pub id: ConflictId,

    /// The operation being integrated when the conflict was found
    pub conflicting_operation: Operation,

    /// The concurrent operation it collided with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_operation: Option<Operation>,

    #[serde(rename = "type")]
    pub conflict_type: ConflictType,

    pub severity: ConflictSeverity,

    pub strategy: ResolutionStrategy,

    #[serde(default)]
    pub data: serde_json::Value,

    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
}

impl OperationConflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        conflicting_operation: &Operation,
        other_operation: Option<&Operation>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            conflicting_operation: conflicting_operation.clone(),
            other_operation: other_operation.cloned(),
            conflict_type,
            severity,
            strategy: ResolutionStrategy::OperationalTransform,
            data: serde_json::Value::Null,
            detected_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Per-session conflict handling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictResolutionPolicy {
    pub default_strategy: ResolutionStrategy,

    /// Severities that are never auto-resolved
    pub requires_manual_review: BTreeSet<ConflictSeverity>,

    /// Users in descending priority, consulted by `UserPriority`
    pub priority_users: Vec<UserId>,
}

impl Default for ConflictResolutionPolicy {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::OperationalTransform,
            requires_manual_review: BTreeSet::from([ConflictSeverity::Critical]),
            priority_users: Vec::new(),
        }
    }
}

impl ConflictResolutionPolicy {
    pub fn needs_manual_review(&self, severity: ConflictSeverity) -> bool {
        self.default_strategy == ResolutionStrategy::Manual
            || self.requires_manual_review.contains(&severity)
    }
}

/// Result of conflict resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Resolved automatically; `winner` names the prevailing operation when one was chosen
    Resolved {
        strategy: ResolutionStrategy,
        winner: Option<OperationId>,
    },

    /// Requires manual resolution
    Deferred,
}

/// Decision supplied through the manual resolution path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualResolution {
    /// Keep the document as it currently is
    Accept,

    /// Apply a replacement operation authored by the resolver
    Override { operation: Operation },
}

/// Conflict resolver
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict under a policy, or defer it for manual review
    pub fn resolve(
        &self,
        conflict: &OperationConflict,
        policy: &ConflictResolutionPolicy,
    ) -> ResolutionOutcome {
        if policy.needs_manual_review(conflict.severity) {
            return ResolutionOutcome::Deferred;
        }

        match policy.default_strategy {
            ResolutionStrategy::OperationalTransform => ResolutionOutcome::Resolved {
                strategy: ResolutionStrategy::OperationalTransform,
                winner: None,
            },
            ResolutionStrategy::LastWriteWins => ResolutionOutcome::Resolved {
                strategy: ResolutionStrategy::LastWriteWins,
                winner: Some(self.last_write_winner(conflict).clone()),
            },
            ResolutionStrategy::UserPriority => ResolutionOutcome::Resolved {
                strategy: ResolutionStrategy::UserPriority,
                winner: Some(self.user_priority_winner(conflict, policy).clone()),
            },
            ResolutionStrategy::Manual => ResolutionOutcome::Deferred,
        }
    }

    /// Later timestamp wins; ties go to the operation being integrated
    fn last_write_winner<'a>(&self, conflict: &'a OperationConflict) -> &'a OperationId {
        let incoming = &conflict.conflicting_operation;
        match &conflict.other_operation {
            Some(other) if other.timestamp > incoming.timestamp => &other.id,
            _ => &incoming.id,
        }
    }

    fn user_priority_winner<'a>(
        &self,
        conflict: &'a OperationConflict,
        policy: &ConflictResolutionPolicy,
    ) -> &'a OperationId {
        let Some(other) = &conflict.other_operation else {
            return &conflict.conflicting_operation.id;
        };

        let rank = |user: &UserId| policy.priority_users.iter().position(|u| u == user);
        match (
            rank(&conflict.conflicting_operation.user_id),
            rank(&other.user_id),
        ) {
            (Some(p1), Some(p2)) if p2 < p1 => &other.id,
            (Some(_), _) => &conflict.conflicting_operation.id,
            (None, Some(_)) => &other.id,
            (None, None) => self.last_write_winner(conflict),
        }
    }
}
