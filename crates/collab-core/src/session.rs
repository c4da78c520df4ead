/// A single collaborative editing session.
/// All state changes go through here; the registry runs one of these per actor task.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    color_for_index, AppliedOperation, CollaborationConfig, CollaborationError, CollaborationEvent,
    CollaborativeDocument, ConflictId, ConflictResolutionPolicy, ConflictResolver,
    ConflictSeverity, ConflictType, ContentLock, Cursor, CursorManager, DocumentId, LockAction,
    LockId, LockManager, LockRequest, LockType, ManualResolution, Operation, OperationConflict,
    OperationKind, OperationLog, OperationType, OperationalTransformEngine,
    Participant, ResolutionOutcome, ResolutionStrategy, Result, Selection, SessionAnalytics,
    SessionId, User, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for the next tick
    Pending,

    /// Committed at this session version
    Applied { version: u64 },
}

/// Entry of the session's sync queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub operation: Operation,
    pub status: QueueStatus,
}

impl QueuedOperation {
    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }
}

/// Outcome of submitting an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,

    /// The operation as committed (transformed), or as submitted when rejected
    pub operation: Option<Operation>,

    /// Document after the commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<CollaborativeDocument>,

    pub conflicts: Vec<OperationConflict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Session version after the call
    pub version: u64,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub document_id: DocumentId,
    pub participants: Vec<Participant>,
    pub document: CollaborativeDocument,
    pub version: u64,
    pub locks: Vec<ContentLock>,
    pub conflict_resolution_policy: ConflictResolutionPolicy,
    pub is_active: bool,
    pub pending_conflicts: Vec<OperationConflict>,
    pub history_length: usize,
    pub queue_length: usize,
    pub created_at: DateTime<Utc>,
}

/// What a tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub applied: usize,
    pub rejected: usize,
    pub expired_locks: usize,
    pub went_inactive: usize,
}

pub struct CollaborationSession {
    id: SessionId,
    document_id: DocumentId,
    participants: Vec<Participant>,
    document: CollaborativeDocument,
    history: OperationLog,
    queue: VecDeque<QueuedOperation>,
    locks: LockManager,
    version: u64,
    policy: ConflictResolutionPolicy,
    is_active: bool,
    pending_conflicts: Vec<OperationConflict>,
    conflict_log: Vec<OperationConflict>,
    created_at: DateTime<Utc>,
    config: CollaborationConfig,
    engine: Arc<OperationalTransformEngine>,
    cursors: CursorManager,
    resolver: ConflictResolver,
    outbox: Vec<CollaborationEvent>,
}

impl CollaborationSession {
    pub fn new(
        document_id: DocumentId,
        document: CollaborativeDocument,
        config: CollaborationConfig,
        engine: Arc<OperationalTransformEngine>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            document_id,
            participants: Vec::new(),
            version: document.version,
            document,
            history: OperationLog::new(),
            queue: VecDeque::new(),
            locks: LockManager::new(),
            policy: config.conflict_policy.clone(),
            is_active: true,
            pending_conflicts: Vec::new(),
            conflict_log: Vec::new(),
            created_at: now,
            config,
            engine,
            cursors: CursorManager::new(),
            resolver: ConflictResolver::new(),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn document(&self) -> &CollaborativeDocument {
        &self.document
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }

    fn participant_mut(&mut self, user_id: &UserId) -> Result<&mut Participant> {
        let session_id = self.id;
        self.participants
            .iter_mut()
            .find(|p| p.user_id == *user_id)
            .ok_or_else(|| {
                CollaborationError::InvalidOperation(format!(
                    "{} is not a participant of session {}",
                    user_id, session_id
                ))
            })
    }

    /// Cursors of active participants
    pub fn cursors(&self) -> Vec<Cursor> {
        self.participants
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.cursor.clone())
            .collect()
    }

    pub fn selections(&self) -> Vec<Selection> {
        self.participants
            .iter()
            .filter_map(|p| p.selection.clone())
            .collect()
    }

    pub fn history(&self) -> &OperationLog {
        &self.history
    }

    pub fn queue(&self) -> &VecDeque<QueuedOperation> {
        &self.queue
    }

    pub fn pending_conflicts(&self) -> &[OperationConflict] {
        &self.pending_conflicts
    }

    pub fn conflict_log(&self) -> &[OperationConflict] {
        &self.conflict_log
    }

    pub fn locks(&self) -> Vec<ContentLock> {
        self.locks.locks()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn policy(&self) -> &ConflictResolutionPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: ConflictResolutionPolicy) {
        self.policy = policy;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            document_id: self.document_id.clone(),
            participants: self.participants.clone(),
            document: self.document.clone(),
            version: self.version,
            locks: self.locks.locks(),
            conflict_resolution_policy: self.policy.clone(),
            is_active: self.is_active,
            pending_conflicts: self.pending_conflicts.clone(),
            history_length: self.history.len(),
            queue_length: self.queue.len(),
            created_at: self.created_at,
        }
    }

    pub fn analytics(&self, now: DateTime<Utc>) -> SessionAnalytics {
        SessionAnalytics::from_session(self, now)
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<CollaborationEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, event: CollaborationEvent) {
        self.outbox.push(event);
    }

    /// Add a participant, or refresh one that is already present
    pub fn join(&mut self, user: &User, now: DateTime<Utc>) -> Participant {
        let version = self.version;
        if let Ok(existing) = self.participant_mut(&user.id) {
            existing.touch(now);
            existing.acknowledge(version);
            debug!("{} re-joined session", user.id);
            return existing.clone();
        }

        let color = color_for_index(self.participants.len());
        let cursor = self.cursors.create_cursor(&user.id, color, now);
        let mut participant = Participant::new(user, cursor, now);
        participant.acknowledge(version);

        info!(
            "{} joined session {} for document {} ({} participants)",
            user.id,
            self.id,
            self.document_id,
            self.participants.len() + 1
        );

        self.participants.push(participant.clone());
        self.is_active = true;
        self.emit(CollaborationEvent::ParticipantJoined {
            session_id: self.id,
            participant: participant.clone(),
        });

        participant
    }

    /// Remove a participant and release their locks.
    /// The session goes inactive and its queue is dropped once nobody is left.
    pub fn leave(&mut self, user_id: &UserId) -> Result<()> {
        let index = self
            .participants
            .iter()
            .position(|p| p.user_id == *user_id)
            .ok_or_else(|| {
                CollaborationError::InvalidOperation(format!(
                    "{} is not a participant of session {}",
                    user_id, self.id
                ))
            })?;
        self.participants.remove(index);

        for lock in self.locks.release_all_locks(user_id) {
            self.emit(CollaborationEvent::LockUpdated {
                session_id: self.id,
                action: LockAction::Released,
                lock,
            });
        }

        info!("{} left session {}", user_id, self.id);
        self.emit(CollaborationEvent::ParticipantLeft {
            session_id: self.id,
            user_id: user_id.clone(),
        });

        if self.participants.is_empty() {
            let dropped = self.queue.len();
            self.queue.clear();
            self.is_active = false;
            info!(
                "Session {} has no participants left, dropped {} queued operations",
                self.id, dropped
            );
        }

        Ok(())
    }

    /// Queue an operation for the next tick
    pub fn enqueue_operation(&mut self, operation: Operation) -> usize {
        debug!(
            "Queued {} {} from {}",
            operation.op_type(),
            operation.id,
            operation.user_id
        );
        self.queue.push_back(QueuedOperation {
            operation,
            status: QueueStatus::Pending,
        });
        self.trim_queue();
        self.queue.iter().filter(|entry| entry.is_pending()).count()
    }

    fn trim_queue(&mut self) {
        if self.queue.len() <= self.config.queue_capacity {
            return;
        }
        let excess = self.queue.len() - self.config.queue_trim_to;
        self.queue.drain(..excess);
        warn!(
            "Session {} queue exceeded {} entries, dropped the oldest {}",
            self.id, self.config.queue_capacity, excess
        );
    }

    /// Transform, check and commit an operation
    pub fn apply_operation(&mut self, op: Operation, now: DateTime<Utc>) -> OperationResult {
        let permissions = match self.participant_mut(&op.user_id) {
            Ok(participant) => {
                participant.touch(now);
                participant.permissions
            }
            Err(err) => return self.rejected(op, Vec::new(), err.to_string()),
        };

        let allowed = match op.op_type() {
            OperationType::Lock | OperationType::Unlock => permissions.can_lock,
            _ => permissions.can_edit,
        };
        if !allowed {
            let reason = format!("{} may not submit {} operations", op.user_id, op.op_type());
            return self.rejected(op, Vec::new(), reason);
        }

        let base_version = op.metadata.base_version;
        if let Some(base) = base_version.filter(|base| *base > self.version) {
            let conflict = OperationConflict::new(
                ConflictType::VersionMismatch,
                ConflictSeverity::High,
                &op,
                None,
            )
            .with_data(serde_json::json!({ "baseVersion": base, "sessionVersion": self.version }));
            self.conflict_log.push(conflict.clone());
            self.emit(CollaborationEvent::ConflictDetected {
                session_id: self.id,
                conflict: conflict.clone(),
                participants: self.participants.clone(),
            });
            let reason = format!(
                "base version {} is ahead of session version {}",
                base, self.version
            );
            return self.rejected(op, vec![conflict], reason);
        }

        if let Some(base) = base_version {
            if let Ok(participant) = self.participant_mut(&op.user_id) {
                participant.acknowledge(base);
            }
        }

        let concurrent = self.concurrent_with(&op);
        if let Err(reason) = self.check_range(&op, &concurrent) {
            return self.rejected(op, Vec::new(), reason);
        }

        let integration = self.engine.integrate(&op, &concurrent);
        if !concurrent.is_empty() {
            debug!(
                "Transformed {} against {} concurrent operations (confidence {:.2})",
                op.id,
                concurrent.len(),
                integration.confidence
            );
        }

        let decisions: Vec<(OperationConflict, ResolutionOutcome)> = integration
            .conflicts
            .into_iter()
            .map(|conflict| {
                let outcome = self.resolver.resolve(&conflict, &self.policy);
                (conflict, outcome)
            })
            .collect();
        let superseded_by = decisions.iter().find_map(|(_, outcome)| match outcome {
            ResolutionOutcome::Resolved {
                winner: Some(winner),
                ..
            } if *winner != op.id => Some(winner.clone()),
            _ => None,
        });

        let Some(transformed) = integration.operation else {
            let conflicts = self.settle_conflicts(decisions);
            return self.rejected(op, conflicts, "cancelled by a concurrent edit".to_string());
        };
        if let Some(winner) = superseded_by {
            let conflicts = self.settle_conflicts(decisions);
            let reason = format!("superseded by {}", winner);
            return self.rejected(op, conflicts, reason);
        }

        if let Err(err) = self.commit(&transformed, now) {
            let conflicts = decisions.into_iter().map(|(conflict, _)| conflict).collect();
            return self.rejected(op, conflicts, err.to_string());
        }
        let conflicts = self.settle_conflicts(decisions);

        OperationResult {
            success: true,
            operation: Some(transformed),
            document: Some(self.document.clone()),
            conflicts,
            error: None,
            version: self.version,
        }
    }

    /// Committed operations `op` was not built on.
    ///
    /// With `baseVersion` that is everything applied after it. Without one the author's
    /// acknowledged version stands in, and commits that predate the operation's own timestamp
    /// count as already seen.
    fn concurrent_with(&self, op: &Operation) -> Vec<Operation> {
        let (base, explicit) = match op.metadata.base_version {
            Some(base) => (base, true),
            None => (
                self.participant(&op.user_id)
                    .map(|participant| participant.acked_version)
                    .unwrap_or(self.version),
                false,
            ),
        };

        self.history
            .since_version(base)
            .filter(|entry| entry.operation.user_id != op.user_id)
            .filter(|entry| explicit || entry.applied_at >= op.timestamp)
            .map(|entry| entry.operation.clone())
            .collect()
    }

    /// Reject text edits whose range overflows or lies past the end of the text they were
    /// written against
    fn check_range(&self, op: &Operation, concurrent: &[Operation]) -> std::result::Result<(), String> {
        if !op.is_text_edit() {
            return Ok(());
        }
        let Some((_, end)) = op.checked_span() else {
            return Err(format!(
                "range starting at {} overflows",
                op.position.start
            ));
        };

        let current = self.document.char_len();
        let grown: isize = concurrent
            .iter()
            .fold(0isize, |total, other| total.saturating_add(other.length_delta()));
        let base_len = current.saturating_add_signed(grown.saturating_neg());
        let limit = current.max(base_len);
        if end > limit {
            return Err(format!(
                "range {}..{} outside document of length {}",
                op.position.start, end, limit
            ));
        }
        Ok(())
    }

    /// Log conflicts and emit their events once the fate of the operation is known
    fn settle_conflicts(
        &mut self,
        decisions: Vec<(OperationConflict, ResolutionOutcome)>,
    ) -> Vec<OperationConflict> {
        let mut conflicts = Vec::with_capacity(decisions.len());

        for (conflict, outcome) in decisions {
            self.conflict_log.push(conflict.clone());

            match outcome {
                ResolutionOutcome::Deferred => {
                    warn!(
                        "Conflict {} ({:?}, {:?}) in session {} awaits manual resolution",
                        conflict.id, conflict.conflict_type, conflict.severity, self.id
                    );
                    self.pending_conflicts.push(conflict.clone());
                    self.emit(CollaborationEvent::ConflictDetected {
                        session_id: self.id,
                        conflict: conflict.clone(),
                        participants: self.participants.clone(),
                    });
                }
                resolution => {
                    self.emit(CollaborationEvent::ConflictResolved {
                        session_id: self.id,
                        conflict_id: conflict.id,
                        resolution,
                    });
                }
            }
            conflicts.push(conflict);
        }

        conflicts
    }

    /// Record that `user_id` has seen the session up to `version`
    pub fn acknowledge(&mut self, user_id: &UserId, version: u64, now: DateTime<Utc>) -> Result<u64> {
        let current = self.version;
        let participant = self.participant_mut(user_id)?;
        participant.acknowledge(version.min(current));
        participant.touch(now);
        Ok(participant.acked_version)
    }

    fn check_locks(&self, op: &Operation, now: DateTime<Utc>) -> Result<()> {
        let (Some(block_id), Some(lock_type)) = (op.block_id(), LockType::guarding(op.op_type()))
        else {
            return Ok(());
        };

        if self
            .locks
            .is_locked_by_other(block_id, lock_type, &op.user_id, now)
        {
            return Err(CollaborationError::InvalidOperation(format!(
                "block {} is {:?}-locked by another participant",
                block_id, lock_type
            )));
        }
        Ok(())
    }

    fn commit(&mut self, op: &Operation, now: DateTime<Utc>) -> Result<()> {
        self.check_locks(op, now)?;

        match &op.kind {
            OperationKind::Lock {
                block_id,
                lock_type,
            } => {
                let request = LockRequest::new(op.user_id.clone(), block_id.clone(), *lock_type);
                if self.grant_lock(&request, now).is_none() {
                    return Err(CollaborationError::InvalidOperation(format!(
                        "{:?} lock on {} is held by another participant",
                        lock_type, block_id
                    )));
                }
            }
            OperationKind::Unlock {
                block_id,
                lock_type,
            } => {
                let lock = self
                    .locks
                    .release_block_lock(block_id, *lock_type, &op.user_id)
                    .ok_or_else(|| {
                        CollaborationError::InvalidOperation(format!(
                            "{} holds no {:?} lock on {}",
                            op.user_id, lock_type, block_id
                        ))
                    })?;
                self.emit(CollaborationEvent::LockUpdated {
                    session_id: self.id,
                    action: LockAction::Released,
                    lock,
                });
            }
            _ => {}
        }

        self.document.apply(op, now)?;
        self.version += 1;
        let version = self.version;
        if let Ok(author) = self.participant_mut(&op.user_id) {
            author.acknowledge(version);
        }

        self.history.push(AppliedOperation {
            operation: op.clone(),
            version: self.version,
            applied_at: now,
        });
        self.queue.push_back(QueuedOperation {
            operation: op.clone(),
            status: QueueStatus::Applied {
                version: self.version,
            },
        });
        self.trim_queue();

        let cursors = self.cursors;
        for participant in &mut self.participants {
            participant.cursor = cursors.transform_cursor(&participant.cursor, op);
            participant.selection = participant
                .selection
                .as_ref()
                .map(|selection| cursors.transform_selection(selection, op));
        }

        debug!(
            "Applied {} {} from {} at version {}",
            op.op_type(),
            op.id,
            op.user_id,
            self.version
        );
        self.emit(CollaborationEvent::OperationApplied {
            session_id: self.id,
            operation: op.clone(),
            version: self.version,
            checksum: self.document.checksum.clone(),
            participants: self.participants.clone(),
        });

        Ok(())
    }

    fn rejected(
        &self,
        op: Operation,
        conflicts: Vec<OperationConflict>,
        reason: String,
    ) -> OperationResult {
        debug!("Rejected operation {} from {}: {}", op.id, op.user_id, reason);
        OperationResult {
            success: false,
            operation: Some(op),
            document: None,
            conflicts,
            error: Some(reason),
            version: self.version,
        }
    }

    /// Periodic maintenance: drain pending operations, refresh activity, expire locks
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let (pending, kept): (VecDeque<QueuedOperation>, VecDeque<QueuedOperation>) =
            std::mem::take(&mut self.queue)
                .into_iter()
                .partition(QueuedOperation::is_pending);
        self.queue = kept;

        let mut batch: Vec<Operation> = Vec::with_capacity(pending.len());
        for entry in pending {
            let op = entry.operation;
            if let Some(last) = batch.last_mut() {
                if self.engine.can_compose(last, &op) {
                    match self.engine.compose(last, &op) {
                        Ok(composed) => {
                            *last = composed;
                            continue;
                        }
                        Err(err) => debug!("Not composing {}: {}", op.id, err),
                    }
                }
            }
            batch.push(op);
        }

        for op in batch {
            let result = self.apply_operation(op, now);
            if result.success {
                summary.applied += 1;
            } else {
                summary.rejected += 1;
                warn!(
                    "Queued operation rejected in session {}: {}",
                    self.id,
                    result.error.unwrap_or_default()
                );
            }
        }

        let threshold = self.config.inactivity_threshold();
        let mut cleared = Vec::new();
        for participant in &mut self.participants {
            if participant.refresh_activity(now, threshold) && !participant.is_active {
                summary.went_inactive += 1;
                debug!("{} is now inactive", participant.user_id);
                if participant.selection.take().is_some() {
                    cleared.push(participant.user_id.clone());
                }
            }
        }
        for user_id in cleared {
            self.emit(CollaborationEvent::SelectionUpdated {
                session_id: self.id,
                user_id,
                selection: None,
                participants: self.participants.clone(),
            });
        }

        for lock in self.locks.expire_locks(now) {
            summary.expired_locks += 1;
            debug!("Lock {:?} on {} expired", lock.lock_type, lock.block_id);
            self.emit(CollaborationEvent::LockUpdated {
                session_id: self.id,
                action: LockAction::Expired,
                lock,
            });
        }

        summary
    }

    pub fn update_cursor(
        &mut self,
        user_id: &UserId,
        position: usize,
        block_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Cursor> {
        let doc_len = self.document.char_len();
        let cursors = self.cursors;
        let participant = self.participant_mut(user_id)?;

        participant.cursor =
            cursors.update_cursor(&participant.cursor, position, block_id, doc_len, now);
        participant.touch(now);
        let cursor = participant.cursor.clone();

        self.emit(CollaborationEvent::CursorUpdated {
            session_id: self.id,
            cursor: cursor.clone(),
            participants: self.participants.clone(),
        });
        Ok(cursor)
    }

    pub fn update_selection(
        &mut self,
        user_id: &UserId,
        start: usize,
        end: usize,
        block_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let doc_len = self.document.char_len();
        let selection = self
            .cursors
            .update_selection(user_id, start, end, block_id, doc_len);

        let participant = self.participant_mut(user_id)?;
        participant.selection = Some(selection.clone());
        participant.touch(now);

        self.emit(CollaborationEvent::SelectionUpdated {
            session_id: self.id,
            user_id: user_id.clone(),
            selection: Some(selection.clone()),
            participants: self.participants.clone(),
        });
        Ok(selection)
    }

    /// Non-blocking acquire; `None` when the lock is held or the user may not lock
    pub fn acquire_lock(&mut self, request: &LockRequest, now: DateTime<Utc>) -> Option<ContentLock> {
        let participant = self.participant_mut(&request.user_id).ok()?;
        participant.touch(now);
        if !participant.permissions.can_lock {
            debug!("{} may not take locks", request.user_id);
            return None;
        }

        self.grant_lock(request, now)
    }

    fn grant_lock(&mut self, request: &LockRequest, now: DateTime<Utc>) -> Option<ContentLock> {
        let ttl = self.config.default_lock_ttl();
        let Some(acquisition) = self.locks.acquire_lock(request, ttl, now) else {
            warn!(
                "{:?} lock on {} denied to {} in session {}",
                request.lock_type, request.block_id, request.user_id, self.id
            );
            return None;
        };

        if let Some(broken) = acquisition.broken {
            self.emit(CollaborationEvent::LockUpdated {
                session_id: self.id,
                action: LockAction::Broken,
                lock: broken,
            });
        }
        self.emit(CollaborationEvent::LockUpdated {
            session_id: self.id,
            action: LockAction::Acquired,
            lock: acquisition.lock.clone(),
        });

        Some(acquisition.lock)
    }

    /// Release a lock held by `user_id`
    pub fn release_lock(
        &mut self,
        lock_id: LockId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Option<ContentLock> {
        if let Ok(participant) = self.participant_mut(user_id) {
            participant.touch(now);
        }

        let lock = self.locks.release_lock(lock_id, user_id)?;
        self.emit(CollaborationEvent::LockUpdated {
            session_id: self.id,
            action: LockAction::Released,
            lock: lock.clone(),
        });
        Some(lock)
    }

    /// Settle a conflict that was deferred for manual review
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        resolution: ManualResolution,
        now: DateTime<Utc>,
    ) -> Result<ResolutionOutcome> {
        if !self.pending_conflicts.iter().any(|c| c.id == conflict_id) {
            return Err(CollaborationError::InvalidOperation(format!(
                "conflict {} is not pending in session {}",
                conflict_id, self.id
            )));
        }

        let winner = match resolution {
            ManualResolution::Accept => None,
            ManualResolution::Override { operation } => {
                let id = operation.id.clone();
                let result = self.apply_operation(operation, now);
                if !result.success {
                    return Err(CollaborationError::InvalidOperation(format!(
                        "override rejected: {}",
                        result.error.unwrap_or_default()
                    )));
                }
                Some(id)
            }
        };

        self.pending_conflicts.retain(|c| c.id != conflict_id);
        let outcome = ResolutionOutcome::Resolved {
            strategy: ResolutionStrategy::Manual,
            winner,
        };

        info!("Conflict {} in session {} resolved manually", conflict_id, self.id);
        self.emit(CollaborationEvent::ConflictResolved {
            session_id: self.id,
            conflict_id,
            resolution: outcome.clone(),
        });

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, OperationId, Permissions};
    use chrono::Duration;

    fn session_with(text: &str, users: &[&str]) -> (CollaborationSession, DateTime<Utc>) {
        let now = Utc::now();
        let mut session = CollaborationSession::new(
            DocumentId::from("doc"),
            CollaborativeDocument::from_text(text).with_blocks(["p1", "p2"]),
            CollaborationConfig::default(),
            Arc::new(OperationalTransformEngine::new()),
            now,
        );
        for user in users {
            session.join(&User::new(*user, user.to_uppercase()), now);
        }
        session.drain_events();
        (session, now)
    }

    #[test]
    fn test_join_assigns_colors_and_rejoin_is_idempotent() {
        let (mut session, now) = session_with("", &[]);

        let alice = session.join(&User::new("alice", "Alice"), now);
        let bob = session.join(&User::new("bob", "Bob"), now);
        assert_eq!(alice.color, color_for_index(0));
        assert_eq!(bob.color, color_for_index(1));

        let again = session.join(&User::new("alice", "Alice"), now + Duration::seconds(5));
        assert_eq!(again.last_seen, now + Duration::seconds(5));
        assert_eq!(session.participants().len(), 2);

        // Only the two first joins are announced
        let events = session.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.name() == "participant-joined"));
    }

    #[test]
    fn test_version_advances_once_per_applied_operation() {
        let (mut session, now) = session_with("abc", &["alice"]);

        let ok = session.apply_operation(Operation::insert("alice", 3, "d"), now);
        assert!(ok.success);
        assert_eq!(ok.version, 1);

        let bad = session.apply_operation(Operation::delete_len("alice", 10, 1), now);
        assert!(!bad.success);
        assert_eq!(bad.version, 1);
        assert_eq!(session.document().text(), "abcd");
        assert!(session.document().verify_checksum());
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_non_participant_rejected() {
        let (mut session, now) = session_with("abc", &["alice"]);
        let result = session.apply_operation(Operation::insert("mallory", 0, "x"), now);
        assert!(!result.success);
        assert_eq!(session.version(), 0);
    }

    #[test]
    fn test_read_only_participant_cannot_edit() {
        let (mut session, now) = session_with("abc", &[]);
        let mut viewer = User::new("viewer", "Viewer");
        viewer.permissions = Permissions {
            can_edit: false,
            can_comment: true,
            can_lock: false,
        };
        session.join(&viewer, now);

        let result = session.apply_operation(Operation::insert("viewer", 0, "x"), now);
        assert!(!result.success);
        assert!(session
            .acquire_lock(&LockRequest::new("viewer", "p1", LockType::Edit), now)
            .is_none());
    }

    #[test]
    fn test_base_version_ahead_is_version_mismatch() {
        let (mut session, now) = session_with("abc", &["alice"]);
        let result =
            session.apply_operation(Operation::insert("alice", 0, "x").with_base_version(4), now);

        assert!(!result.success);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::VersionMismatch);
        assert_eq!(session.conflict_log().len(), 1);
    }

    #[test]
    fn test_base_version_catches_up_on_history() {
        let (mut session, now) = session_with("hello", &["alice", "bob"]);

        // alice prepends, bob later edits the text he saw at version 0
        session.apply_operation(Operation::insert("alice", 0, ">> ").with_timestamp(now), now);
        let result = session.apply_operation(
            Operation::insert("bob", 5, "!")
                .with_timestamp(now - Duration::seconds(10))
                .with_base_version(0),
            now,
        );

        assert!(result.success);
        assert_eq!(session.document().text(), ">> hello!");
    }

    #[test]
    fn test_edit_without_base_version_builds_on_seen_commits() {
        let (mut session, now) = session_with("", &["alice", "bob"]);

        let hello = session.apply_operation(Operation::insert("alice", 0, "Hello").with_timestamp(now), now);
        assert!(hello.success);

        let later = now + Duration::seconds(1);
        let world = session.apply_operation(Operation::insert("bob", 5, " world").with_timestamp(later), later);
        assert!(world.success, "{:?}", world.error);
        assert_eq!(session.document().text(), "Hello world");
        assert_eq!(session.participant(&UserId::from("bob")).unwrap().acked_version, 2);
    }

    #[test]
    fn test_edit_without_base_version_rebases_unseen_commits() {
        let (mut session, now) = session_with("hello", &["alice", "bob"]);
        session.apply_operation(Operation::insert("alice", 0, ">> ").with_timestamp(now), now);

        // Written before alice's commit landed
        let result = session.apply_operation(
            Operation::insert("bob", 5, "!").with_timestamp(now - Duration::seconds(1)),
            now,
        );
        assert!(result.success);
        assert_eq!(session.document().text(), ">> hello!");
    }

    #[test]
    fn test_acknowledged_commits_are_not_rebased() {
        let (mut session, now) = session_with("hello", &["alice", "bob"]);
        session.apply_operation(Operation::insert("alice", 0, ">> ").with_timestamp(now), now);

        let bob = UserId::from("bob");
        assert_eq!(session.acknowledge(&bob, 1, now).unwrap(), 1);
        // Acknowledging past the session version is clamped
        assert_eq!(session.acknowledge(&bob, 9, now).unwrap(), 1);

        let result = session.apply_operation(
            Operation::insert("bob", 8, "!").with_timestamp(now - Duration::seconds(1)),
            now,
        );
        assert!(result.success);
        assert_eq!(session.document().text(), ">> hello!");
        assert!(session.acknowledge(&UserId::from("mallory"), 1, now).is_err());
    }

    #[test]
    fn test_out_of_range_edit_is_rejected_before_transform() {
        let (mut session, now) = session_with("", &["alice", "bob"]);
        session.apply_operation(Operation::insert("alice", 0, "Hello").with_timestamp(now), now);
        session.drain_events();

        let later = now + Duration::seconds(1);
        for op in [
            Operation::delete_len("bob", usize::MAX, 1),
            Operation::delete_len("bob", 1, usize::MAX),
            Operation::insert("bob", 6, "x"),
        ] {
            let result = session.apply_operation(op.with_timestamp(later), later);
            assert!(!result.success);
            assert!(result.conflicts.is_empty());
        }

        assert_eq!(session.version(), 1);
        assert_eq!(session.document().text(), "Hello");
        assert!(session.conflict_log().is_empty());
        assert!(session.drain_events().is_empty());

        let ok = session.apply_operation(Operation::insert("bob", 5, "!").with_timestamp(later), later);
        assert!(ok.success);
        assert_eq!(session.document().text(), "Hello!");
    }

    #[test]
    fn test_rejected_commit_records_no_conflicts() {
        let (mut session, now) = session_with("0123456789", &["alice", "bob"]);
        session
            .acquire_lock(&LockRequest::new("alice", "p1", LockType::Format), now)
            .unwrap();

        let mut bold = Attributes::new();
        bold.insert("bold".to_string(), serde_json::json!(true));
        let mut plain = Attributes::new();
        plain.insert("bold".to_string(), serde_json::json!(false));

        let own = Operation::format("alice", 0, 5, bold).with_block("p1").with_timestamp(now);
        assert!(session.apply_operation(own, now).success);
        session.drain_events();

        let blocked = Operation::format("bob", 0, 5, plain)
            .with_block("p1")
            .with_timestamp(now - Duration::seconds(1));
        let result = session.apply_operation(blocked, now);

        assert!(!result.success);
        assert!(!result.conflicts.is_empty());
        assert!(session.conflict_log().is_empty());
        assert!(session.pending_conflicts().is_empty());
        assert!(session
            .drain_events()
            .iter()
            .all(|event| !event.name().starts_with("conflict-")));
    }

    #[test]
    fn test_events_carry_participants() {
        let (mut session, now) = session_with("abc", &["alice", "bob"]);
        session.apply_operation(Operation::insert("alice", 0, "x"), now);
        session.update_cursor(&UserId::from("bob"), 1, None, now).unwrap();

        for event in session.drain_events() {
            match event {
                CollaborationEvent::OperationApplied { participants, .. }
                | CollaborationEvent::CursorUpdated { participants, .. } => {
                    assert_eq!(participants.len(), 2);
                }
                other => panic!("unexpected event {}", other.name()),
            }
        }
    }

    #[test]
    fn test_locked_block_rejects_other_users() {
        let (mut session, now) = session_with("abc", &["alice", "bob"]);
        session
            .acquire_lock(&LockRequest::new("alice", "p1", LockType::Edit), now)
            .unwrap();

        let blocked = session.apply_operation(Operation::insert("bob", 0, "x").with_block("p1"), now);
        assert!(!blocked.success);

        let own = session.apply_operation(Operation::insert("alice", 0, "x").with_block("p1"), now);
        assert!(own.success);

        let elsewhere = session.apply_operation(Operation::insert("bob", 0, "y").with_block("p2"), now);
        assert!(elsewhere.success);
    }

    #[test]
    fn test_lock_operations_drive_lock_table() {
        let (mut session, now) = session_with("", &["alice", "bob"]);

        assert!(session
            .apply_operation(Operation::lock("alice", "p1", LockType::Move), now)
            .success);
        assert!(!session
            .apply_operation(Operation::lock("bob", "p1", LockType::Move), now)
            .success);
        assert!(!session
            .apply_operation(Operation::unlock("bob", "p1", LockType::Move), now)
            .success);
        assert!(session
            .apply_operation(Operation::unlock("alice", "p1", LockType::Move), now)
            .success);
        assert!(session.locks().is_empty());
        assert_eq!(session.version(), 2);
    }

    #[test]
    fn test_tick_drains_queue_in_order_and_composes() {
        let (mut session, now) = session_with("", &["alice"]);

        session.enqueue_operation(Operation::insert("alice", 0, "he").with_timestamp(now));
        session.enqueue_operation(
            Operation::insert("alice", 2, "llo").with_timestamp(now + Duration::milliseconds(100)),
        );
        assert_eq!(session.version(), 0);

        let summary = session.tick(now + Duration::milliseconds(150));
        assert_eq!(summary.applied, 1);
        assert_eq!(session.document().text(), "hello");
        assert_eq!(session.version(), 1);
        assert!(session.queue().iter().all(|entry| !entry.is_pending()));
    }

    #[test]
    fn test_queue_is_trimmed_to_most_recent() {
        let (mut session, now) = session_with("", &["alice"]);
        for i in 0..1001 {
            let op = Operation::retain("alice", 0, 0)
                .with_id(format!("op-{}", i))
                .with_timestamp(now);
            session.enqueue_operation(op);
        }

        assert_eq!(session.queue().len(), 500);
        assert_eq!(session.queue().back().unwrap().operation.id, OperationId::from("op-1000"));
    }

    #[test]
    fn test_tick_marks_inactive_and_expires_locks() {
        let (mut session, now) = session_with("abc", &["alice"]);
        session.update_selection(&UserId::from("alice"), 0, 2, None, now).unwrap();
        session
            .acquire_lock(
                &LockRequest::new("alice", "p1", LockType::Edit).with_ttl(Duration::seconds(5)),
                now,
            )
            .unwrap();
        session.drain_events();

        let summary = session.tick(now + Duration::seconds(31));
        assert_eq!(summary.went_inactive, 1);
        assert_eq!(summary.expired_locks, 1);
        assert!(session.cursors().is_empty());
        assert!(session.selections().is_empty());

        let names: Vec<&str> = session.drain_events().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["selection-updated", "lock-updated"]);
    }

    #[test]
    fn test_cursors_follow_remote_edits() {
        let (mut session, now) = session_with("hello world", &["alice", "bob"]);
        session.update_cursor(&UserId::from("bob"), 6, None, now).unwrap();

        session.apply_operation(Operation::insert("alice", 0, "oh "), now);
        let bob = session.participant(&UserId::from("bob")).unwrap();
        assert_eq!(bob.cursor.position, 9);
    }

    #[test]
    fn test_critical_conflict_waits_for_manual_resolution() {
        let (mut session, now) = session_with("", &["alice", "bob"]);
        session.apply_operation(Operation::split("alice", "p1", "p1b", 0).with_timestamp(now), now);

        let merge = Operation::merge("bob", "p1", "p2", 0).with_timestamp(now);
        let result = session.apply_operation(merge, now);
        assert!(!result.success);
        assert_eq!(session.pending_conflicts().len(), 1);

        let conflict_id = session.pending_conflicts()[0].id;
        let outcome = session
            .resolve_conflict(conflict_id, ManualResolution::Accept, now)
            .unwrap();
        assert_eq!(
            outcome,
            ResolutionOutcome::Resolved {
                strategy: ResolutionStrategy::Manual,
                winner: None
            }
        );
        assert!(session.pending_conflicts().is_empty());
        assert!(session
            .resolve_conflict(conflict_id, ManualResolution::Accept, now)
            .is_err());
    }

    #[test]
    fn test_last_write_wins_drops_losing_operation() {
        let (mut session, now) = session_with("0123456789", &["alice", "bob"]);
        session.set_policy(ConflictResolutionPolicy {
            default_strategy: ResolutionStrategy::LastWriteWins,
            ..Default::default()
        });

        let mut bold = Attributes::new();
        bold.insert("bold".to_string(), serde_json::json!(true));
        let later = Operation::format("alice", 0, 5, bold.clone()).with_timestamp(now);
        session.apply_operation(later, now);

        // bob's format is older than alice's and collides with it
        let older = Operation::format("bob", 0, 5, bold)
            .with_timestamp(now - Duration::seconds(1))
            .with_base_version(0);
        let result = session.apply_operation(older, now);
        assert!(!result.success);
        assert_eq!(session.version(), 1);
    }

    #[test]
    fn test_leave_releases_locks_and_deactivates_when_empty() {
        let (mut session, now) = session_with("", &["alice"]);
        session
            .acquire_lock(&LockRequest::new("alice", "p1", LockType::Edit), now)
            .unwrap();
        session.enqueue_operation(Operation::insert("alice", 0, "x"));
        session.drain_events();

        session.leave(&UserId::from("alice")).unwrap();
        assert!(session.locks().is_empty());
        assert!(session.queue().is_empty());
        assert!(!session.is_active());

        let names: Vec<&str> = session.drain_events().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["lock-updated", "participant-left"]);
        assert!(session.leave(&UserId::from("alice")).is_err());
    }
}
