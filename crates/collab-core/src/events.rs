/// Events broadcast to everyone observing a session
use serde::{Deserialize, Serialize};

use crate::{
    ConflictId, ContentLock, Cursor, Operation, OperationConflict, Participant, ResolutionOutcome,
    Selection, SessionId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockAction {
    Acquired,
    Released,
    Expired,

    /// Taken over by a higher-priority request
    Broken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CollaborationEvent {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        session_id: SessionId,
        participant: Participant,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    OperationApplied {
        session_id: SessionId,
        operation: Operation,
        version: u64,
        checksum: String,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    CursorUpdated {
        session_id: SessionId,
        cursor: Cursor,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    SelectionUpdated {
        session_id: SessionId,
        user_id: UserId,
        selection: Option<Selection>,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    LockUpdated {
        session_id: SessionId,
        action: LockAction,
        lock: ContentLock,
    },

    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        session_id: SessionId,
        conflict: OperationConflict,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        session_id: SessionId,
        conflict_id: ConflictId,
        resolution: ResolutionOutcome,
    },
}

impl CollaborationEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            CollaborationEvent::ParticipantJoined { session_id, .. }
            | CollaborationEvent::ParticipantLeft { session_id, .. }
            | CollaborationEvent::OperationApplied { session_id, .. }
            | CollaborationEvent::CursorUpdated { session_id, .. }
            | CollaborationEvent::SelectionUpdated { session_id, .. }
            | CollaborationEvent::LockUpdated { session_id, .. }
            | CollaborationEvent::ConflictDetected { session_id, .. }
            | CollaborationEvent::ConflictResolved { session_id, .. } => *session_id,
        }
    }

    /// Wire name, as it appears in the `event` field
    pub fn name(&self) -> &'static str {
        match self {
            CollaborationEvent::ParticipantJoined { .. } => "participant-joined",
            CollaborationEvent::ParticipantLeft { .. } => "participant-left",
            CollaborationEvent::OperationApplied { .. } => "operation-applied",
            CollaborationEvent::CursorUpdated { .. } => "cursor-updated",
            CollaborationEvent::SelectionUpdated { .. } => "selection-updated",
            CollaborationEvent::LockUpdated { .. } => "lock-updated",
            CollaborationEvent::ConflictDetected { .. } => "conflict-detected",
            CollaborationEvent::ConflictResolved { .. } => "conflict-resolved",
        }
    }
}
