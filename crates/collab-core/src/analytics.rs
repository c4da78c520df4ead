/// Session statistics, computed from the operation history and conflict log
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{CollaborationSession, OperationType, SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalytics {
    pub session_id: SessionId,
    pub version: u64,
    pub total_operations: usize,
    pub operations_by_user: BTreeMap<UserId, usize>,
    pub operations_by_type: BTreeMap<OperationType, usize>,
    pub conflicts_detected: usize,
    pub conflicts_pending: usize,

    /// Conflicts per applied operation
    pub conflict_rate: f64,

    /// Applied operations per minute since the session was created (at least one minute)
    pub operations_per_minute: f64,

    pub active_participants: usize,
    pub total_participants: usize,
    pub lock_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl SessionAnalytics {
    pub fn from_session(session: &CollaborationSession, now: DateTime<Utc>) -> Self {
        let mut operations_by_user: BTreeMap<UserId, usize> = BTreeMap::new();
        let mut operations_by_type: BTreeMap<OperationType, usize> = BTreeMap::new();

        for entry in session.history().iter() {
            *operations_by_user
                .entry(entry.operation.user_id.clone())
                .or_default() += 1;
            *operations_by_type.entry(entry.operation.op_type()).or_default() += 1;
        }

        let total_operations = session.history().len();
        let conflicts_detected = session.conflict_log().len();
        let conflict_rate = if total_operations == 0 {
            0.0
        } else {
            conflicts_detected as f64 / total_operations as f64
        };

        let elapsed_ms = (now - session.created_at()).num_milliseconds().max(60_000);
        let operations_per_minute = total_operations as f64 * 60_000.0 / elapsed_ms as f64;

        let participants = session.participants();

        Self {
            session_id: session.id(),
            version: session.version(),
            total_operations,
            operations_by_user,
            operations_by_type,
            conflicts_detected,
            conflicts_pending: session.pending_conflicts().len(),
            conflict_rate,
            operations_per_minute,
            active_participants: participants.iter().filter(|p| p.is_active).count(),
            total_participants: participants.len(),
            lock_count: session
                .locks()
                .iter()
                .filter(|lock| !lock.is_expired(now))
                .count(),
            computed_at: now,
        }
    }
}
