/// Block-level locks used to coordinate structural edits
/// Acquisition never blocks: contention is reported as `None` and retry is left to the caller
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::{OperationType, UserId};

/// Unique lock identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(pub uuid::Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Edit,
    Format,
    Move,
    Delete,
}

impl LockType {
    /// Lock that guards a given kind of operation, if any
    pub fn guarding(op_type: OperationType) -> Option<LockType> {
        match op_type {
            OperationType::Insert | OperationType::Replace => Some(LockType::Edit),
            OperationType::Delete => Some(LockType::Delete),
            OperationType::Format => Some(LockType::Format),
            OperationType::Move | OperationType::Split | OperationType::Merge => {
                Some(LockType::Move)
            }
            OperationType::Retain | OperationType::Lock | OperationType::Unlock => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLock {
    pub id: LockId,
    pub user_id: UserId,
    pub block_id: String,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_breakable: bool,
    pub priority: u8,
}

impl ContentLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Parameters of a lock acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub user_id: UserId,
    pub block_id: String,
    pub lock_type: LockType,
    /// Time to live in milliseconds; the session default applies when absent
    #[serde(default)]
    pub ttl_ms: Option<i64>,
    #[serde(default)]
    pub is_breakable: bool,
    #[serde(default)]
    pub priority: u8,
}

impl LockRequest {
    pub fn new(user_id: impl Into<UserId>, block_id: impl Into<String>, lock_type: LockType) -> Self {
        Self {
            user_id: user_id.into(),
            block_id: block_id.into(),
            lock_type,
            ttl_ms: None,
            is_breakable: false,
            priority: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.num_milliseconds());
        self
    }

    /// Allow a higher-priority requester to take the lock over
    pub fn breakable(mut self) -> Self {
        self.is_breakable = true;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Successful acquisition, with the lock that was broken to grant it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct LockAcquisition {
    pub lock: ContentLock,
    pub broken: Option<ContentLock>,
}

/// Lock table keyed by lock id
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    locks: HashMap<LockId, ContentLock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock on `(block_id, lock_type)`.
    /// Re-acquisition by the holder refreshes the expiry.
    pub fn acquire_lock(
        &mut self,
        request: &LockRequest,
        default_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<LockAcquisition> {
        let ttl = request
            .ttl_ms
            .map(Duration::milliseconds)
            .unwrap_or(default_ttl);

        let held = self
            .locks
            .values()
            .find(|lock| {
                lock.block_id == request.block_id
                    && lock.lock_type == request.lock_type
                    && !lock.is_expired(now)
            })
            .cloned();

        let mut broken = None;
        if let Some(existing) = held {
            if existing.user_id == request.user_id {
                let lock = self.locks.get_mut(&existing.id)?;
                lock.expires_at = now + ttl;
                lock.is_breakable = request.is_breakable;
                lock.priority = request.priority;
                return Some(LockAcquisition {
                    lock: lock.clone(),
                    broken: None,
                });
            }

            if !(existing.is_breakable && request.priority > existing.priority) {
                debug!(
                    "Lock on {}/{:?} denied to {}: held by {}",
                    request.block_id, request.lock_type, request.user_id, existing.user_id
                );
                return None;
            }

            debug!(
                "Lock on {}/{:?} broken by {} (priority {} > {})",
                request.block_id,
                request.lock_type,
                request.user_id,
                request.priority,
                existing.priority
            );
            broken = self.locks.remove(&existing.id);
        }

        // Expired entries for the same key are dead weight once a new holder exists
        self.locks.retain(|_, lock| {
            !(lock.block_id == request.block_id
                && lock.lock_type == request.lock_type
                && lock.is_expired(now))
        });

        let lock = ContentLock {
            id: LockId::new(),
            user_id: request.user_id.clone(),
            block_id: request.block_id.clone(),
            lock_type: request.lock_type,
            acquired_at: now,
            expires_at: now + ttl,
            is_breakable: request.is_breakable,
            priority: request.priority,
        };
        self.locks.insert(lock.id, lock.clone());

        Some(LockAcquisition { lock, broken })
    }

    /// Release a lock. Only its holder may release it.
    pub fn release_lock(&mut self, lock_id: LockId, user_id: &UserId) -> Option<ContentLock> {
        match self.locks.get(&lock_id) {
            Some(lock) if lock.user_id == *user_id => self.locks.remove(&lock_id),
            _ => None,
        }
    }

    /// Release the lock a user holds on `(block_id, lock_type)`
    pub fn release_block_lock(
        &mut self,
        block_id: &str,
        lock_type: LockType,
        user_id: &UserId,
    ) -> Option<ContentLock> {
        let id = self
            .locks
            .values()
            .find(|lock| {
                lock.block_id == block_id && lock.lock_type == lock_type && lock.user_id == *user_id
            })
            .map(|lock| lock.id)?;
        self.locks.remove(&id)
    }

    /// Release every lock held by a user (called when they leave)
    pub fn release_all_locks(&mut self, user_id: &UserId) -> Vec<ContentLock> {
        let ids: Vec<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.user_id == *user_id)
            .map(|lock| lock.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.locks.remove(&id))
            .collect()
    }

    /// Remove and return all locks whose TTL has elapsed
    pub fn expire_locks(&mut self, now: DateTime<Utc>) -> Vec<ContentLock> {
        let ids: Vec<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.is_expired(now))
            .map(|lock| lock.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.locks.remove(&id))
            .collect()
    }

    /// Active lock on `(block_id, lock_type)`, if any
    pub fn active_lock(
        &self,
        block_id: &str,
        lock_type: LockType,
        now: DateTime<Utc>,
    ) -> Option<&ContentLock> {
        self.locks.values().find(|lock| {
            lock.block_id == block_id && lock.lock_type == lock_type && !lock.is_expired(now)
        })
    }

    /// Whether someone other than `user_id` holds an active lock on the key
    pub fn is_locked_by_other(
        &self,
        block_id: &str,
        lock_type: LockType,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> bool {
        self.active_lock(block_id, lock_type, now)
            .map(|lock| lock.user_id != *user_id)
            .unwrap_or(false)
    }

    pub fn get(&self, lock_id: &LockId) -> Option<&ContentLock> {
        self.locks.get(lock_id)
    }

    /// All locks, oldest first
    pub fn locks(&self) -> Vec<ContentLock> {
        let mut locks: Vec<ContentLock> = self.locks.values().cloned().collect();
        locks.sort_by_key(|lock| lock.acquired_at);
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
