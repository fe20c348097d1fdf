//! Exclusive, time-bounded edit locks per entity.
//!
//! Expiry is soft: an expired lock is treated as absent and reclaimed
//! lazily the next time its entity is touched. Nothing here runs a timer;
//! [`LockManager::prune_expired`] exists for the reconciliation tick.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaboration::EntityType;
use crate::error::LockDenied;
use crate::types::{EntityId, Timestamp, UserId};

/// A claim by one user to edit one entity exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLock {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub owner_user_id: UserId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Total order on competing grants: earlier `acquired_at` first, then
/// owner id.
fn precedes(a: &EntityLock, b: &EntityLock) -> bool {
    (a.acquired_at, &a.owner_user_id) <= (b.acquired_at, &b.owner_user_id)
}

impl EntityLock {
    /// A lock is live iff `now < expires_at`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: Timestamp) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Result of applying a lock event received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLockOutcome {
    Applied,
    /// The remote grant was earlier and replaced a local lock held by
    /// someone else.
    Displaced { previous: EntityLock },
    /// A different owner holds an earlier live lock locally; kept.
    Contested { local_owner: UserId },
    /// Owner mismatch or unknown lock; nothing changed.
    Ignored,
}

/// Lock table for one document.
#[derive(Debug)]
pub struct LockManager {
    ttl: Duration,
    locks: HashMap<EntityId, EntityLock>,
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            locks: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lock on `entity_id` for `user_id`.
    ///
    /// Succeeds when the entity is unlocked, when the existing lock has
    /// expired, or when the caller already owns it (which refreshes the
    /// TTL). Otherwise returns [`LockDenied`] naming the current owner.
    pub fn acquire(
        &mut self,
        entity_id: &str,
        entity_type: EntityType,
        user_id: &str,
        now: Timestamp,
    ) -> Result<EntityLock, LockDenied> {
        if let Some(existing) = self.current(entity_id, now) {
            if existing.owner_user_id != user_id {
                return Err(LockDenied {
                    entity_id: entity_id.to_string(),
                    current_owner: Some(existing.owner_user_id.clone()),
                    expires_at: Some(existing.expires_at),
                });
            }
        }

        let acquired_at = match self.locks.get(entity_id) {
            Some(existing) if existing.owner_user_id == user_id => existing.acquired_at,
            _ => now,
        };
        let lock = EntityLock {
            entity_id: entity_id.to_string(),
            entity_type,
            owner_user_id: user_id.to_string(),
            acquired_at,
            expires_at: now + self.ttl,
        };
        self.locks.insert(lock.entity_id.clone(), lock.clone());
        Ok(lock)
    }

    /// Extend the lock for its current live owner.
    ///
    /// A non-owner, or a lock that is absent or expired, is denied and the
    /// stored `expires_at` is left untouched.
    pub fn renew(
        &mut self,
        entity_id: &str,
        user_id: &str,
        now: Timestamp,
    ) -> Result<EntityLock, LockDenied> {
        let ttl = self.ttl;
        let Some(lock) = self.locks.get_mut(entity_id).filter(|l| l.is_live(now)) else {
            return Err(LockDenied {
                entity_id: entity_id.to_string(),
                current_owner: None,
                expires_at: None,
            });
        };
        if lock.owner_user_id != user_id {
            return Err(LockDenied {
                entity_id: entity_id.to_string(),
                current_owner: Some(lock.owner_user_id.clone()),
                expires_at: Some(lock.expires_at),
            });
        }
        lock.expires_at = now + ttl;
        Ok(lock.clone())
    }

    /// Release the lock if `user_id` owns it. Returns `true` when a lock was
    /// removed; anything else is a silent no-op.
    pub fn release(&mut self, entity_id: &str, user_id: &str) -> bool {
        let owned = self
            .locks
            .get(entity_id)
            .is_some_and(|l| l.owner_user_id == user_id);
        if owned {
            self.locks.remove(entity_id);
        }
        owned
    }

    /// Release every lock owned by `user_id`.
    pub fn release_all(&mut self, user_id: &str) -> Vec<EntityLock> {
        let entity_ids: Vec<EntityId> = self
            .locks
            .values()
            .filter(|l| l.owner_user_id == user_id)
            .map(|l| l.entity_id.clone())
            .collect();
        let mut released: Vec<EntityLock> = entity_ids
            .iter()
            .filter_map(|id| self.locks.remove(id))
            .collect();
        released.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        released
    }

    /// The live lock on `entity_id`, reclaiming it first if it has expired.
    pub fn current(&mut self, entity_id: &str, now: Timestamp) -> Option<&EntityLock> {
        if self.locks.get(entity_id).is_some_and(|l| !l.is_live(now)) {
            if let Some(stale) = self.locks.remove(entity_id) {
                tracing::debug!(
                    entity_id = %stale.entity_id,
                    owner = %stale.owner_user_id,
                    expired_at = %stale.expires_at,
                    "Reclaimed stale lock"
                );
            }
        }
        self.locks.get(entity_id)
    }

    /// Read-only view of the live lock on `entity_id`.
    pub fn peek(&self, entity_id: &str, now: Timestamp) -> Option<&EntityLock> {
        self.locks.get(entity_id).filter(|l| l.is_live(now))
    }

    /// Every live lock, keyed by entity.
    pub fn locks_by_entity(&self, now: Timestamp) -> HashMap<EntityId, EntityLock> {
        self.locks
            .iter()
            .filter(|(_, l)| l.is_live(now))
            .map(|(id, l)| (id.clone(), l.clone()))
            .collect()
    }

    /// Live locks held by `user_id`, ordered by entity.
    pub fn owned_by(&self, user_id: &str, now: Timestamp) -> Vec<EntityLock> {
        let mut owned: Vec<EntityLock> = self
            .locks
            .values()
            .filter(|l| l.owner_user_id == user_id && l.is_live(now))
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        owned
    }

    /// Drop every expired lock and return what was dropped.
    pub fn prune_expired(&mut self, now: Timestamp) -> Vec<EntityLock> {
        let expired: Vec<EntityId> = self
            .locks
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.entity_id.clone())
            .collect();
        let mut pruned: Vec<EntityLock> = expired
            .iter()
            .filter_map(|id| self.locks.remove(id))
            .collect();
        pruned.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "Pruned expired locks");
        }
        pruned
    }

    /// Apply a grant or renewal broadcast by a peer.
    ///
    /// When the entity is live-locked locally by someone else, the earlier
    /// grant wins (`acquired_at`, then owner id), so every replica settles
    /// on the same owner once both grants have been seen. Expired grants are
    /// ignored.
    pub fn apply_grant(&mut self, lock: EntityLock, now: Timestamp) -> RemoteLockOutcome {
        if !lock.is_live(now) {
            return RemoteLockOutcome::Ignored;
        }
        match self.current(&lock.entity_id, now).cloned() {
            Some(existing) if existing.owner_user_id != lock.owner_user_id => {
                if precedes(&existing, &lock) {
                    tracing::debug!(
                        entity_id = %lock.entity_id,
                        local_owner = %existing.owner_user_id,
                        remote_owner = %lock.owner_user_id,
                        "Remote lock grant lost to earlier local grant"
                    );
                    RemoteLockOutcome::Contested {
                        local_owner: existing.owner_user_id,
                    }
                } else {
                    tracing::debug!(
                        entity_id = %lock.entity_id,
                        local_owner = %existing.owner_user_id,
                        remote_owner = %lock.owner_user_id,
                        "Earlier remote lock grant displaced local grant"
                    );
                    self.locks.insert(lock.entity_id.clone(), lock);
                    RemoteLockOutcome::Displaced { previous: existing }
                }
            }
            _ => {
                self.locks.insert(lock.entity_id.clone(), lock);
                RemoteLockOutcome::Applied
            }
        }
    }

    /// Apply a release broadcast by a peer.
    pub fn apply_release(&mut self, entity_id: &str, user_id: &str) -> RemoteLockOutcome {
        if self.release(entity_id, user_id) {
            RemoteLockOutcome::Applied
        } else {
            RemoteLockOutcome::Ignored
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
