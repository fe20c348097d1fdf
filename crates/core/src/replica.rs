//! One participant's view of a document.
//!
//! [`DocumentReplica`] owns the presence store, lock table and conflict
//! detector for a document and knows how to apply both local actions and
//! events received from peers. It performs no I/O: local actions queue the
//! events that must be broadcast in an outbox, and noteworthy changes for
//! the UI (conflicts raised or cleared, a lock taken away) queue up as
//! [`ReplicaNotice`]s. The caller drains both after each call.
//!
//! Presence is owned by its user. Remote events that describe a user who
//! joined through this replica are ignored; the local view of a local user
//! is authoritative.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::collaboration::{validate_entity_id, EntityType};
use crate::conflict::{ConflictChange, ConflictDetector, ConflictSignal, ConflictTracker, EditingIntent};
use crate::error::{CoreError, LockError};
use crate::locks::{EntityLock, LockManager, RemoteLockOutcome};
use crate::presence::{CursorPosition, PresenceIdentity, PresenceStore, SelectionRange, UserPresence};
use crate::protocol::{ChannelMessage, CollabEvent, IntentEvent, LockEvent, PresenceEvent, SyncEvent};
use crate::settings::CollabSettings;
use crate::types::{DocumentId, EntityId, Timestamp, UserId};

/// Something the UI should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaNotice {
    Conflict(ConflictChange),
    /// A local user's lock was displaced by an earlier grant from a peer.
    LockLost(EntityLock),
    /// A peer stopped sending heartbeats and was removed.
    PeerEvicted(UserId),
}

/// What one reconciliation tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub renewed: Vec<EntityLock>,
    pub evicted: Vec<UserId>,
    pub released: Vec<EntityLock>,
    pub pruned: Vec<EntityLock>,
}

/// Serializable read view of a replica.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub users: Vec<UserPresence>,
    pub locks: Vec<EntityLock>,
    pub conflicts: Vec<ConflictSignal>,
    pub taken_at: Timestamp,
}

#[derive(Debug)]
pub struct DocumentReplica {
    document_id: DocumentId,
    settings: CollabSettings,
    local_users: HashSet<UserId>,
    presence: PresenceStore,
    locks: LockManager,
    conflicts: ConflictDetector,
    tracker: ConflictTracker,
    outbox: Vec<CollabEvent>,
    notices: Vec<ReplicaNotice>,
    needs_sync: bool,
}

impl DocumentReplica {
    pub fn new(document_id: impl Into<DocumentId>, settings: CollabSettings) -> Self {
        let document_id = document_id.into();
        Self {
            presence: PresenceStore::new(document_id.clone()),
            locks: LockManager::new(settings.lock_ttl),
            conflicts: ConflictDetector::new(settings.intent_window()),
            tracker: ConflictTracker::new(),
            document_id,
            settings,
            local_users: HashSet::new(),
            outbox: Vec::new(),
            notices: Vec::new(),
            needs_sync: false,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn settings(&self) -> &CollabSettings {
        &self.settings
    }

    pub fn is_local(&self, user_id: &str) -> bool {
        self.local_users.contains(user_id)
    }

    /// Users who joined through this replica, sorted.
    pub fn local_user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.local_users.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Events queued for broadcast since the last drain.
    pub fn take_outbox(&mut self) -> Vec<CollabEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// UI notices queued since the last drain.
    pub fn take_notices(&mut self) -> Vec<ReplicaNotice> {
        std::mem::take(&mut self.notices)
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Join the document as a local user. Re-joining replaces the record.
    pub fn join(
        &mut self,
        identity: PresenceIdentity,
        now: Timestamp,
    ) -> Result<UserPresence, CoreError> {
        identity.validate()?;
        let presence = self.presence.join(identity, now);
        self.local_users.insert(presence.user_id.clone());
        self.outbox.push(
            PresenceEvent::Join {
                presence: presence.clone(),
            }
            .into(),
        );
        self.refresh_conflicts(now);
        Ok(presence)
    }

    pub fn update_cursor(
        &mut self,
        user_id: &str,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        now: Timestamp,
    ) -> Option<UserPresence> {
        if !self.is_local(user_id) {
            return None;
        }
        let presence = self
            .presence
            .update_cursor(user_id, cursor, selection, now)?
            .clone();
        self.outbox.push(Self::presence_update(&presence));
        Some(presence)
    }

    pub fn set_active(
        &mut self,
        user_id: &str,
        is_active: bool,
        now: Timestamp,
    ) -> Option<UserPresence> {
        if !self.is_local(user_id) || !self.presence.set_active(user_id, is_active, now) {
            return None;
        }
        let presence = self.presence.get(user_id)?.clone();
        self.outbox.push(Self::presence_update(&presence));
        Some(presence)
    }

    /// Leave the document: drops presence, releases the user's locks and
    /// clears their intent.
    pub fn leave(&mut self, user_id: &str, now: Timestamp) -> Option<UserPresence> {
        let was_local = self.local_users.remove(user_id);
        let removed = self.remove_user(user_id);
        if was_local {
            self.outbox.push(
                PresenceEvent::Leave {
                    user_id: user_id.to_string(),
                }
                .into(),
            );
        }
        self.refresh_conflicts(now);
        removed
    }

    /// Take the edit lock on `entity_id` for a local user.
    pub fn acquire_lock(
        &mut self,
        entity_id: &str,
        entity_type: EntityType,
        user_id: &str,
        now: Timestamp,
    ) -> Result<EntityLock, LockError> {
        self.check_local_action(user_id, entity_id)?;
        let lock = self.locks.acquire(entity_id, entity_type, user_id, now)?;
        self.outbox.push(LockEvent::Acquired { lock: lock.clone() }.into());
        Ok(lock)
    }

    pub fn renew_lock(
        &mut self,
        entity_id: &str,
        user_id: &str,
        now: Timestamp,
    ) -> Result<EntityLock, LockError> {
        self.check_local_action(user_id, entity_id)?;
        let lock = self.locks.renew(entity_id, user_id, now)?;
        self.outbox.push(LockEvent::Renewed { lock: lock.clone() }.into());
        Ok(lock)
    }

    /// Release a lock held by `user_id`. Anything else is a silent no-op.
    pub fn release_lock(&mut self, entity_id: &str, user_id: &str) -> bool {
        let released = self.locks.release(entity_id, user_id);
        if released {
            self.outbox.push(
                LockEvent::Released {
                    entity_id: entity_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into(),
            );
        }
        released
    }

    /// Open an inline editor: records and broadcasts an editing intent.
    pub fn begin_editing(
        &mut self,
        user_id: &str,
        entity_id: &str,
        entity_type: EntityType,
        now: Timestamp,
    ) -> Result<EditingIntent, CoreError> {
        self.check_local_action(user_id, entity_id)?;
        let intent = EditingIntent::new(user_id, entity_id, entity_type, now);
        self.conflicts.begin(intent.clone());
        self.outbox.push(
            IntentEvent::Begin {
                intent: intent.clone(),
            }
            .into(),
        );
        self.refresh_conflicts(now);
        Ok(intent)
    }

    /// Close the editor on `entity_id` (blur or save).
    pub fn end_editing(&mut self, user_id: &str, entity_id: &str, now: Timestamp) -> bool {
        let ended = self.conflicts.end(user_id, entity_id);
        if ended {
            self.outbox.push(
                IntentEvent::End {
                    user_id: user_id.to_string(),
                    entity_id: entity_id.to_string(),
                }
                .into(),
            );
            self.refresh_conflicts(now);
        }
        ended
    }

    /// Ask peers to re-announce their state (after a reconnect).
    pub fn request_sync(&mut self) {
        self.outbox.push(SyncEvent::Request.into());
    }

    /// Queue a full self-owned state announcement for every local user.
    pub fn announce(&mut self, now: Timestamp) {
        let mut local: Vec<&UserId> = self.local_users.iter().collect();
        local.sort();
        for user_id in local {
            let Some(presence) = self.presence.get(user_id) else {
                continue;
            };
            self.outbox.push(
                SyncEvent::State {
                    presence: presence.clone(),
                    locks: self.locks.owned_by(user_id, now),
                    intent: self.conflicts.intent_of(user_id).cloned(),
                }
                .into(),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// One reconciliation cycle: heartbeat local users, keep their open
    /// intents fresh, renew locks they are still editing under, evict silent
    /// peers (releasing their locks), and prune expired locks.
    pub fn tick(&mut self, now: Timestamp) -> TickReport {
        let mut report = TickReport::default();
        let local = self.local_user_ids();

        for user_id in &local {
            if self.presence.touch(user_id, now) {
                self.outbox.push(
                    PresenceEvent::Heartbeat {
                        user_id: user_id.clone(),
                    }
                    .into(),
                );
            }

            let Some(entity_id) = self
                .conflicts
                .refresh(user_id, now)
                .map(|i| i.entity_id.clone())
            else {
                continue;
            };
            self.outbox.push(
                IntentEvent::Refresh {
                    user_id: user_id.clone(),
                    entity_id: entity_id.clone(),
                }
                .into(),
            );

            if self.renewal_due(&entity_id, user_id, now) {
                if let Ok(lock) = self.renew_lock(&entity_id, user_id, now) {
                    report.renewed.push(lock);
                }
            }
        }

        let stale = self
            .presence
            .evict_stale(now, self.settings.presence_timeout);
        for user_id in stale {
            if self.is_local(&user_id) {
                continue;
            }
            tracing::debug!(
                document_id = %self.document_id,
                user_id = %user_id,
                "Evicting silent peer"
            );
            report.released.extend(self.locks.release_all(&user_id));
            self.conflicts.clear_user(&user_id);
            self.notices.push(ReplicaNotice::PeerEvicted(user_id.clone()));
            report.evicted.push(user_id);
        }

        report.pruned = self.locks.prune_expired(now);

        if self.needs_sync {
            self.needs_sync = false;
            self.request_sync();
        }

        self.refresh_conflicts(now);
        report
    }

    fn renewal_due(&self, entity_id: &str, user_id: &str, now: Timestamp) -> bool {
        match self.locks.peek(entity_id, now) {
            Some(lock) if lock.owner_user_id == user_id => {
                let last_renewed = lock.expires_at - self.locks.ttl();
                now - last_renewed >= self.settings.lock_renew_interval
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Remote events
    // -----------------------------------------------------------------------

    /// Apply one event received from the channel. Receive time (`now`), not
    /// the sender's clock, drives `last_seen` and the conflict window.
    pub fn apply_remote(&mut self, message: &ChannelMessage, now: Timestamp) {
        if message.document_id != self.document_id {
            tracing::warn!(
                expected = %self.document_id,
                got = %message.document_id,
                "Dropping event for another document"
            );
            return;
        }

        if let Some(subject) = message.event.subject() {
            if self.is_local(subject) && !matches!(message.event, CollabEvent::Lock(_)) {
                tracing::trace!(
                    event = message.event.name(),
                    user_id = %subject,
                    "Ignoring remote event about a local user"
                );
                return;
            }
        }

        match &message.event {
            CollabEvent::Presence(event) => self.apply_presence(event, now),
            CollabEvent::Lock(event) => self.apply_lock(event, now),
            CollabEvent::Intent(event) => self.apply_intent(event, now),
            CollabEvent::Sync(SyncEvent::Request) => self.announce(now),
            CollabEvent::Sync(SyncEvent::State {
                presence,
                locks,
                intent,
            }) => self.apply_state(presence, locks, intent.as_ref(), now),
        }

        self.refresh_conflicts(now);
    }

    fn apply_presence(&mut self, event: &PresenceEvent, now: Timestamp) {
        match event {
            PresenceEvent::Join { presence } => {
                self.presence.upsert(UserPresence {
                    last_seen: now,
                    ..presence.clone()
                });
            }
            PresenceEvent::Update {
                user_id,
                cursor,
                selection,
                is_active,
            } => {
                if self
                    .presence
                    .update_cursor(user_id, cursor.clone(), selection.clone(), now)
                    .is_some()
                {
                    self.presence.set_active(user_id, *is_active, now);
                } else {
                    self.needs_sync = true;
                }
            }
            PresenceEvent::Heartbeat { user_id } => {
                if !self.presence.touch(user_id, now) {
                    self.needs_sync = true;
                }
            }
            PresenceEvent::Leave { user_id } => {
                let released = self.locks.owned_by(user_id, now).len();
                self.remove_user(user_id);
                tracing::debug!(
                    document_id = %self.document_id,
                    user_id = %user_id,
                    released,
                    "Peer left"
                );
            }
        }
    }

    fn apply_lock(&mut self, event: &LockEvent, now: Timestamp) {
        match event {
            LockEvent::Acquired { lock } | LockEvent::Renewed { lock } => {
                match self.locks.apply_grant(lock.clone(), now) {
                    RemoteLockOutcome::Displaced { previous } => {
                        if self.is_local(&previous.owner_user_id) {
                            self.notices.push(ReplicaNotice::LockLost(previous));
                        }
                    }
                    RemoteLockOutcome::Contested { local_owner } if self.is_local(&local_owner) => {
                        // Re-announce our earlier grant in case the peer missed it.
                        if let Some(ours) = self.locks.peek(&lock.entity_id, now).cloned() {
                            self.outbox.push(LockEvent::Acquired { lock: ours }.into());
                        }
                    }
                    RemoteLockOutcome::Applied
                    | RemoteLockOutcome::Contested { .. }
                    | RemoteLockOutcome::Ignored => {}
                }
            }
            LockEvent::Released { entity_id, user_id } => {
                self.locks.apply_release(entity_id, user_id);
            }
        }
    }

    fn apply_intent(&mut self, event: &IntentEvent, now: Timestamp) {
        match event {
            IntentEvent::Begin { intent } => {
                self.conflicts.begin(EditingIntent {
                    refreshed_at: now,
                    ..intent.clone()
                });
            }
            IntentEvent::Refresh { user_id, entity_id } => {
                let current = self
                    .conflicts
                    .intent_of(user_id)
                    .is_some_and(|i| &i.entity_id == entity_id);
                if current {
                    self.conflicts.refresh(user_id, now);
                }
            }
            IntentEvent::End { user_id, entity_id } => {
                self.conflicts.end(user_id, entity_id);
            }
        }
    }

    fn apply_state(
        &mut self,
        presence: &UserPresence,
        locks: &[EntityLock],
        intent: Option<&EditingIntent>,
        now: Timestamp,
    ) {
        let user_id = presence.user_id.clone();
        self.presence.upsert(UserPresence {
            last_seen: now,
            ..presence.clone()
        });

        // The owner's list is authoritative for its own locks.
        let announced: HashSet<&str> = locks.iter().map(|l| l.entity_id.as_str()).collect();
        for stale in self.locks.owned_by(&user_id, now) {
            if !announced.contains(stale.entity_id.as_str()) {
                self.locks.release(&stale.entity_id, &user_id);
            }
        }
        for lock in locks.iter().filter(|l| l.owner_user_id == user_id) {
            self.apply_lock(&LockEvent::Acquired { lock: lock.clone() }, now);
        }

        match intent.filter(|i| i.user_id == user_id) {
            Some(intent) => {
                self.conflicts.begin(EditingIntent {
                    refreshed_at: now,
                    ..intent.clone()
                });
            }
            None => {
                self.conflicts.clear_user(&user_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn remove_user(&mut self, user_id: &str) -> Option<UserPresence> {
        let removed = self.presence.leave(user_id);
        self.locks.release_all(user_id);
        self.conflicts.clear_user(user_id);
        removed
    }

    fn presence_update(presence: &UserPresence) -> CollabEvent {
        PresenceEvent::Update {
            user_id: presence.user_id.clone(),
            cursor: presence.cursor.clone(),
            selection: presence.selection.clone(),
            is_active: presence.is_active,
        }
        .into()
    }

    /// Lock and intent actions are only taken by joined local users on
    /// entity ids peers will accept on the wire.
    fn check_local_action(&self, user_id: &str, entity_id: &str) -> Result<(), CoreError> {
        if !self.is_local(user_id) {
            return Err(CoreError::Validation(format!(
                "user '{user_id}' has not joined document '{}'",
                self.document_id
            )));
        }
        validate_entity_id(entity_id)
    }

    fn refresh_conflicts(&mut self, now: Timestamp) {
        let signals = self.conflicts.signals(now, &self.presence);
        for change in self.tracker.update(&signals) {
            self.notices.push(ReplicaNotice::Conflict(change));
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn active_users(&self) -> Vec<UserPresence> {
        self.presence.get_active_users()
    }

    pub fn lock_for(&self, entity_id: &str, now: Timestamp) -> Option<EntityLock> {
        self.locks.peek(entity_id, now).cloned()
    }

    pub fn locks_by_entity(&self, now: Timestamp) -> HashMap<EntityId, EntityLock> {
        self.locks.locks_by_entity(now)
    }

    pub fn conflict_signals(&self, now: Timestamp) -> Vec<ConflictSignal> {
        self.conflicts.signals(now, &self.presence)
    }

    pub fn conflicts_by_entity(&self, now: Timestamp) -> HashMap<EntityId, ConflictSignal> {
        self.conflicts.conflicts_by_entity(now, &self.presence)
    }

    pub fn intents(&self) -> Vec<EditingIntent> {
        self.conflicts.intents()
    }

    pub fn snapshot(&self, now: Timestamp) -> DocumentSnapshot {
        let mut locks: Vec<EntityLock> = self.locks.locks_by_entity(now).into_values().collect();
        locks.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        DocumentSnapshot {
            document_id: self.document_id.clone(),
            users: self.presence.users(),
            locks,
            conflicts: self.conflict_signals(now),
            taken_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    const DOC: &str = "doc-1";

    fn t0() -> Timestamp {
        ManualClock::at_epoch().now()
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn replica_for(user_id: &str, name: &str, now: Timestamp) -> DocumentReplica {
        let mut replica = DocumentReplica::new(DOC, CollabSettings::default());
        replica
            .join(PresenceIdentity::new(user_id, name), now)
            .expect("join");
        replica
    }

    /// Deliver everything `from` queued to `to`.
    fn relay(from: &mut DocumentReplica, to: &mut DocumentReplica, now: Timestamp) {
        for event in from.take_outbox() {
            let message = ChannelMessage::new(from.document_id(), Uuid::nil(), now, event);
            to.apply_remote(&message, now);
        }
    }

    fn exchange(a: &mut DocumentReplica, b: &mut DocumentReplica, now: Timestamp) {
        relay(a, b, now);
        relay(b, a, now);
        relay(a, b, now);
    }

    fn remote(event: impl Into<CollabEvent>, now: Timestamp) -> ChannelMessage {
        ChannelMessage::new(DOC, Uuid::new_v4(), now, event)
    }

    // -----------------------------------------------------------------------
    // Walkthrough
    // -----------------------------------------------------------------------

    #[test]
    fn two_users_on_one_cell() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        exchange(&mut a, &mut b, t);

        let lock = a
            .acquire_lock("C1", EntityType::Cell, "alice", t)
            .expect("alice acquires");
        assert_eq!(lock.expires_at, t + secs(30));
        exchange(&mut a, &mut b, t);

        let err = b
            .acquire_lock("C1", EntityType::Cell, "bob", t + secs(5))
            .unwrap_err();
        let denied = err.denied().expect("denied, not invalid");
        assert_eq!(denied.current_owner.as_deref(), Some("alice"));
        assert_eq!(denied.expires_at, Some(t + secs(30)));

        let at = t + secs(6);
        a.begin_editing("alice", "C1", EntityType::Cell, at).unwrap();
        b.begin_editing("bob", "C1", EntityType::Cell, at).unwrap();
        exchange(&mut a, &mut b, at);

        for replica in [&a, &b] {
            let conflicts = replica.conflicts_by_entity(at);
            let signal = conflicts.get("C1").expect("conflict on C1");
            assert_eq!(signal.user_ids(), vec!["alice", "bob"]);
        }
        assert!(a
            .take_notices()
            .iter()
            .any(|n| matches!(n, ReplicaNotice::Conflict(ConflictChange::Raised(s)) if s.entity_id == "C1")));

        let at = t + secs(10);
        assert!(b.end_editing("bob", "C1", at));
        exchange(&mut a, &mut b, at);

        assert!(a.conflicts_by_entity(at).is_empty());
        assert!(b.conflicts_by_entity(at).is_empty());
        assert_eq!(
            a.take_notices(),
            vec![ReplicaNotice::Conflict(ConflictChange::Cleared {
                entity_id: "C1".into()
            })]
        );

        let lock = b
            .acquire_lock("C1", EntityType::Cell, "bob", t + secs(31))
            .expect("expired lock is reclaimed");
        assert_eq!(lock.owner_user_id, "bob");
    }

    // -----------------------------------------------------------------------
    // Locks across replicas
    // -----------------------------------------------------------------------

    #[test]
    fn simultaneous_grants_converge_on_one_owner() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        exchange(&mut a, &mut b, t);

        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        b.acquire_lock("C1", EntityType::Cell, "bob", t).unwrap();
        exchange(&mut a, &mut b, t);

        let on_a = a.lock_for("C1", t).expect("lock on a");
        let on_b = b.lock_for("C1", t).expect("lock on b");
        assert_eq!(on_a.owner_user_id, "alice");
        assert_eq!(on_b.owner_user_id, "alice");

        let lost: Vec<_> = b
            .take_notices()
            .into_iter()
            .filter(|n| matches!(n, ReplicaNotice::LockLost(_)))
            .collect();
        assert_matches!(lost.as_slice(), [ReplicaNotice::LockLost(lock)] if lock.owner_user_id == "bob");
    }

    #[test]
    fn release_is_idempotent() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.take_outbox();

        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        assert!(a.release_lock("C1", "alice"));
        assert!(!a.release_lock("C1", "alice"));
        assert!(a.lock_for("C1", t).is_none());

        let releases = a
            .take_outbox()
            .into_iter()
            .filter(|e| matches!(e, CollabEvent::Lock(LockEvent::Released { .. })))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn non_owner_cannot_renew() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        exchange(&mut a, &mut b, t);

        let err = b.renew_lock("C1", "bob", t + secs(5)).unwrap_err();
        let denied = err.denied().expect("denied, not invalid");
        assert_eq!(denied.current_owner.as_deref(), Some("alice"));
        assert_eq!(
            b.lock_for("C1", t + secs(5)).map(|l| l.expires_at),
            Some(t + secs(30))
        );
    }

    #[test]
    fn remote_release_from_non_owner_is_ignored() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();

        a.apply_remote(
            &remote(
                LockEvent::Released {
                    entity_id: "C1".into(),
                    user_id: "mallory".into(),
                },
                t,
            ),
            t,
        );
        assert!(a.lock_for("C1", t).is_some());
    }

    // -----------------------------------------------------------------------
    // Disconnect cleanup
    // -----------------------------------------------------------------------

    #[test]
    fn peer_leave_releases_its_locks() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        a.begin_editing("alice", "C1", EntityType::Cell, t).unwrap();
        exchange(&mut a, &mut b, t);
        assert!(b.lock_for("C1", t).is_some());

        a.leave("alice", t + secs(1));
        relay(&mut a, &mut b, t + secs(1));

        assert!(b.lock_for("C1", t + secs(1)).is_none());
        assert!(b.presence().get("alice").is_none());
        assert!(b.intents().is_empty());
    }

    #[test]
    fn silent_peer_is_evicted_within_one_tick() {
        let t = t0();
        let settings = CollabSettings {
            presence_timeout: secs(20),
            heartbeat_interval: secs(5),
            ..CollabSettings::default()
        };
        let mut a = DocumentReplica::new(DOC, settings);
        a.join(PresenceIdentity::new("alice", "Alice"), t).unwrap();
        let mut b = DocumentReplica::new(DOC, settings);
        b.join(PresenceIdentity::new("bob", "Bob"), t).unwrap();
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        exchange(&mut a, &mut b, t);

        let report = b.tick(t + secs(21));

        assert_eq!(report.evicted, vec!["alice".to_string()]);
        assert_eq!(report.released.len(), 1);
        assert!(b.lock_for("C1", t + secs(21)).is_none());
        assert!(b
            .take_notices()
            .contains(&ReplicaNotice::PeerEvicted("alice".into())));
        assert!(b.presence().get("bob").is_some());
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    #[test]
    fn tick_renews_only_locks_still_being_edited() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        a.acquire_lock("C2", EntityType::Cell, "alice", t).unwrap();
        a.begin_editing("alice", "C1", EntityType::Cell, t).unwrap();
        a.take_outbox();

        let report = a.tick(t + secs(5));
        assert!(report.renewed.is_empty(), "renewal not yet due");

        let report = a.tick(t + secs(10));
        assert_eq!(report.renewed.len(), 1);
        assert_eq!(report.renewed[0].entity_id, "C1");
        assert_eq!(
            a.lock_for("C1", t + secs(10)).map(|l| l.expires_at),
            Some(t + secs(40))
        );
        assert_eq!(
            a.lock_for("C2", t + secs(10)).map(|l| l.expires_at),
            Some(t + secs(30))
        );

        let events: Vec<&str> = a.take_outbox().iter().map(CollabEvent::name).collect();
        assert!(events.contains(&"presence.heartbeat"));
        assert!(events.contains(&"intent.refresh"));
        assert!(events.contains(&"lock.renewed"));

        let report = a.tick(t + secs(31));
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].entity_id, "C2");
    }

    #[test]
    fn open_editor_stays_in_conflict_across_heartbeats() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        a.begin_editing("alice", "C1", EntityType::Cell, t).unwrap();
        b.begin_editing("bob", "C1", EntityType::Cell, t).unwrap();
        exchange(&mut a, &mut b, t);
        a.take_notices();

        for n in 1..=4 {
            let at = t + secs(10 * n);
            a.tick(at);
            b.tick(at);
            exchange(&mut a, &mut b, at);
            assert!(a.conflicts_by_entity(at).contains_key("C1"), "tick {n}");
        }
        assert!(a
            .take_notices()
            .iter()
            .all(|n| !matches!(n, ReplicaNotice::Conflict(ConflictChange::Cleared { .. }))));
    }

    #[test]
    fn abandoned_remote_intent_lapses() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.begin_editing("alice", "C1", EntityType::Cell, t).unwrap();
        a.apply_remote(
            &remote(
                IntentEvent::Begin {
                    intent: EditingIntent::new("bob", "C1", EntityType::Cell, t),
                },
                t,
            ),
            t,
        );
        assert!(a.conflicts_by_entity(t).contains_key("C1"));

        a.tick(t + secs(16));
        assert!(a.conflicts_by_entity(t + secs(16)).is_empty());
    }

    // -----------------------------------------------------------------------
    // Remote presence
    // -----------------------------------------------------------------------

    #[test]
    fn remote_events_about_local_user_are_ignored() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.apply_remote(
            &remote(
                PresenceEvent::Update {
                    user_id: "alice".into(),
                    cursor: Some(CursorPosition {
                        block_id: "b9".into(),
                        offset: 99,
                    }),
                    selection: None,
                    is_active: false,
                },
                t,
            ),
            t,
        );
        let alice = a.presence().get("alice").unwrap();
        assert!(alice.cursor.is_none());
        assert!(alice.is_active);
    }

    #[test]
    fn remote_join_uses_receive_time() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let skewed = UserPresence::from_identity(
            PresenceIdentity::new("bob", "Bob"),
            t - secs(3600),
        );
        a.apply_remote(&remote(PresenceEvent::Join { presence: skewed }, t), t);

        assert_eq!(a.presence().get("bob").map(|p| p.last_seen), Some(t));
        let users: Vec<String> = a.active_users().into_iter().map(|u| u.user_id).collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn cursor_update_is_broadcast() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        exchange(&mut a, &mut b, t);

        let cursor = CursorPosition {
            block_id: "b1".into(),
            offset: 4,
        };
        a.update_cursor("alice", Some(cursor.clone()), None, t + secs(1))
            .expect("local user");
        relay(&mut a, &mut b, t + secs(1));

        assert_eq!(
            b.presence().get("alice").and_then(|p| p.cursor.clone()),
            Some(cursor)
        );
        assert!(a.update_cursor("bob", None, None, t).is_none());
    }

    #[test]
    fn event_for_other_document_is_dropped() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let message = ChannelMessage::new(
            "doc-2",
            Uuid::new_v4(),
            t,
            PresenceEvent::Join {
                presence: UserPresence::from_identity(PresenceIdentity::new("bob", "Bob"), t),
            },
        );
        a.apply_remote(&message, t);
        assert!(a.presence().get("bob").is_none());
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    #[test]
    fn sync_request_is_answered_with_own_state() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        a.begin_editing("alice", "C1", EntityType::Cell, t).unwrap();
        a.take_outbox();

        a.apply_remote(&remote(SyncEvent::Request, t), t);

        let outbox = a.take_outbox();
        assert_matches!(
            outbox.as_slice(),
            [CollabEvent::Sync(SyncEvent::State { presence, locks, intent: Some(intent) })]
                if presence.user_id == "alice" && locks.len() == 1 && intent.entity_id == "C1"
        );
    }

    #[test]
    fn state_announcement_replaces_peer_locks() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        let mut b = replica_for("bob", "Bob", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        exchange(&mut a, &mut b, t);

        // The release was lost in transit.
        a.release_lock("C1", "alice");
        a.take_outbox();
        assert!(b.lock_for("C1", t).is_some());

        a.announce(t + secs(1));
        relay(&mut a, &mut b, t + secs(1));
        assert!(b.lock_for("C1", t + secs(1)).is_none());
    }

    #[test]
    fn heartbeat_from_unknown_peer_requests_sync() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.take_outbox();

        a.apply_remote(
            &remote(
                PresenceEvent::Heartbeat {
                    user_id: "bob".into(),
                },
                t,
            ),
            t,
        );
        a.tick(t + secs(1));
        assert!(a
            .take_outbox()
            .iter()
            .any(|e| matches!(e, CollabEvent::Sync(SyncEvent::Request))));
    }

    #[test]
    fn snapshot_lists_sorted_state() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.acquire_lock("C2", EntityType::Cell, "alice", t).unwrap();
        a.acquire_lock("C1", EntityType::TextBlock, "alice", t).unwrap();

        let snapshot = a.snapshot(t);
        assert_eq!(snapshot.document_id, DOC);
        let ids: Vec<&str> = snapshot.locks.iter().map(|l| l.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C2"]);
        assert_eq!(snapshot.users.len(), 1);
    }

    #[test]
    fn lock_on_unsendable_entity_id_is_rejected() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);

        let err = a
            .acquire_lock("row 7", EntityType::Cell, "alice", t)
            .unwrap_err();
        assert_matches!(err, LockError::Invalid(CoreError::Validation(_)));
        assert!(a.lock_for("row 7", t).is_none());
        assert!(a.take_outbox().iter().all(|e| !matches!(e, CollabEvent::Lock(_))));

        assert_matches!(
            a.renew_lock("", "alice", t),
            Err(LockError::Invalid(CoreError::Validation(_)))
        );
    }

    #[test]
    fn departed_user_cannot_lock_or_edit() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);
        a.acquire_lock("C1", EntityType::Cell, "alice", t).unwrap();
        a.leave("alice", t);
        a.take_outbox();

        assert_matches!(
            a.acquire_lock("C1", EntityType::Cell, "alice", t),
            Err(LockError::Invalid(_))
        );
        assert_matches!(a.renew_lock("C1", "alice", t), Err(LockError::Invalid(_)));
        assert_matches!(
            a.begin_editing("alice", "C1", EntityType::Cell, t),
            Err(CoreError::Validation(_))
        );
        assert!(a.lock_for("C1", t).is_none());
        assert!(a.take_outbox().is_empty());
    }

    #[test]
    fn remote_user_cannot_be_locked_for() {
        let t = t0();
        let mut a = replica_for("alice", "Alice", t);

        assert_matches!(
            a.acquire_lock("C1", EntityType::Cell, "bob", t),
            Err(LockError::Invalid(_))
        );
    }
}
