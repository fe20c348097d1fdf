//! Advisory conflict detection over editing intents.
//!
//! A [`ConflictSignal`] is raised for an entity whenever two or more
//! distinct users have an editing intent on it that was started or
//! refreshed within the conflict window. Signals never block a write.

use std::collections::{BTreeMap, HashMap};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaboration::EntityType;
use crate::presence::{PresenceStore, UserPresence};
use crate::types::{EntityId, Timestamp, UserId};

/// A user has an inline editor open on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingIntent {
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub started_at: Timestamp,
    /// Bumped by the owner's heartbeat while the editor stays open.
    pub refreshed_at: Timestamp,
}

impl EditingIntent {
    pub fn new(
        user_id: impl Into<UserId>,
        entity_id: impl Into<EntityId>,
        entity_type: EntityType,
        at: Timestamp,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            entity_type,
            started_at: at,
            refreshed_at: at,
        }
    }

    fn last_active(&self) -> Timestamp {
        self.started_at.max(self.refreshed_at)
    }
}

/// Several users are editing the same entity at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSignal {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub conflicting_users: Vec<UserPresence>,
}

impl ConflictSignal {
    pub fn user_ids(&self) -> Vec<&str> {
        self.conflicting_users
            .iter()
            .map(|u| u.user_id.as_str())
            .collect()
    }
}

/// Current editing intents, at most one per user.
#[derive(Debug)]
pub struct ConflictDetector {
    window: Duration,
    intents: HashMap<UserId, EditingIntent>,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            intents: HashMap::new(),
        }
    }

    /// Record an intent, superseding the user's previous one.
    pub fn begin(&mut self, intent: EditingIntent) -> Option<EditingIntent> {
        self.intents.insert(intent.user_id.clone(), intent)
    }

    /// Clear the user's intent if it targets `entity_id`.
    pub fn end(&mut self, user_id: &str, entity_id: &str) -> bool {
        let matches = self
            .intents
            .get(user_id)
            .is_some_and(|i| i.entity_id == entity_id);
        if matches {
            self.intents.remove(user_id);
        }
        matches
    }

    /// Keep the user's open intent inside the window.
    pub fn refresh(&mut self, user_id: &str, at: Timestamp) -> Option<&EditingIntent> {
        let intent = self.intents.get_mut(user_id)?;
        intent.refreshed_at = at;
        Some(intent)
    }

    pub fn clear_user(&mut self, user_id: &str) -> Option<EditingIntent> {
        self.intents.remove(user_id)
    }

    pub fn intent_of(&self, user_id: &str) -> Option<&EditingIntent> {
        self.intents.get(user_id)
    }

    /// Every intent, ordered by user.
    pub fn intents(&self) -> Vec<EditingIntent> {
        let mut intents: Vec<EditingIntent> = self.intents.values().cloned().collect();
        intents.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        intents
    }

    /// Intents active within the window as of `now`.
    fn active_intents(&self, now: Timestamp) -> impl Iterator<Item = &EditingIntent> {
        let cutoff = now - self.window;
        self.intents
            .values()
            .filter(move |i| i.last_active() >= cutoff)
    }

    /// Compute conflict signals, ordered by entity id. Users in each signal
    /// are ordered by user id and resolved against `presence`.
    pub fn signals(&self, now: Timestamp, presence: &PresenceStore) -> Vec<ConflictSignal> {
        let mut by_entity: BTreeMap<&str, Vec<&EditingIntent>> = BTreeMap::new();
        for intent in self.active_intents(now) {
            by_entity
                .entry(intent.entity_id.as_str())
                .or_default()
                .push(intent);
        }

        by_entity
            .into_iter()
            .filter(|(_, intents)| intents.len() >= 2)
            .map(|(entity_id, mut intents)| {
                intents.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                let conflicting_users = intents
                    .iter()
                    .map(|i| {
                        presence
                            .get(&i.user_id)
                            .cloned()
                            .unwrap_or_else(|| UserPresence::placeholder(&i.user_id, now))
                    })
                    .collect();
                ConflictSignal {
                    entity_id: entity_id.to_string(),
                    entity_type: intents[0].entity_type,
                    conflicting_users,
                }
            })
            .collect()
    }

    pub fn conflicts_by_entity(
        &self,
        now: Timestamp,
        presence: &PresenceStore,
    ) -> HashMap<EntityId, ConflictSignal> {
        self.signals(now, presence)
            .into_iter()
            .map(|s| (s.entity_id.clone(), s))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

/// A change in the set of raised signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChange {
    Raised(ConflictSignal),
    Updated(ConflictSignal),
    Cleared { entity_id: EntityId },
}

/// Remembers the last signal set so successive computations can be
/// reported as raised/updated/cleared.
#[derive(Debug, Default)]
pub struct ConflictTracker {
    last: BTreeMap<EntityId, Vec<UserId>>,
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, signals: &[ConflictSignal]) -> Vec<ConflictChange> {
        let mut next: BTreeMap<EntityId, Vec<UserId>> = BTreeMap::new();
        let mut changes = Vec::new();

        for signal in signals {
            let users: Vec<UserId> = signal
                .conflicting_users
                .iter()
                .map(|u| u.user_id.clone())
                .collect();
            match self.last.get(&signal.entity_id) {
                None => changes.push(ConflictChange::Raised(signal.clone())),
                Some(prev) if *prev != users => {
                    changes.push(ConflictChange::Updated(signal.clone()))
                }
                Some(_) => {}
            }
            next.insert(signal.entity_id.clone(), users);
        }

        for entity_id in self.last.keys() {
            if !next.contains_key(entity_id) {
                changes.push(ConflictChange::Cleared {
                    entity_id: entity_id.clone(),
                });
            }
        }

        self.last = next;
        changes
    }

    pub fn is_raised(&self, entity_id: &str) -> bool {
        self.last.contains_key(entity_id)
    }
}
