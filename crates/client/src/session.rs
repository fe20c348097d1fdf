//! One document's replica wired to its channel.
//!
//! Every action runs against the replica under a `std::sync::Mutex` and
//! publishes the queued events before the lock is released; notices are
//! fanned out afterwards. No await point is ever held across the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use reqcollab_core::clock::SharedClock;
use reqcollab_core::conflict::{ConflictSignal, EditingIntent};
use reqcollab_core::error::CoreError;
use reqcollab_core::locks::EntityLock;
use reqcollab_core::presence::{PresenceIdentity, UserPresence};
use reqcollab_core::protocol::{ChannelMessage, CollabEvent};
use reqcollab_core::replica::{DocumentReplica, DocumentSnapshot, ReplicaNotice, TickReport};
use reqcollab_core::settings::CollabSettings;
use reqcollab_core::types::{ClientId, DocumentId, Timestamp};
use reqcollab_events::{RealtimeChannel, Transport, TransportSignal};

use crate::error::SessionError;

/// Buffer for UI notices; a slow UI sees `Lagged` rather than blocking.
const NOTICE_CAPACITY: usize = 256;

pub struct DocumentSession {
    document_id: DocumentId,
    client_id: ClientId,
    clock: SharedClock,
    channel: RealtimeChannel,
    replica: Mutex<DocumentReplica>,
    conflicts: watch::Sender<Vec<ConflictSignal>>,
    notices: broadcast::Sender<ReplicaNotice>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DocumentSession {
    /// Connect to the document's channel, start applying remote events and
    /// ask peers for their state.
    pub async fn open(
        transport: &dyn Transport,
        document_id: &str,
        settings: CollabSettings,
        clock: SharedClock,
    ) -> Result<Arc<Self>, SessionError> {
        settings.validate()?;
        let channel = transport.connect(document_id).await?;
        let (conflicts, _) = watch::channel(Vec::new());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let session = Arc::new(Self {
            document_id: document_id.to_string(),
            client_id: Uuid::new_v4(),
            clock,
            channel,
            replica: Mutex::new(DocumentReplica::new(document_id, settings)),
            conflicts,
            notices,
            event_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        let task = session.channel.on_event(move |signal| {
            if let Some(session) = weak.upgrade() {
                session.handle_signal(signal);
            }
        });
        *session
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        session.with_replica(|replica, _| replica.request_sync());
        tracing::info!(
            document_id = %session.document_id,
            client_id = %session.client_id,
            "Opened collaboration session"
        );
        Ok(session)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Run `f` against the replica and publish whatever it queued, then
    /// forward its notices.
    ///
    /// Publishing happens under the replica lock so the channel sees events
    /// in the order the replica produced them. `publish` never blocks.
    pub(crate) fn with_replica<R>(
        &self,
        f: impl FnOnce(&mut DocumentReplica, Timestamp) -> R,
    ) -> R {
        let now = self.clock.now();
        let (result, notices, conflicts) = {
            let mut replica = self.replica.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut replica, now);
            self.publish(replica.take_outbox(), now);
            let notices = replica.take_notices();
            let conflicts = notices
                .iter()
                .any(|n| matches!(n, ReplicaNotice::Conflict(_)))
                .then(|| replica.conflict_signals(now));
            (result, notices, conflicts)
        };

        for notice in notices {
            let _ = self.notices.send(notice);
        }
        if let Some(signals) = conflicts {
            self.conflicts.send_replace(signals);
        }
        result
    }

    /// Read-only access to the replica.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&DocumentReplica, Timestamp) -> R) -> R {
        let now = self.clock.now();
        let replica = self.replica.lock().unwrap_or_else(PoisonError::into_inner);
        f(&replica, now)
    }

    fn publish(&self, events: Vec<CollabEvent>, now: Timestamp) {
        for event in events {
            let name = event.name();
            let message = ChannelMessage::new(self.document_id.clone(), self.client_id, now, event);
            if let Err(e) = self.channel.publish(message) {
                tracing::debug!(
                    document_id = %self.document_id,
                    event = name,
                    error = %e,
                    "Publish skipped"
                );
            }
        }
    }

    fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Message(message) => {
                if message.client_id == self.client_id {
                    return;
                }
                self.with_replica(|replica, now| replica.apply_remote(&message, now));
            }
            TransportSignal::Connected { resumed } => {
                if resumed {
                    tracing::info!(document_id = %self.document_id, "Channel resumed, re-syncing");
                }
                self.with_replica(|replica, now| {
                    replica.announce(now);
                    replica.request_sync();
                });
            }
            TransportSignal::Disconnected => {
                tracing::warn!(
                    document_id = %self.document_id,
                    "Channel lost, presence frozen until it resumes"
                );
            }
            TransportSignal::Lagged(skipped) => {
                tracing::warn!(document_id = %self.document_id, skipped, "Missed channel events, re-syncing");
                self.with_replica(|replica, _| replica.request_sync());
            }
        }
    }

    pub fn join(&self, identity: PresenceIdentity) -> Result<UserPresence, CoreError> {
        self.with_replica(|replica, now| replica.join(identity, now))
    }

    /// Remove a local user. The session closes once no local user remains.
    pub fn leave_user(&self, user_id: &str) -> Option<UserPresence> {
        let (left, remaining) = self.with_replica(|replica, now| {
            let left = replica.leave(user_id, now);
            (left, replica.local_user_ids().len())
        });
        if remaining == 0 {
            self.close();
        }
        left
    }

    /// One reconciliation cycle.
    pub fn reconcile(&self) -> TickReport {
        let report = self.with_replica(|replica, now| replica.tick(now));
        if !report.evicted.is_empty() || !report.pruned.is_empty() {
            tracing::debug!(
                document_id = %self.document_id,
                evicted = report.evicted.len(),
                released = report.released.len(),
                pruned = report.pruned.len(),
                "Reconciled"
            );
        }
        report
    }

    /// Stop applying remote events.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        tracing::info!(document_id = %self.document_id, "Closed collaboration session");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_conflicts(&self) -> watch::Receiver<Vec<ConflictSignal>> {
        self.conflicts.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ReplicaNotice> {
        self.notices.subscribe()
    }

    pub fn lock_for(&self, entity_id: &str) -> Option<EntityLock> {
        self.read(|replica, now| replica.lock_for(entity_id, now))
    }

    /// Open editors known to this session, ordered by user.
    pub fn intents(&self) -> Vec<EditingIntent> {
        self.read(|replica, _| replica.intents())
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.read(|replica, now| replica.snapshot(now))
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
