//! Shares one [`DocumentSession`] per document.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use reqcollab_core::clock::SharedClock;
use reqcollab_core::presence::PresenceIdentity;
use reqcollab_core::settings::CollabSettings;
use reqcollab_core::types::DocumentId;
use reqcollab_events::Transport;

use crate::error::SessionError;
use crate::handle::CollabHandle;
use crate::session::DocumentSession;

/// Opens document sessions on a transport and hands out handles to them.
///
/// Thread-safe; designed to be wrapped in `Arc` and shared.
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    settings: CollabSettings,
    clock: SharedClock,
    sessions: Mutex<HashMap<DocumentId, Arc<DocumentSession>>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, settings: CollabSettings, clock: SharedClock) -> Self {
        Self {
            transport,
            settings,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CollabSettings {
        &self.settings
    }

    /// Join `document_id` as `identity`, reusing the document's session if
    /// one is open. Joining again as the same user replaces their presence.
    pub async fn open(
        &self,
        document_id: &str,
        identity: PresenceIdentity,
    ) -> Result<CollabHandle, SessionError> {
        identity.validate()?;
        let session = self.observe(document_id).await?;

        let user_id = identity.user_id.clone();
        session.join(identity)?;
        tracing::debug!(document_id = %document_id, user_id = %user_id, "Opened collaboration handle");
        Ok(CollabHandle::new(session, user_id))
    }

    /// Follow `document_id` without joining it. The session applies every
    /// peer's events, so its replica is a read-only view of the document.
    pub async fn observe(&self, document_id: &str) -> Result<Arc<DocumentSession>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(document_id).filter(|s| !s.is_closed()) {
            return Ok(Arc::clone(session));
        }
        let session = DocumentSession::open(
            self.transport.as_ref(),
            document_id,
            self.settings,
            Arc::clone(&self.clock),
        )
        .await?;
        sessions.insert(document_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Close and forget a document's session without leaving. Returns false
    /// when no session was open.
    pub async fn close(&self, document_id: &str) -> bool {
        match self.sessions.lock().await.remove(document_id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Ids of documents with an open session, sorted.
    pub async fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .sessions()
            .await
            .iter()
            .map(|s| s.document_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub async fn session(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions
            .lock()
            .await
            .get(document_id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Open sessions, dropping any that have closed.
    pub async fn sessions(&self) -> Vec<Arc<DocumentSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, s| !s.is_closed());
        sessions.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions().await.len()
    }

    /// Run one reconciliation cycle on every open session. Returns how many
    /// sessions were reconciled.
    pub async fn reconcile_all(&self) -> usize {
        let sessions = self.sessions().await;
        for session in &sessions {
            session.reconcile();
        }
        sessions.len()
    }

    /// Leave every document as every local user and close the sessions.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<DocumentSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            let users = session.read(|r, _| r.local_user_ids());
            for user_id in users {
                session.leave_user(&user_id);
            }
            session.close();
        }
        tracing::info!(count, "Closed all collaboration sessions");
    }
}
