//! Contract for the versioned row/document store.
//!
//! The collaboration layer never enforces versions itself; a save is
//! committed through [`PersistenceApi`] with the version the editor started
//! from, and a stale version fails with [`PersistenceError::VersionConflict`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, EntityId, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {entity_id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_id: EntityId,
        expected: i64,
        actual: i64,
    },

    #[error("Persistence backend error: {0}")]
    Backend(String),
}

/// One editable row (cell or text block) with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRow {
    pub entity_id: EntityId,
    pub document_id: DocumentId,
    pub version: i64,
    pub fields: serde_json::Value,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: DocumentId,
    pub version: i64,
    pub title: String,
    pub updated_at: Timestamp,
}

#[async_trait]
pub trait PersistenceApi: Send + Sync {
    async fn get_row(&self, entity_id: &str) -> Result<VersionedRow, PersistenceError>;

    /// Write `fields` if the stored version equals `expected_version`.
    /// Returns the row with its bumped version.
    async fn update_row(
        &self,
        entity_id: &str,
        expected_version: i64,
        fields: serde_json::Value,
    ) -> Result<VersionedRow, PersistenceError>;

    async fn delete_row(&self, entity_id: &str) -> Result<(), PersistenceError>;

    async fn get_document(&self, document_id: &str) -> Result<DocumentRecord, PersistenceError>;
}

/// Fail with `VersionConflict` unless `expected == actual`.
pub fn check_version(entity_id: &str, expected: i64, actual: i64) -> Result<(), PersistenceError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PersistenceError::VersionConflict {
            entity_id: entity_id.to_string(),
            expected,
            actual,
        })
    }
}

/// In-process [`PersistenceApi`] for development and tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: Mutex<HashMap<EntityId, VersionedRow>>,
    documents: Mutex<HashMap<DocumentId, DocumentRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_row(&self, row: VersionedRow) -> Result<(), PersistenceError> {
        self.rows
            .lock()
            .map_err(|_| PersistenceError::Backend("row table poisoned".into()))?
            .insert(row.entity_id.clone(), row);
        Ok(())
    }

    pub fn insert_document(&self, document: DocumentRecord) -> Result<(), PersistenceError> {
        self.documents
            .lock()
            .map_err(|_| PersistenceError::Backend("document table poisoned".into()))?
            .insert(document.document_id.clone(), document);
        Ok(())
    }
}

#[async_trait]
impl PersistenceApi for MemoryPersistence {
    async fn get_row(&self, entity_id: &str) -> Result<VersionedRow, PersistenceError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::Backend("row table poisoned".into()))?;
        rows.get(entity_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("row {entity_id}")))
    }

    async fn update_row(
        &self,
        entity_id: &str,
        expected_version: i64,
        fields: serde_json::Value,
    ) -> Result<VersionedRow, PersistenceError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::Backend("row table poisoned".into()))?;
        let row = rows
            .get_mut(entity_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("row {entity_id}")))?;
        check_version(entity_id, expected_version, row.version)?;
        row.version += 1;
        row.fields = fields;
        row.updated_at = chrono::Utc::now();
        Ok(row.clone())
    }

    async fn delete_row(&self, entity_id: &str) -> Result<(), PersistenceError> {
        self.rows
            .lock()
            .map_err(|_| PersistenceError::Backend("row table poisoned".into()))?
            .remove(entity_id)
            .map(|_| ())
            .ok_or_else(|| PersistenceError::NotFound(format!("row {entity_id}")))
    }

    async fn get_document(&self, document_id: &str) -> Result<DocumentRecord, PersistenceError> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| PersistenceError::Backend("document table poisoned".into()))?;
        documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("document {document_id}")))
    }
}
