/// Identifies a user across documents.
pub type UserId = String;

/// Stable id of an editable entity (table cell or text block).
pub type EntityId = String;

/// Identifies a document; one realtime channel exists per document.
pub type DocumentId = String;

/// Identifies one client session (browser tab) on a channel.
pub type ClientId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
