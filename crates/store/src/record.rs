use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::EntityKind;

/// Row identifier inside a local collection. Assigned by the store, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global identifier shared by every replica of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncId(pub Uuid);

impl SyncId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Draft,
    Submitted,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Deleted => "deleted",
        }
    }

    /// Unknown remote values degrade to draft
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "submitted" => Self::Submitted,
            "deleted" => Self::Deleted,
            _ => Self::Draft,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as owned by the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    pub local_id: LocalId,
    pub entity_kind: EntityKind,
    pub sync_id: SyncId,
    pub official_id: Option<String>,
    pub remote_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: RecordStatus,
    pub synced: bool,
    /// Bumped on every content write; sync completion is conditional on it
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_failure: SyncFailure,
}

impl LocalRecord {
    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::Deleted
    }
}

/// Bookkeeping for pushes that did not go through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub attempts: u32,
    pub rejections: u32,
    pub last_error: Option<String>,
    pub quarantined: bool,
}

/// Input for creating a record
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub sync_id: SyncId,
    pub payload: serde_json::Value,
    pub status: RecordStatus,
    pub official_id: Option<String>,
    pub remote_id: Option<String>,
    pub synced: bool,
}

impl NewRecord {
    /// A fresh, unsynced draft
    pub fn draft(payload: serde_json::Value) -> Self {
        Self {
            sync_id: SyncId::new(),
            payload,
            status: RecordStatus::Draft,
            official_id: None,
            remote_id: None,
            synced: false,
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_sync_id(mut self, sync_id: SyncId) -> Self {
        self.sync_id = sync_id;
        self
    }
}

/// Secondary indexes available on every collection
#[derive(Debug, Clone, PartialEq)]
pub enum RecordIndex {
    Synced(bool),
    SyncId(SyncId),
    OfficialId(String),
    RemoteId(String),
    Status(RecordStatus),
}

/// Outcome of a finished push, written back onto the record
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSync {
    pub expected_revision: i64,
    pub payload: serde_json::Value,
    pub status: RecordStatus,
    pub official_id: Option<String>,
    pub remote_id: Option<String>,
}

/// Authoritative remote copy, already mapped to the local shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub sync_id: SyncId,
    pub remote_id: Option<String>,
    pub official_id: Option<String>,
    pub status: RecordStatus,
    pub payload: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What happened to a local row when a remote copy was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Inserted(LocalId),
    Replaced(LocalId),
    MergedPending(LocalId),
}
