/// Remote repository client
///
/// Row CRUD over the shared cloud tables, pattern and range queries, blob
/// upload to per-kind buckets and a realtime insert feed. Two backends:
/// - `MemoryRemote` (in-process, used by tests and the offline demo)
/// - `RestRemote` (PostgREST rows, storage objects, Phoenix realtime)
pub mod error;
pub mod mapping;
pub mod memory;
pub mod query;
pub mod realtime;
pub mod rest;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use error::{RemoteError, Result};
pub use mapping::{from_remote, to_remote};
pub use memory::MemoryRemote;
pub use query::{Filter, Order, SelectQuery};
pub use rest::RestRemote;

/// One row as exchanged with the server
pub type RemoteRow = serde_json::Map<String, serde_json::Value>;

/// Callback invoked for every row inserted remotely
pub type InsertHandler = Arc<dyn Fn(RemoteRow) + Send + Sync>;

/// Live realtime subscription; dropping it stops delivery
#[derive(Debug)]
pub struct Subscription {
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait::async_trait]
pub trait RemoteRepository: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a row and return it as stored, server fields included
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow>;

    /// Insert or update the row whose `on_conflict` column matches
    async fn upsert(&self, table: &str, on_conflict: &str, row: RemoteRow) -> Result<RemoteRow>;

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<RemoteRow>>;

    /// Store `bytes` under `bucket/path` and return its stable public URL
    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;

    async fn subscribe_inserts(&self, table: &str, handler: InsertHandler) -> Result<Subscription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Rest,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: BackendKind,

    /// Project base URL, e.g. `https://xyz.supabase.co`
    pub url: Option<String>,

    pub api_key: Option<String>,

    /// Database schema the tables live in
    pub schema: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            url: None,
            api_key: None,
            schema: "public".to_string(),
        }
    }
}

impl RemoteConfig {
    pub fn rest(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Rest,
            url: Some(url.into()),
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

/// Create a repository from configuration
pub struct RemoteFactory;

impl RemoteFactory {
    pub fn create(config: &RemoteConfig) -> Result<Arc<dyn RemoteRepository>> {
        match config.backend {
            BackendKind::Memory => Ok(Arc::new(MemoryRemote::new())),
            BackendKind::Rest => Ok(Arc::new(RestRemote::new(config)?)),
        }
    }
}
