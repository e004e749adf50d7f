use std::path::PathBuf;
use thiserror::Error;

use crate::{EntityKind, LocalId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open local store at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} record {local_id} not found")]
    NotFound { kind: EntityKind, local_id: LocalId },

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("local reset requires explicit confirmation")]
    ResetNotConfirmed,

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
