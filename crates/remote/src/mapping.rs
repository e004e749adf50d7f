//! Local record ↔ remote row mapping.
//!
//! A row carries an envelope (sync id, status, official id, timestamps and the
//! server `id`), one column per entry of the kind's field table, and a JSON
//! catch-all column with every other payload key. Keys whose value is `null`
//! always travel in the catch-all so that an explicit null survives the trip.
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use store::{EntityKind, LocalRecord, RecordStatus, RemoteSnapshot, SyncId};
use uuid::Uuid;

use crate::query::as_text;
use crate::{RemoteError, RemoteRow, Result};

pub const REMOTE_ID_COLUMN: &str = "id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const DELETED_AT_COLUMN: &str = "deleted_at";

/// Build the row written for `record`. The server `id` is never sent.
pub fn to_remote(kind: EntityKind, record: &LocalRecord) -> Result<RemoteRow> {
    let Value::Object(payload) = &record.payload else {
        return Err(RemoteError::Mapping(format!(
            "{kind} {} payload is not an object",
            record.local_id
        )));
    };

    let mut row = Map::new();
    row.insert(
        kind.sync_id_column().to_string(),
        Value::String(record.sync_id.to_string()),
    );
    row.insert(
        kind.status_column().to_string(),
        Value::String(record.status.as_str().to_string()),
    );
    if let Some(numbering) = kind.numbering() {
        row.insert(
            numbering.column.to_string(),
            record
                .official_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
    }
    row.insert(CREATED_AT_COLUMN.to_string(), Value::String(record.created_at.to_rfc3339()));
    row.insert(UPDATED_AT_COLUMN.to_string(), Value::String(record.updated_at.to_rfc3339()));
    row.insert(
        DELETED_AT_COLUMN.to_string(),
        record
            .deleted_at
            .map(|d| Value::String(d.to_rfc3339()))
            .unwrap_or(Value::Null),
    );

    let mut extra = Map::new();
    for (key, value) in payload {
        match kind.fields().iter().find(|f| f.local == key) {
            Some(field) if !value.is_null() => {
                row.insert(field.remote.to_string(), value.clone());
            }
            _ => {
                extra.insert(key.clone(), value.clone());
            }
        }
    }
    row.insert(kind.catch_all_column().to_string(), Value::Object(extra));
    Ok(row)
}

/// Read a remote row back into the local shape
pub fn from_remote(kind: EntityKind, row: &RemoteRow) -> Result<RemoteSnapshot> {
    let raw_sync = row
        .get(kind.sync_id_column())
        .and_then(as_text)
        .ok_or_else(|| {
            RemoteError::Mapping(format!(
                "{} row without {}",
                kind.remote_table(),
                kind.sync_id_column()
            ))
        })?;
    let sync_id = Uuid::parse_str(&raw_sync)
        .map(SyncId)
        .map_err(|e| RemoteError::Mapping(format!("bad sync id {raw_sync:?}: {e}")))?;

    let status = row
        .get(kind.status_column())
        .and_then(Value::as_str)
        .map(RecordStatus::parse)
        .unwrap_or_default();
    let official_id = kind
        .numbering()
        .and_then(|n| row.get(n.column))
        .and_then(as_text);
    let remote_id = row.get(REMOTE_ID_COLUMN).and_then(as_text);

    let mut payload = Map::new();
    let mut envelope: Vec<&str> = vec![
        REMOTE_ID_COLUMN,
        CREATED_AT_COLUMN,
        UPDATED_AT_COLUMN,
        DELETED_AT_COLUMN,
        kind.sync_id_column(),
        kind.status_column(),
        kind.catch_all_column(),
    ];
    if let Some(n) = kind.numbering() {
        envelope.push(n.column);
    }

    for (column, value) in row {
        if envelope.contains(&column.as_str()) || value.is_null() {
            continue;
        }
        match kind.fields().iter().find(|f| f.remote == column) {
            Some(field) => {
                payload.insert(field.local.to_string(), value.clone());
            }
            None => {
                tracing::debug!(%kind, column, "unmapped remote column kept in payload");
                payload.insert(column.clone(), value.clone());
            }
        }
    }

    match row.get(kind.catch_all_column()) {
        Some(Value::Object(extra)) => {
            for (k, v) in extra {
                payload.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        // Some deployments store the catch-all as a JSON string
        Some(Value::String(raw)) => match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(extra) => {
                for (k, v) in extra {
                    payload.entry(k).or_insert(v);
                }
            }
            Err(e) => {
                return Err(RemoteError::Mapping(format!(
                    "{} column is not a JSON object: {e}",
                    kind.catch_all_column()
                )))
            }
        },
        _ => {}
    }

    Ok(RemoteSnapshot {
        sync_id,
        remote_id,
        official_id,
        status,
        payload: Value::Object(payload),
        created_at: timestamp(row.get(CREATED_AT_COLUMN)),
        updated_at: timestamp(row.get(UPDATED_AT_COLUMN)),
    })
}

fn timestamp(v: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = v?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
