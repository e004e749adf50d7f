use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod blobs;
pub mod cache;
pub mod clock;
pub mod error;
pub mod kind;
pub mod migrations;
pub mod record;

pub use blobs::{PendingBlob, UploadTicket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use kind::{EntityKind, FieldMapping, Numbering};
pub use record::{
    CompletedSync, LocalId, LocalRecord, NewRecord, RecordIndex, RecordStatus, RemoteApply,
    RemoteSnapshot, SyncFailure, SyncId,
};

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("fieldsync")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("fieldsync.db")
}

const RECORD_COLUMNS: &str = "local_id, sync_id, official_id, remote_id, payload_json, status, synced, revision, \
     created_at, updated_at, deleted_at, attempts, rejections, last_error, quarantined";

/// Phrase a caller must pass to wipe the local store
pub const RESET_PHRASE: &str = "ERASE LOCAL DATA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetConfirmation(String);

impl ResetConfirmation {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(phrase.into())
    }

    pub fn confirmed() -> Self {
        Self(RESET_PHRASE.to_string())
    }

    pub fn is_confirmed(&self) -> bool {
        self.0 == RESET_PHRASE
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub records_removed: usize,
    pub blobs_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionCounts {
    pub total: usize,
    pub pending: usize,
    pub quarantined: usize,
}

/// Embedded SQLite store with one collection per entity kind
pub struct LocalStore {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("path", &self.path).finish()
    }
}

impl LocalStore {
    /// Open (creating if needed) and migrate the store at `path`.
    /// Failure is returned to the caller once; nothing here retries.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        configure(&conn).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        migrations::apply_migrations(&conn)?;
        tracing::debug!(?path, "local store opened");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::apply_migrations(&conn)?;
        Ok(Self {
            conn,
            path: None,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<u32> {
        migrations::applied_version(&self.conn)
    }

    pub fn backups(&self) -> Result<Vec<String>> {
        migrations::backup_tables(&self.conn)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    pub fn insert(&self, kind: EntityKind, new: NewRecord) -> Result<LocalId> {
        self.insert_with_blobs(kind, new, &[])
    }

    /// Insert a record and the binaries it references in one transaction
    pub fn insert_with_blobs(
        &self,
        kind: EntityKind,
        new: NewRecord,
        blobs: &[PendingBlob],
    ) -> Result<LocalId> {
        let now = self.now_ms();
        let tx = self.conn.unchecked_transaction()?;
        let deleted_at = (new.status == RecordStatus::Deleted).then_some(now);
        tx.execute(
            &format!(
                "INSERT INTO {}(sync_id, official_id, remote_id, payload_json, status, synced, revision, created_at, updated_at, deleted_at) \
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?8)",
                kind.local_table()
            ),
            params![
                new.sync_id.0.to_string(),
                new.official_id,
                new.remote_id,
                serde_json::to_string(&new.payload)?,
                new.status.as_str(),
                new.synced,
                now,
                deleted_at,
            ],
        )?;
        let id = LocalId(tx.last_insert_rowid());
        for blob in blobs {
            Self::insert_blob_conn(&tx, blob, now)?;
        }
        tx.commit()?;
        tracing::debug!(%kind, local_id = %id, "record inserted");
        Ok(id)
    }

    pub fn put(&self, kind: EntityKind, record: &LocalRecord) -> Result<LocalId> {
        self.put_with_blobs(kind, record, &[])
    }

    /// Write a whole record. The stored revision is bumped and `updated_at`
    /// set to now; a missing `local_id` is inserted as given.
    pub fn put_with_blobs(
        &self,
        kind: EntityKind,
        record: &LocalRecord,
        blobs: &[PendingBlob],
    ) -> Result<LocalId> {
        let now = self.now_ms();
        let table = kind.local_table();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {table}({RECORD_COLUMNS}) \
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(local_id) DO UPDATE SET \
                    sync_id = excluded.sync_id, official_id = excluded.official_id, \
                    remote_id = excluded.remote_id, payload_json = excluded.payload_json, \
                    status = excluded.status, synced = excluded.synced, \
                    revision = {table}.revision + 1, updated_at = excluded.updated_at, \
                    deleted_at = excluded.deleted_at, attempts = excluded.attempts, \
                    rejections = excluded.rejections, last_error = excluded.last_error, \
                    quarantined = excluded.quarantined"
            ),
            params![
                record.local_id.0,
                record.sync_id.0.to_string(),
                record.official_id,
                record.remote_id,
                serde_json::to_string(&record.payload)?,
                record.status.as_str(),
                record.synced,
                record.created_at.timestamp_millis(),
                now,
                record.deleted_at.map(|d| d.timestamp_millis()),
                record.sync_failure.attempts,
                record.sync_failure.rejections,
                record.sync_failure.last_error,
                record.sync_failure.quarantined,
            ],
        )?;
        for blob in blobs {
            Self::insert_blob_conn(&tx, blob, now)?;
        }
        tx.commit()?;
        Ok(record.local_id)
    }

    pub fn get(&self, kind: EntityKind, id: LocalId) -> Result<Option<LocalRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE local_id = ?1",
                    kind.local_table()
                ),
                params![id.0],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(|r| r.into_record(kind)).transpose()
    }

    pub fn require(&self, kind: EntityKind, id: LocalId) -> Result<LocalRecord> {
        self.get(kind, id)?.ok_or(StoreError::NotFound { kind, local_id: id })
    }

    pub fn get_all(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        self.select_where(kind, "1 = 1", vec![], "local_id")
    }

    pub fn get_by_index(&self, kind: EntityKind, index: &RecordIndex) -> Result<Vec<LocalRecord>> {
        use rusqlite::types::Value as Sql;
        let (clause, value) = match index {
            RecordIndex::Synced(b) => ("synced = ?1", Sql::Integer(i64::from(*b))),
            RecordIndex::SyncId(s) => ("sync_id = ?1", Sql::Text(s.0.to_string())),
            RecordIndex::OfficialId(o) => ("official_id = ?1", Sql::Text(o.clone())),
            RecordIndex::RemoteId(r) => ("remote_id = ?1", Sql::Text(r.clone())),
            RecordIndex::Status(s) => ("status = ?1", Sql::Text(s.as_str().to_string())),
        };
        self.select_where(kind, clause, vec![value], "local_id")
    }

    pub fn find_by_sync_id(&self, kind: EntityKind, sync_id: SyncId) -> Result<Option<LocalRecord>> {
        Ok(self
            .get_by_index(kind, &RecordIndex::SyncId(sync_id))?
            .into_iter()
            .next())
    }

    /// Hard delete. Soft deletion is a `put` with status `deleted`.
    pub fn delete(&self, kind: EntityKind, id: LocalId) -> Result<bool> {
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE local_id = ?1", kind.local_table()),
            params![id.0],
        )?;
        Ok(n > 0)
    }

    /// Unsynced records eligible for the next pass, oldest edit first
    pub fn pending(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        self.select_where(
            kind,
            "synced = 0 AND quarantined = 0",
            vec![],
            "updated_at, local_id",
        )
    }

    pub fn quarantined(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        self.select_where(kind, "quarantined = 1", vec![], "local_id")
    }

    pub fn counts(&self, kind: EntityKind) -> Result<CollectionCounts> {
        let (total, pending, quarantined): (i64, i64, i64) = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN synced = 0 AND quarantined = 0 THEN 1 ELSE 0 END), 0), \
                        COALESCE(SUM(quarantined), 0) \
                 FROM {}",
                kind.local_table()
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CollectionCounts {
            total: total as usize,
            pending: pending as usize,
            quarantined: quarantined as usize,
        })
    }

    pub fn pending_counts(&self) -> Result<BTreeMap<EntityKind, usize>> {
        let mut out = BTreeMap::new();
        for kind in EntityKind::ALL {
            out.insert(kind, self.counts(kind)?.pending);
        }
        Ok(out)
    }

    /// Percentage of records across every collection that are synced
    pub fn sync_progress(&self) -> Result<f64> {
        let mut total = 0usize;
        let mut synced = 0usize;
        for kind in EntityKind::ALL {
            let c = self.counts(kind)?;
            total += c.total;
            synced += c.total - c.pending - c.quarantined;
        }
        if total == 0 {
            return Ok(100.0);
        }
        Ok(synced as f64 * 100.0 / total as f64)
    }

    /// Persist an allocated official ID without touching the revision. An ID
    /// already stored is kept; the value now on the record is returned.
    pub fn set_official_id(&self, kind: EntityKind, id: LocalId, official_id: &str) -> Result<String> {
        let table = kind.local_table();
        let tx = self.conn.unchecked_transaction()?;
        let n = tx.execute(
            &format!("UPDATE {table} SET official_id = COALESCE(official_id, ?2) WHERE local_id = ?1"),
            params![id.0, official_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { kind, local_id: id });
        }
        let stored: String = tx.query_row(
            &format!("SELECT official_id FROM {table} WHERE local_id = ?1"),
            params![id.0],
            |row| row.get(0),
        )?;
        tx.commit()?;
        if stored != official_id {
            tracing::debug!(%kind, local_id = %id, kept = %stored, discarded = official_id, "official id already assigned");
        }
        Ok(stored)
    }

    /// Mark a pushed record synced if it was not edited since the pass read it.
    /// When it was, only the server-assigned identifiers are kept and the
    /// record stays pending. Returns whether the record is now synced.
    pub fn complete_sync(&self, kind: EntityKind, id: LocalId, done: &CompletedSync) -> Result<bool> {
        let table = kind.local_table();
        let tx = self.conn.unchecked_transaction()?;
        let revision: Option<i64> = tx
            .query_row(
                &format!("SELECT revision FROM {table} WHERE local_id = ?1"),
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        let Some(revision) = revision else {
            tx.commit()?;
            return Ok(false);
        };

        let completed = if revision == done.expected_revision {
            tx.execute(
                &format!(
                    "UPDATE {table} SET payload_json = ?2, status = ?3, official_id = ?4, remote_id = ?5, \
                     synced = 1, revision = revision + 1, attempts = 0, rejections = 0, \
                     last_error = NULL, quarantined = 0 WHERE local_id = ?1"
                ),
                params![
                    id.0,
                    serde_json::to_string(&done.payload)?,
                    done.status.as_str(),
                    done.official_id,
                    done.remote_id,
                ],
            )?;
            true
        } else {
            tx.execute(
                &format!(
                    "UPDATE {table} SET official_id = COALESCE(official_id, ?2), \
                     remote_id = COALESCE(?3, remote_id) WHERE local_id = ?1"
                ),
                params![id.0, done.official_id, done.remote_id],
            )?;
            tracing::debug!(%kind, local_id = %id, "record edited during sync; left pending");
            false
        };
        tx.commit()?;
        Ok(completed)
    }

    /// Count a failed push. Rejections move the record towards quarantine
    /// once `max_rejections` (0 disables) is reached; transient failures only
    /// bump `attempts`.
    pub fn record_failure(
        &self,
        kind: EntityKind,
        id: LocalId,
        error: &str,
        rejected: bool,
        max_rejections: u32,
    ) -> Result<SyncFailure> {
        let inc = i64::from(rejected);
        self.conn.execute(
            &format!(
                "UPDATE {} SET attempts = attempts + 1, rejections = rejections + ?2, last_error = ?3, \
                 quarantined = CASE WHEN ?4 > 0 AND ?2 > 0 AND rejections + ?2 >= ?4 THEN 1 ELSE quarantined END \
                 WHERE local_id = ?1",
                kind.local_table()
            ),
            params![id.0, inc, error, max_rejections],
        )?;
        Ok(self.require(kind, id)?.sync_failure)
    }

    pub fn release_quarantine(&self, kind: EntityKind, id: LocalId) -> Result<bool> {
        let n = self.conn.execute(
            &format!(
                "UPDATE {} SET quarantined = 0, rejections = 0 WHERE local_id = ?1 AND quarantined = 1",
                kind.local_table()
            ),
            params![id.0],
        )?;
        Ok(n > 0)
    }

    /// Highest number among local official IDs ending in `/<year>`,
    /// deleted records included
    pub fn max_official_number(&self, kind: EntityKind, year: i32) -> Result<Option<u32>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT official_id FROM {} WHERE official_id LIKE ?1",
            kind.local_table()
        ))?;
        let rows = stmt.query_map(params![format!("%/{year}")], |row| row.get::<_, String>(0))?;
        let mut max = None;
        for r in rows {
            if let Some(n) = leading_number(&r?) {
                max = max.max(Some(n));
            }
        }
        Ok(max)
    }

    /// Apply one authoritative remote row. An unsynced local match is merged
    /// through `merge` and stays pending; a synced match is replaced; no match
    /// inserts the row as synced. Runs in one transaction.
    pub fn apply_remote<F>(
        &self,
        kind: EntityKind,
        snapshot: &RemoteSnapshot,
        merge: F,
    ) -> Result<RemoteApply>
    where
        F: FnOnce(&LocalRecord, &RemoteSnapshot) -> (RecordStatus, serde_json::Value),
    {
        let table = kind.local_table();
        let now = self.now_ms();
        let tx = self.conn.unchecked_transaction()?;

        let mut existing = self.find_in(&tx, kind, "sync_id = ?1", snapshot.sync_id.0.to_string())?;
        if existing.is_none() {
            if let Some(remote_id) = &snapshot.remote_id {
                existing = self.find_in(&tx, kind, "remote_id = ?1", remote_id.clone())?;
            }
        }

        let outcome = match existing {
            None => {
                let created = snapshot.created_at.map(|d| d.timestamp_millis()).unwrap_or(now);
                let updated = snapshot.updated_at.map(|d| d.timestamp_millis()).unwrap_or(created);
                let deleted_at = (snapshot.status == RecordStatus::Deleted).then_some(updated);
                tx.execute(
                    &format!(
                        "INSERT INTO {table}(sync_id, official_id, remote_id, payload_json, status, synced, revision, created_at, updated_at, deleted_at) \
                         VALUES(?1, ?2, ?3, ?4, ?5, 1, 1, ?6, ?7, ?8)"
                    ),
                    params![
                        snapshot.sync_id.0.to_string(),
                        snapshot.official_id,
                        snapshot.remote_id,
                        serde_json::to_string(&snapshot.payload)?,
                        snapshot.status.as_str(),
                        created,
                        updated,
                        deleted_at,
                    ],
                )?;
                RemoteApply::Inserted(LocalId(tx.last_insert_rowid()))
            }
            Some(local) if !local.synced => {
                let (status, payload) = merge(&local, snapshot);
                tx.execute(
                    &format!(
                        "UPDATE {table} SET payload_json = ?2, status = ?3, \
                         official_id = COALESCE(official_id, ?4), remote_id = COALESCE(?5, remote_id), \
                         revision = revision + 1 WHERE local_id = ?1"
                    ),
                    params![
                        local.local_id.0,
                        serde_json::to_string(&payload)?,
                        status.as_str(),
                        snapshot.official_id,
                        snapshot.remote_id,
                    ],
                )?;
                RemoteApply::MergedPending(local.local_id)
            }
            Some(local) => {
                let updated = snapshot.updated_at.map(|d| d.timestamp_millis()).unwrap_or(now);
                let deleted_at = match snapshot.status {
                    RecordStatus::Deleted => Some(
                        local
                            .deleted_at
                            .map(|d| d.timestamp_millis())
                            .unwrap_or(updated),
                    ),
                    _ => None,
                };
                tx.execute(
                    &format!(
                        "UPDATE {table} SET payload_json = ?2, status = ?3, official_id = ?4, remote_id = ?5, \
                         synced = 1, revision = revision + 1, updated_at = ?6, deleted_at = ?7 WHERE local_id = ?1"
                    ),
                    params![
                        local.local_id.0,
                        serde_json::to_string(&snapshot.payload)?,
                        snapshot.status.as_str(),
                        snapshot.official_id.clone().or(local.official_id),
                        snapshot.remote_id.clone().or(local.remote_id),
                        updated,
                        deleted_at,
                    ],
                )?;
                RemoteApply::Replaced(local.local_id)
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Copy a collection into a timestamped backup table and return its name
    pub fn backup_collection(&self, kind: EntityKind, label: &str) -> Result<String> {
        let table = kind.local_table();
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let name = format!("backup_{table}_{label}_{}", self.now_ms());
        self.conn
            .execute_batch(&format!("CREATE TABLE {name} AS SELECT * FROM {table};"))?;
        tracing::info!(%kind, backup = %name, "collection backed up");
        Ok(name)
    }

    /// Remove every row of one collection. Local ids are not reused afterwards.
    pub fn clear_collection(&self, kind: EntityKind) -> Result<usize> {
        let n = self
            .conn
            .execute(&format!("DELETE FROM {}", kind.local_table()), [])?;
        Ok(n)
    }

    /// Wipe every collection, pending blob and cached listing
    pub fn reset(&self, confirmation: ResetConfirmation) -> Result<ResetSummary> {
        if !confirmation.is_confirmed() {
            return Err(StoreError::ResetNotConfirmed);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = ResetSummary::default();
        for kind in EntityKind::ALL {
            summary.records_removed +=
                tx.execute(&format!("DELETE FROM {}", kind.local_table()), [])?;
        }
        summary.blobs_removed = tx.execute("DELETE FROM pending_blobs", [])?;
        tx.execute("DELETE FROM remote_cache", [])?;
        tx.commit()?;
        tracing::warn!(
            records = summary.records_removed,
            blobs = summary.blobs_removed,
            "local store reset"
        );
        Ok(summary)
    }

    fn select_where(
        &self,
        kind: EntityKind,
        clause: &str,
        values: Vec<rusqlite::types::Value>,
        order: &str,
    ) -> Result<Vec<LocalRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {clause} ORDER BY {order}",
            kind.local_table()
        ))?;
        let rows = stmt.query_map(params_from_iter(values), RawRecord::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_record(kind)?);
        }
        Ok(out)
    }

    fn find_in(
        &self,
        conn: &Connection,
        kind: EntityKind,
        clause: &str,
        value: String,
    ) -> Result<Option<LocalRecord>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE {clause} LIMIT 1",
                    kind.local_table()
                ),
                params![value],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(|r| r.into_record(kind)).transpose()
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let _ = conn.pragma_update(None, "cache_size", "-8000");
    Ok(())
}

/// Leading decimal run of an official ID such as `"007/2026"`
pub fn leading_number(official_id: &str) -> Option<u32> {
    let digits: String = official_id
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

struct RawRecord {
    local_id: i64,
    sync_id: String,
    official_id: Option<String>,
    remote_id: Option<String>,
    payload_json: String,
    status: String,
    synced: bool,
    revision: i64,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    attempts: i64,
    rejections: i64,
    last_error: Option<String>,
    quarantined: bool,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            sync_id: row.get(1)?,
            official_id: row.get(2)?,
            remote_id: row.get(3)?,
            payload_json: row.get(4)?,
            status: row.get(5)?,
            synced: row.get(6)?,
            revision: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            deleted_at: row.get(10)?,
            attempts: row.get(11)?,
            rejections: row.get(12)?,
            last_error: row.get(13)?,
            quarantined: row.get(14)?,
        })
    }

    fn into_record(self, kind: EntityKind) -> Result<LocalRecord> {
        let table = kind.local_table();
        Ok(LocalRecord {
            local_id: LocalId(self.local_id),
            entity_kind: kind,
            sync_id: SyncId(blobs::parse_uuid(table, &self.sync_id)?),
            official_id: self.official_id,
            remote_id: self.remote_id,
            payload: serde_json::from_str(&self.payload_json)?,
            status: RecordStatus::parse(&self.status),
            synced: self.synced,
            revision: self.revision,
            created_at: millis(table, self.created_at)?,
            updated_at: millis(table, self.updated_at)?,
            deleted_at: self.deleted_at.map(|ms| millis(table, ms)).transpose()?,
            sync_failure: SyncFailure {
                attempts: self.attempts.max(0) as u32,
                rejections: self.rejections.max(0) as u32,
                last_error: self.last_error,
                quarantined: self.quarantined,
            },
        })
    }
}

fn millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt {
            table,
            reason: format!("timestamp out of range: {ms}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> LocalStore {
        LocalStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number("007/2026"), Some(7));
        assert_eq!(leading_number(" 12/2025"), Some(12));
        assert_eq!(leading_number("abc/2026"), None);
    }

    #[test]
    fn test_local_ids_are_never_reused() {
        let s = store();
        let a = s.insert(EntityKind::Shelter, NewRecord::draft(json!({"name": "A"}))).unwrap();
        assert!(s.delete(EntityKind::Shelter, a).unwrap());
        let b = s.insert(EntityKind::Shelter, NewRecord::draft(json!({"name": "B"}))).unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_put_bumps_revision() {
        let s = store();
        let id = s.insert(EntityKind::Inspection, NewRecord::draft(json!({"processo": "1"}))).unwrap();
        let mut rec = s.get(EntityKind::Inspection, id).unwrap().unwrap();
        assert_eq!(rec.revision, 1);
        rec.payload = json!({"processo": "2"});
        s.put(EntityKind::Inspection, &rec).unwrap();
        let rec = s.get(EntityKind::Inspection, id).unwrap().unwrap();
        assert_eq!(rec.revision, 2);
        assert_eq!(rec.payload["processo"], "2");
    }

    #[test]
    fn test_official_id_is_assigned_once() {
        let s = store();
        let id = s.insert(EntityKind::Dossier, NewRecord::draft(json!({}))).unwrap();
        assert_eq!(s.set_official_id(EntityKind::Dossier, id, "001/2026").unwrap(), "001/2026");
        assert_eq!(s.set_official_id(EntityKind::Dossier, id, "002/2026").unwrap(), "001/2026");
        let rec = s.require(EntityKind::Dossier, id).unwrap();
        assert_eq!(rec.official_id.as_deref(), Some("001/2026"));
        assert_eq!(rec.revision, 1);
    }

    #[test]
    fn test_reset_requires_phrase() {
        let s = store();
        s.insert(EntityKind::Dossier, NewRecord::draft(json!({}))).unwrap();
        assert!(matches!(
            s.reset(ResetConfirmation::new("yes")),
            Err(StoreError::ResetNotConfirmed)
        ));
        let summary = s.reset(ResetConfirmation::confirmed()).unwrap();
        assert_eq!(summary.records_removed, 1);
        assert!(s.get_all(EntityKind::Dossier).unwrap().is_empty());
    }
}
