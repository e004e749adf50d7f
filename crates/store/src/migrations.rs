//! Versioned schema migrations for the local store.
//!
//! Each migration is a list of steps applied inside one transaction and
//! recorded by name in the `migrations` table. A migration that is already
//! recorded is skipped, so opening an up-to-date store is a no-op and a
//! migration interrupted half-way leaves nothing behind.
use rusqlite::{params, Connection, OptionalExtension};

use crate::{EntityKind, Result, StoreError};

const COLLECTION_V1: &str = include_str!("../migrations/collection_v1.sql");
const COLLECTION_V5: &str = include_str!("../migrations/collection_v5.sql");
const COLLECTION_INDEXES: &str = include_str!("../migrations/collection_indexes.sql");

#[derive(Debug, Clone)]
pub enum MigrationStep {
    /// Run a fixed SQL batch
    Sql(&'static str),
    /// Create a collection with the given table template
    CreateCollection(EntityKind),
    /// Copy a collection into `backup_<table>_v<version>` before touching it
    Backup(EntityKind),
    /// Add a column when it is missing
    AddColumn {
        kind: EntityKind,
        column: &'static str,
        definition: &'static str,
    },
    /// Recreate a collection in the current layout, keeping rows and the
    /// autoincrement high-water mark
    Rebuild(EntityKind),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub steps: Vec<MigrationStep>,
}

const CORE_KINDS: [EntityKind; 3] = [
    EntityKind::Inspection,
    EntityKind::Interdiction,
    EntityKind::Dossier,
];

const SHELTER_KINDS: [EntityKind; 5] = [
    EntityKind::Shelter,
    EntityKind::ShelterOccupant,
    EntityKind::ShelterDonation,
    EntityKind::ShelterInventory,
    EntityKind::ShelterDistribution,
];

pub fn all() -> Vec<Migration> {
    let mut failure_columns = Vec::new();
    for kind in EntityKind::ALL {
        failure_columns.push(MigrationStep::Backup(kind));
        for (column, definition) in [
            ("attempts", "INTEGER NOT NULL DEFAULT 0"),
            ("rejections", "INTEGER NOT NULL DEFAULT 0"),
            ("last_error", "TEXT"),
            ("quarantined", "INTEGER NOT NULL DEFAULT 0"),
        ] {
            failure_columns.push(MigrationStep::AddColumn {
                kind,
                column,
                definition,
            });
        }
    }

    let mut rebuild = Vec::new();
    for kind in EntityKind::ALL {
        rebuild.push(MigrationStep::Backup(kind));
        rebuild.push(MigrationStep::Rebuild(kind));
    }

    vec![
        Migration {
            version: 1,
            name: "V0001__core_collections",
            steps: CORE_KINDS
                .iter()
                .copied()
                .map(MigrationStep::CreateCollection)
                .collect(),
        },
        Migration {
            version: 2,
            name: "V0002__shelter_collections",
            steps: SHELTER_KINDS
                .iter()
                .copied()
                .map(MigrationStep::CreateCollection)
                .collect(),
        },
        Migration {
            version: 3,
            name: "V0003__sync_failures",
            steps: failure_columns,
        },
        Migration {
            version: 4,
            name: "V0004__blobs_and_cache",
            steps: vec![MigrationStep::Sql(include_str!(
                "../migrations/V0004__blobs_and_cache.sql"
            ))],
        },
        Migration {
            version: 5,
            name: "V0005__revisions",
            steps: rebuild,
        },
    ]
}

/// Latest schema version known to this build
pub fn latest_version() -> u32 {
    all().iter().map(|m| m.version).max().unwrap_or(0)
}

pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))
        .map_err(|source| StoreError::Migration {
            name: "V0001__init".to_string(),
            source,
        })?;

    for migration in all() {
        if is_applied(conn, migration.name)? {
            continue;
        }
        apply_one(conn, &migration).map_err(|source| StoreError::Migration {
            name: migration.name.to_string(),
            source,
        })?;
        tracing::info!(name = migration.name, version = migration.version, "applied migration");
    }
    Ok(())
}

pub fn applied_version(conn: &Connection) -> Result<u32> {
    let v: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(v.unwrap_or(0) as u32)
}

fn is_applied(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM migrations WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn apply_one(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for step in &migration.steps {
        run_step(&tx, migration.version, step)?;
    }
    tx.execute(
        "INSERT OR IGNORE INTO migrations(name, version, applied_at) VALUES(?1, ?2, ?3)",
        params![
            migration.name,
            migration.version,
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    tx.commit()
}

fn run_step(conn: &Connection, version: u32, step: &MigrationStep) -> rusqlite::Result<()> {
    match step {
        MigrationStep::Sql(sql) => conn.execute_batch(sql),
        MigrationStep::CreateCollection(kind) => {
            conn.execute_batch(&COLLECTION_V1.replace("{table}", kind.local_table()))
        }
        MigrationStep::Backup(kind) => {
            let table = kind.local_table();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS backup_{table}_v{version} AS SELECT * FROM {table};"
            ))
        }
        MigrationStep::AddColumn {
            kind,
            column,
            definition,
        } => {
            let table = kind.local_table();
            ensure_column(
                conn,
                table,
                column,
                &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            )
        }
        MigrationStep::Rebuild(kind) => rebuild_collection(conn, kind.local_table()),
    }
}

fn rebuild_collection(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    let staging = format!("{table}__rebuild");
    let high_water: i64 = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    conn.execute_batch(&format!("DROP TABLE IF EXISTS {staging};"))?;
    conn.execute_batch(&COLLECTION_V5.replace("{table}", &staging))?;

    // Legacy rows may share or lack a sync id; later duplicates get a fresh one
    conn.execute_batch(&format!(
        "INSERT INTO {staging} (local_id, sync_id, official_id, remote_id, payload_json, status, synced, revision, \
                                created_at, updated_at, deleted_at, attempts, rejections, last_error, quarantined) \
         SELECT t.local_id, \
                CASE WHEN t.sync_id IS NULL OR t.sync_id = '' \
                       OR EXISTS (SELECT 1 FROM {table} o WHERE o.sync_id = t.sync_id AND o.local_id < t.local_id) \
                     THEN lower(hex(randomblob(16))) ELSE t.sync_id END, \
                t.official_id, t.remote_id, t.payload_json, \
                CASE WHEN t.status IN ('draft', 'submitted', 'deleted') THEN t.status ELSE 'draft' END, \
                t.synced, 1, t.created_at, t.updated_at, t.deleted_at, \
                t.attempts, t.rejections, t.last_error, t.quarantined \
         FROM {table} t ORDER BY t.local_id;"
    ))?;

    conn.execute_batch(&format!(
        "DROP TABLE {table}; ALTER TABLE {staging} RENAME TO {table};"
    ))?;
    conn.execute_batch(&COLLECTION_INDEXES.replace("{table}", table))?;

    let current: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    match current {
        Some(seq) if seq >= high_water => {}
        Some(_) => {
            conn.execute(
                "UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1",
                params![table, high_water],
            )?;
        }
        None if high_water > 0 => {
            conn.execute(
                "INSERT INTO sqlite_sequence(name, seq) VALUES(?1, ?2)",
                params![table, high_water],
            )?;
        }
        None => {}
    }
    Ok(())
}

pub(crate) fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    alter_sql: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut exists = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            exists = true;
            break;
        }
    }
    if !exists {
        conn.execute(alter_sql, [])?;
    }
    Ok(())
}

/// Names of backup tables left behind by destructive steps
pub fn backup_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'backup\\_%' ESCAPE '\\' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_increasing_and_unique() {
        let migrations = all();
        for pair in migrations.windows(2) {
            assert!(pair[0].version < pair[1].version);
            assert_ne!(pair[0].name, pair[1].name);
        }
        assert_eq!(latest_version(), 5);
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))
            .unwrap();
        apply_migrations(&conn).unwrap();
        let again: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, again);
        assert_eq!(applied_version(&conn).unwrap(), 5);
    }

    #[test]
    fn test_rebuild_keeps_rows_and_high_water_mark() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../migrations/V0001__init.sql"))
            .unwrap();
        for m in all().into_iter().take(4) {
            apply_one(&conn, &m).unwrap();
        }

        for (sync, payload) in [("dup", "{\"a\":1}"), ("dup", "{\"a\":2}"), ("gone", "{}")] {
            conn.execute(
                "INSERT INTO inspections(sync_id, payload_json, status, synced, created_at, updated_at) \
                 VALUES(?1, ?2, 'weird', 0, 1, 1)",
                params![sync, payload],
            )
            .unwrap();
        }
        conn.execute("DELETE FROM inspections WHERE sync_id = 'gone'", [])
            .unwrap();

        let last = all().pop().unwrap();
        apply_one(&conn, &last).unwrap();

        let rows: Vec<(i64, String, String)> = conn
            .prepare("SELECT local_id, sync_id, status FROM inspections ORDER BY local_id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, "dup");
        assert_ne!(rows[1].1, "dup");
        assert!(rows.iter().all(|r| r.2 == "draft"));

        conn.execute(
            "INSERT INTO inspections(sync_id, payload_json, created_at, updated_at) VALUES('n', '{}', 2, 2)",
            [],
        )
        .unwrap();
        let newest: i64 = conn
            .query_row("SELECT MAX(local_id) FROM inspections", [], |r| r.get(0))
            .unwrap();
        assert_eq!(newest, 4);

        let backups = backup_tables(&conn).unwrap();
        assert!(backups.contains(&"backup_inspections_v5".to_string()));
    }
}
