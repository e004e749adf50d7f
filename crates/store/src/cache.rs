/// Read cache of the last remote listing per kind, served when offline
use rusqlite::params;

use crate::{EntityKind, LocalStore, RemoteSnapshot, Result};

impl LocalStore {
    /// Replace the cached listing for `kind`
    pub fn cache_remote(&self, kind: EntityKind, snapshots: &[RemoteSnapshot]) -> Result<()> {
        let now = self.now_ms();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM remote_cache WHERE entity_kind = ?1",
            params![kind.as_str()],
        )?;
        for snap in snapshots {
            tx.execute(
                "INSERT OR REPLACE INTO remote_cache(entity_kind, sync_id, snapshot_json, fetched_at) VALUES(?1, ?2, ?3, ?4)",
                params![
                    kind.as_str(),
                    snap.sync_id.0.to_string(),
                    serde_json::to_string(snap)?,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cached_remote(&self, kind: EntityKind) -> Result<Vec<RemoteSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_json FROM remote_cache WHERE entity_kind = ?1 ORDER BY fetched_at, sync_id",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            let raw = raw?;
            match serde_json::from_str::<RemoteSnapshot>(&raw) {
                Ok(snap) => out.push(snap),
                Err(e) => tracing::warn!(%kind, error = %e, "dropping unreadable cache entry"),
            }
        }
        Ok(out)
    }
}
