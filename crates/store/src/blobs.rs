/// Binary attachment payloads waiting for upload
/// Documents only reference these through an `UploadTicket`
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{EntityKind, LocalStore, Result, SyncId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadTicket(pub Uuid);

impl UploadTicket {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlob {
    pub ticket: UploadTicket,
    pub entity_kind: EntityKind,
    pub owner: SyncId,
    pub attachment_id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Set once the upload went through; the row is kept until the owning
    /// record's remote write succeeds
    pub remote_url: Option<String>,
}

impl PendingBlob {
    /// File extension used for the object path
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/png" => "png",
            "image/webp" => "webp",
            "application/pdf" => "pdf",
            _ => "bin",
        }
    }
}

impl LocalStore {
    pub(crate) fn insert_blob_conn(conn: &rusqlite::Connection, blob: &PendingBlob, now_ms: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO pending_blobs(ticket, entity_kind, owner_sync_id, attachment_id, content_type, bytes, remote_url, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(ticket) DO UPDATE SET \
               remote_url = CASE WHEN pending_blobs.bytes = excluded.bytes THEN pending_blobs.remote_url ELSE excluded.remote_url END, \
               bytes = excluded.bytes, content_type = excluded.content_type",
            params![
                blob.ticket.0.to_string(),
                blob.entity_kind.as_str(),
                blob.owner.0.to_string(),
                blob.attachment_id,
                blob.content_type,
                blob.bytes,
                blob.remote_url,
                now_ms,
            ],
        )?;
        Ok(())
    }

    pub fn insert_blob(&self, blob: &PendingBlob) -> Result<()> {
        Self::insert_blob_conn(&self.conn, blob, self.now_ms())
    }

    pub fn get_blob(&self, ticket: UploadTicket) -> Result<Option<PendingBlob>> {
        let row = self
            .conn
            .query_row(
                "SELECT ticket, entity_kind, owner_sync_id, attachment_id, content_type, bytes, remote_url \
                 FROM pending_blobs WHERE ticket = ?1",
                params![ticket.0.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((ticket, kind, owner, attachment_id, content_type, bytes, remote_url)) = row
        else {
            return Ok(None);
        };

        Ok(Some(PendingBlob {
            ticket: UploadTicket(parse_uuid("pending_blobs", &ticket)?),
            entity_kind: kind.parse()?,
            owner: SyncId(parse_uuid("pending_blobs", &owner)?),
            attachment_id,
            content_type,
            bytes,
            remote_url,
        }))
    }

    /// Tickets still held for a record, uploaded or not
    pub fn blobs_for(&self, owner: SyncId) -> Result<Vec<UploadTicket>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ticket FROM pending_blobs WHERE owner_sync_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![owner.0.to_string()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(UploadTicket(parse_uuid("pending_blobs", &r?)?));
        }
        Ok(out)
    }

    pub fn record_blob_upload(&self, ticket: UploadTicket, remote_url: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_blobs SET remote_url = ?2 WHERE ticket = ?1",
            params![ticket.0.to_string(), remote_url],
        )?;
        Ok(())
    }

    /// Hand `tickets` over to another record
    pub fn reassign_blobs(&self, tickets: &[UploadTicket], owner: SyncId) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut moved = 0;
        for ticket in tickets {
            moved += tx.execute(
                "UPDATE pending_blobs SET owner_sync_id = ?2 WHERE ticket = ?1",
                params![ticket.0.to_string(), owner.0.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(moved)
    }

    /// Delete the listed tickets that `owner` still holds; tickets owned by
    /// another record are left alone
    pub fn delete_owned_blobs(&self, owner: SyncId, tickets: &[UploadTicket]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        for ticket in tickets {
            removed += tx.execute(
                "DELETE FROM pending_blobs WHERE ticket = ?1 AND owner_sync_id = ?2",
                params![ticket.0.to_string(), owner.0.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn delete_blobs(&self, tickets: &[UploadTicket]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        for ticket in tickets {
            removed += tx.execute(
                "DELETE FROM pending_blobs WHERE ticket = ?1",
                params![ticket.0.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

pub(crate) fn parse_uuid(table: &'static str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| crate::StoreError::Corrupt {
        table,
        reason: format!("bad uuid {raw:?}: {e}"),
    })
}
