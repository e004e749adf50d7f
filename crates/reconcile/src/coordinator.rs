/// Sync coordinator: pushes pending records, pulls remote collections
use chrono::Datelike;
use serde::Serialize;
use std::sync::Arc;
use store::{
    CompletedSync, EntityKind, LocalRecord, NewRecord, RemoteApply, RemoteSnapshot,
    ResetConfirmation, StoreError,
};

use crate::allocator::IdAllocator;
use crate::attachments::{resolve_attachments, ResolvedPayload};
use crate::merge::{merge_documents, Document};
use crate::{from_remote, to_remote, RemoteRepository, Result, SelectQuery, SharedStore, SyncError};

/// Aggregate outcome of one push pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    /// Transient failures; the records stay pending
    pub failed: usize,
    /// Rejected by the server, below the quarantine threshold
    pub rejected: usize,
    /// Rejected and quarantined by this pass
    pub quarantined: usize,
    /// Pushed, but edited locally while in flight; still pending
    pub superseded: usize,
}

impl SyncReport {
    pub fn absorb(&mut self, other: SyncReport) {
        self.synced += other.synced;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.quarantined += other.quarantined;
        self.superseded += other.superseded;
    }

    pub fn attempted(&self) -> usize {
        self.synced + self.failed + self.rejected + self.quarantined + self.superseded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub fetched: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub merged: usize,
    /// Remote rows that could not be mapped
    pub skipped: usize,
}

impl PullReport {
    pub fn absorb(&mut self, other: PullReport) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.merged += other.merged;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub backup_table: String,
    pub downloaded: usize,
    pub drafts_restored: usize,
}

enum PushOutcome {
    Synced,
    Superseded,
}

pub struct SyncCoordinator {
    store: SharedStore,
    remote: Arc<dyn RemoteRepository>,
    allocator: IdAllocator,
    max_rejections: u32,
}

impl SyncCoordinator {
    pub fn new(store: SharedStore, remote: Arc<dyn RemoteRepository>, max_rejections: u32) -> Self {
        Self {
            allocator: IdAllocator::new(remote.clone()),
            store,
            remote,
            max_rejections,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteRepository> {
        &self.remote
    }

    /// Push every pending record of every kind. Per-record failures are
    /// recorded and counted, never returned.
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for kind in EntityKind::ALL {
            report.absorb(self.sync_kind(kind).await?);
        }
        if report.attempted() > 0 {
            tracing::info!(
                synced = report.synced,
                failed = report.failed,
                rejected = report.rejected,
                quarantined = report.quarantined,
                superseded = report.superseded,
                "sync pass finished"
            );
        }
        Ok(report)
    }

    pub async fn sync_kind(&self, kind: EntityKind) -> Result<SyncReport> {
        let pending = self.store.lock().pending(kind)?;
        let mut report = SyncReport::default();
        for record in pending {
            match self.push_record(kind, &record).await {
                Ok(PushOutcome::Synced) => report.synced += 1,
                Ok(PushOutcome::Superseded) => report.superseded += 1,
                Err(e) => self.note_failure(kind, &record, &e, &mut report),
            }
        }
        Ok(report)
    }

    async fn push_record(&self, kind: EntityKind, record: &LocalRecord) -> Result<PushOutcome> {
        let table = kind.remote_table();
        let sync_column = kind.sync_id_column();

        let mut doc = Document::new(record.status, record.payload.clone());
        let mut official_id = record.official_id.clone();
        let mut remote_id = record.remote_id.clone();

        let existing = self
            .remote
            .select(
                table,
                &SelectQuery::new()
                    .eq(sync_column, record.sync_id.to_string())
                    .limit(1),
            )
            .await?;
        if let Some(row) = existing.first() {
            let snapshot = from_remote(kind, row)?;
            doc = merge_documents(kind, &doc, &Document::new(snapshot.status, snapshot.payload));
            official_id = official_id.or(snapshot.official_id);
            remote_id = remote_id.or(snapshot.remote_id);
        }

        if kind.numbering().is_some() && official_id.is_none() {
            // Another pass may have assigned one since this record was read
            let (stored, year, local_max) = {
                let store = self.store.lock();
                let stored = store.get(kind, record.local_id)?.and_then(|r| r.official_id);
                let year = store.now().year();
                (stored, year, store.max_official_number(kind, year)?)
            };
            official_id = match stored {
                Some(id) => Some(id),
                None => {
                    let allocated = self.allocator.allocate(kind, year, local_max).await?;
                    // Persisted before the push so a retry reuses it; an ID
                    // stored meanwhile wins over this one
                    Some(
                        self.store
                            .lock()
                            .set_official_id(kind, record.local_id, &allocated)?,
                    )
                }
            };
        }

        let ResolvedPayload { payload, tickets } =
            resolve_attachments(&self.store, &self.remote, kind, record.sync_id, &doc.payload).await?;

        let mut outgoing = record.clone();
        outgoing.payload = payload.clone();
        outgoing.status = doc.status;
        outgoing.official_id = official_id.clone();
        let row = to_remote(kind, &outgoing)?;

        let stored = self.remote.upsert(table, sync_column, row).await?;
        let remote_id = stored
            .get(remote::mapping::REMOTE_ID_COLUMN)
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .or(remote_id);

        let store = self.store.lock();
        let completed = store.complete_sync(
            kind,
            record.local_id,
            &CompletedSync {
                expected_revision: record.revision,
                payload,
                status: doc.status,
                official_id,
                remote_id,
            },
        )?;

        if !completed {
            return Ok(PushOutcome::Superseded);
        }
        if !tickets.is_empty() {
            store.delete_owned_blobs(record.sync_id, &tickets)?;
        }
        tracing::debug!(%kind, local_id = %record.local_id, "record synced");
        Ok(PushOutcome::Synced)
    }

    fn note_failure(
        &self,
        kind: EntityKind,
        record: &LocalRecord,
        error: &SyncError,
        report: &mut SyncReport,
    ) {
        let local_id = record.local_id;
        if let SyncError::Storage(e) = error {
            tracing::warn!(%kind, %local_id, error = %e, "storage failure during sync");
            report.failed += 1;
            return;
        }

        let rejected = !error.is_transient();
        let outcome = self.store.lock().record_failure(
            kind,
            local_id,
            &error.to_string(),
            rejected,
            self.max_rejections,
        );
        match outcome {
            Ok(failure) if failure.quarantined && rejected => {
                tracing::warn!(%kind, %local_id, rejections = failure.rejections, error = %error, "record quarantined");
                report.quarantined += 1;
            }
            Ok(failure) if rejected => {
                tracing::warn!(%kind, %local_id, rejections = failure.rejections, error = %error, "remote rejected record");
                report.rejected += 1;
            }
            Ok(_) => {
                tracing::warn!(%kind, %local_id, error = %error, "sync failed; record left pending");
                report.failed += 1;
            }
            Err(e) => {
                tracing::warn!(%kind, %local_id, error = %e, "could not record sync failure");
                report.failed += 1;
            }
        }
    }

    /// Download and map a whole remote collection. Rows that do not map are
    /// skipped and counted.
    pub async fn fetch_all(&self, kind: EntityKind) -> Result<(Vec<RemoteSnapshot>, usize)> {
        let rows = self
            .remote
            .select(
                kind.remote_table(),
                &SelectQuery::new().order_by(remote::mapping::CREATED_AT_COLUMN, false),
            )
            .await?;
        let mut snapshots = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in &rows {
            match from_remote(kind, row) {
                Ok(s) => snapshots.push(s),
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "skipping unmappable remote row");
                    skipped += 1;
                }
            }
        }
        Ok((snapshots, skipped))
    }

    /// Bring one collection up to date with the remote. Unsynced local copies
    /// are merged and stay pending; synced ones are replaced; unknown rows are
    /// inserted as synced. The read cache is refreshed on the way.
    pub async fn pull(&self, kind: EntityKind) -> Result<PullReport> {
        let (snapshots, skipped) = self.fetch_all(kind).await?;
        let mut report = PullReport {
            fetched: snapshots.len() + skipped,
            skipped,
            ..PullReport::default()
        };

        let store = self.store.lock();
        store.cache_remote(kind, &snapshots)?;
        for snapshot in &snapshots {
            let applied = store.apply_remote(kind, snapshot, |local, remote| {
                let merged = merge_documents(
                    kind,
                    &Document::new(local.status, local.payload.clone()),
                    &Document::new(remote.status, remote.payload.clone()),
                );
                (merged.status, merged.payload)
            })?;
            match applied {
                RemoteApply::Inserted(_) => report.inserted += 1,
                RemoteApply::Replaced(_) => report.replaced += 1,
                RemoteApply::MergedPending(_) => report.merged += 1,
            }
        }
        tracing::debug!(%kind, fetched = report.fetched, inserted = report.inserted, merged = report.merged, "pull finished");
        Ok(report)
    }

    /// Pull every kind; a kind that fails is logged and skipped
    pub async fn pull_all(&self) -> PullReport {
        let mut report = PullReport::default();
        for kind in EntityKind::ALL {
            match self.pull(kind).await {
                Ok(r) => report.absorb(r),
                Err(e) => tracing::warn!(%kind, error = %e, "pull failed"),
            }
        }
        report
    }

    /// Rebuild one collection from the remote: back it up, keep unsynced
    /// drafts, wipe it, re-insert the remote rows and merge the drafts back.
    /// Nothing is wiped unless the download succeeded.
    pub async fn rebuild(
        &self,
        kind: EntityKind,
        confirmation: &ResetConfirmation,
    ) -> Result<RebuildReport> {
        if !confirmation.is_confirmed() {
            return Err(StoreError::ResetNotConfirmed.into());
        }
        let (snapshots, _) = self.fetch_all(kind).await?;

        let store = self.store.lock();
        let backup_table = store.backup_collection(kind, "rebuild")?;
        let drafts: Vec<LocalRecord> = store
            .get_all(kind)?
            .into_iter()
            .filter(|r| !r.synced)
            .collect();
        store.clear_collection(kind)?;

        for snapshot in &snapshots {
            store.apply_remote(kind, snapshot, |_, remote| {
                (remote.status, remote.payload.clone())
            })?;
        }

        for draft in &drafts {
            match store.find_by_sync_id(kind, draft.sync_id)? {
                Some(mut existing) => {
                    let merged = merge_documents(
                        kind,
                        &Document::new(draft.status, draft.payload.clone()),
                        &Document::new(existing.status, existing.payload.clone()),
                    );
                    existing.payload = merged.payload;
                    existing.status = merged.status;
                    existing.official_id = draft.official_id.clone().or(existing.official_id);
                    existing.synced = false;
                    store.put(kind, &existing)?;
                }
                None => {
                    store.insert(
                        kind,
                        NewRecord {
                            sync_id: draft.sync_id,
                            payload: draft.payload.clone(),
                            status: draft.status,
                            official_id: draft.official_id.clone(),
                            remote_id: draft.remote_id.clone(),
                            synced: false,
                        },
                    )?;
                }
            }
        }
        store.cache_remote(kind, &snapshots)?;

        tracing::info!(%kind, downloaded = snapshots.len(), drafts = drafts.len(), backup = %backup_table, "collection rebuilt");
        Ok(RebuildReport {
            backup_table,
            downloaded: snapshots.len(),
            drafts_restored: drafts.len(),
        })
    }
}
