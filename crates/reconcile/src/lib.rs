/// Offline-first reconciliation for field-operations records
/// Merge engine, official-id allocation, sync passes, duplicate repair and
/// the background scheduler, behind the `FieldSync` facade
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

mod allocator;
pub use allocator::*;

mod attachments;
pub use attachments::*;

mod config;
pub use config::*;

mod coordinator;
pub use coordinator::*;

pub mod dedup;

mod document;
pub use document::*;

mod error;
pub use error::*;

pub mod merge;
pub use merge::{merge_documents, merge_status, Document};

mod scheduler;
pub use scheduler::*;

pub use remote::{
    from_remote, to_remote, BackendKind, MemoryRemote, RemoteConfig, RemoteError, RemoteFactory,
    RemoteRepository, RemoteRow, SelectQuery, Subscription,
};
pub use store::{
    CollectionCounts, EntityKind, LocalId, LocalRecord, LocalStore, NewRecord, RecordStatus,
    RemoteSnapshot, ResetConfirmation, ResetSummary, SyncId, RESET_PHRASE,
};

/// Store handle shared by the facade, coordinator and scheduler
pub type SharedStore = Arc<Mutex<LocalStore>>;

/// A row another device inserted, as seen on the realtime feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInsertNotice {
    pub kind: EntityKind,
    pub official_id: Option<String>,
    pub remote_id: Option<String>,
}

/// Result of a cloud-first read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordListing {
    /// Live (non-deleted) local records after the pull, if any
    pub records: Vec<LocalRecord>,
    /// Rows from the last successful remote listing that have no local copy
    pub cached: Vec<RemoteSnapshot>,
    /// The remote could not be reached and the listing may be stale
    pub cached_only: bool,
}

const NOTICE_CAPACITY: usize = 64;

pub struct FieldSync {
    config: SyncConfig,
    store: SharedStore,
    coordinator: Arc<SyncCoordinator>,
    online: AtomicBool,
    scheduler: Mutex<Option<SchedulerHandle>>,
    notices: broadcast::Sender<RemoteInsertNotice>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FieldSync {
    /// Open the configured store and remote. A store that fails to open is
    /// reported here and not retried.
    pub fn open(config: SyncConfig) -> Result<Self> {
        let store = LocalStore::open(&config.db_path)?;
        let remote = RemoteFactory::create(&config.remote)?;
        Ok(Self::with_parts(store, remote, config))
    }

    pub fn with_parts(store: LocalStore, remote: Arc<dyn RemoteRepository>, config: SyncConfig) -> Self {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote,
            config.max_rejections,
        ));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            config,
            store,
            coordinator,
            online: AtomicBool::new(true),
            scheduler: Mutex::new(None),
            notices,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Save a new draft. Inline `data:` attachments are moved out of the
    /// payload into pending uploads.
    pub fn save_draft(&self, kind: EntityKind, payload: serde_json::Value) -> Result<LocalId> {
        let draft = DraftBuilder::new(kind, payload).import_inline()?.build();
        self.save_draft_with(kind, draft)
    }

    pub fn save_draft_with(&self, kind: EntityKind, draft: Draft) -> Result<LocalId> {
        let new = NewRecord::draft(draft.payload).with_sync_id(draft.sync_id);
        let id = self.store.lock().insert_with_blobs(kind, new, &draft.blobs)?;
        tracing::info!(%kind, local_id = %id, attachments = draft.blobs.len(), "draft saved");
        self.local_write();
        Ok(id)
    }

    /// Replace a record's payload. The record is queued again and released
    /// from quarantine.
    pub fn update_draft(&self, kind: EntityKind, id: LocalId, payload: serde_json::Value) -> Result<()> {
        let sync_id = self.store.lock().require(kind, id)?.sync_id;
        let draft = DraftBuilder::for_record(kind, sync_id, payload)
            .import_inline()?
            .build();
        self.update_draft_with(kind, id, draft)
    }

    pub fn update_draft_with(&self, kind: EntityKind, id: LocalId, draft: Draft) -> Result<()> {
        {
            let store = self.store.lock();
            let mut record = store.require(kind, id)?;
            record.payload = draft.payload;
            record.synced = false;
            record.sync_failure = Default::default();
            store.put_with_blobs(kind, &record, &draft.blobs)?;
        }
        tracing::debug!(%kind, local_id = %id, "draft updated");
        self.local_write();
        Ok(())
    }

    pub fn set_status(&self, kind: EntityKind, id: LocalId, status: RecordStatus) -> Result<()> {
        {
            let store = self.store.lock();
            let mut record = store.require(kind, id)?;
            record.status = status;
            record.deleted_at = match status {
                RecordStatus::Deleted => Some(record.deleted_at.unwrap_or_else(|| store.now())),
                _ => None,
            };
            record.synced = false;
            record.sync_failure = Default::default();
            store.put(kind, &record)?;
        }
        tracing::info!(%kind, local_id = %id, %status, "record status changed");
        self.local_write();
        Ok(())
    }

    pub fn submit(&self, kind: EntityKind, id: LocalId) -> Result<()> {
        self.set_status(kind, id, RecordStatus::Submitted)
    }

    /// Soft delete; the tombstone is pushed like any other edit
    pub fn delete_draft(&self, kind: EntityKind, id: LocalId) -> Result<()> {
        self.set_status(kind, id, RecordStatus::Deleted)
    }

    /// Cloud-first read: pull the collection, then answer from the store.
    /// When the remote is unreachable the local copy and the last cached
    /// listing are returned instead.
    pub async fn get_records(&self, kind: EntityKind) -> Result<RecordListing> {
        let mut cached_only = !self.is_online();
        if !cached_only {
            if let Err(e) = self.coordinator.pull(kind).await {
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!(%kind, error = %e, "remote unreachable; serving local copy");
                cached_only = true;
            }
        }

        let store = self.store.lock();
        let records: Vec<LocalRecord> = store
            .get_all(kind)?
            .into_iter()
            .filter(|r| !r.is_deleted())
            .collect();
        let cached = if cached_only {
            store
                .cached_remote(kind)?
                .into_iter()
                .filter(|s| !records.iter().any(|r| r.sync_id == s.sync_id))
                .collect()
        } else {
            Vec::new()
        };
        Ok(RecordListing {
            records,
            cached,
            cached_only,
        })
    }

    /// Run one push pass right away, outside the scheduler
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.coordinator.sync_pending().await
    }

    /// Ask the background scheduler for a pass. Returns false when it is not
    /// running.
    pub fn trigger_sync(&self) -> bool {
        match self.scheduler.lock().as_ref() {
            Some(handle) => handle.trigger(SyncTrigger::Manual),
            None => false,
        }
    }

    pub async fn pull(&self, kind: EntityKind) -> Result<PullReport> {
        self.coordinator.pull(kind).await
    }

    /// Fold duplicates of every kind. Returns how many records were folded.
    pub fn repair_duplicates(&self) -> Result<usize> {
        let folded = dedup::repair_all(&self.store.lock())?;
        if folded > 0 {
            tracing::info!(folded, "duplicate records repaired");
            self.local_write();
        }
        Ok(folded)
    }

    pub fn repair_duplicates_of(&self, kind: EntityKind) -> Result<usize> {
        let folded = dedup::repair_duplicates(&self.store.lock(), kind)?;
        if folded > 0 {
            self.local_write();
        }
        Ok(folded)
    }

    /// Manual recovery of dossier sign-offs into the latest live dossier
    pub fn rescue_orphans(&self) -> Result<usize> {
        let folded = dedup::rescue_orphans(&self.store.lock())?;
        if folded > 0 {
            self.local_write();
        }
        Ok(folded)
    }

    pub fn quarantined(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        Ok(self.store.lock().quarantined(kind)?)
    }

    pub fn release_quarantine(&self, kind: EntityKind, id: LocalId) -> Result<bool> {
        let released = self.store.lock().release_quarantine(kind, id)?;
        if released {
            tracing::info!(%kind, local_id = %id, "quarantine released");
            self.local_write();
        }
        Ok(released)
    }

    pub fn pending_counts(&self) -> Result<std::collections::BTreeMap<EntityKind, usize>> {
        Ok(self.store.lock().pending_counts()?)
    }

    pub fn sync_progress(&self) -> Result<f64> {
        Ok(self.store.lock().sync_progress()?)
    }

    pub async fn rebuild(&self, kind: EntityKind, confirmation: &ResetConfirmation) -> Result<RebuildReport> {
        self.coordinator.rebuild(kind, confirmation).await
    }

    /// Wipe all local data. Unsynced drafts are lost.
    pub fn reset(&self, confirmation: ResetConfirmation) -> Result<ResetSummary> {
        Ok(self.store.lock().reset(confirmation)?)
    }

    /// Start the background scheduler and the realtime insert feeds.
    /// Calling it again while running does nothing.
    pub async fn start(&self) -> Result<()> {
        {
            let mut scheduler = self.scheduler.lock();
            if scheduler.is_some() {
                return Ok(());
            }
            let handle = SyncScheduler::new(
                self.coordinator.clone(),
                self.config.debounce(),
                self.config.periodic_interval(),
            )
            .spawn(self.is_online());
            *scheduler = Some(handle);
        }

        for kind in self.config.realtime_kinds.clone() {
            match self.watch_inserts(kind).await {
                Ok(sub) => self.subscriptions.lock().push(sub),
                Err(e) => tracing::warn!(%kind, error = %e, "realtime feed unavailable"),
            }
        }
        Ok(())
    }

    /// Subscribe to remote inserts of `kind`; notices go to [`Self::notices`]
    pub async fn watch_inserts(&self, kind: EntityKind) -> Result<Subscription> {
        let tx = self.notices.clone();
        let handler: remote::InsertHandler = Arc::new(move |row: RemoteRow| {
            match from_remote(kind, &row) {
                Ok(snapshot) => {
                    tracing::info!(%kind, official_id = ?snapshot.official_id, "new remote record");
                    let _ = tx.send(RemoteInsertNotice {
                        kind,
                        official_id: snapshot.official_id,
                        remote_id: snapshot.remote_id,
                    });
                }
                Err(e) => tracing::debug!(%kind, error = %e, "ignoring unmappable insert"),
            }
        });
        Ok(self
            .coordinator
            .remote()
            .subscribe_inserts(kind.remote_table(), handler)
            .await?)
    }

    pub fn notices(&self) -> broadcast::Receiver<RemoteInsertNotice> {
        self.notices.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            tracing::info!(online, "connectivity changed");
        }
        if let Some(handle) = self.scheduler.lock().as_ref() {
            handle.set_online(online);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.scheduler.lock().as_ref().map(|h| h.state())
    }

    pub fn last_pass(&self) -> Option<PassReport> {
        self.scheduler.lock().as_ref().and_then(|h| h.last_report())
    }

    pub fn subscribe_passes(&self) -> Option<tokio::sync::watch::Receiver<Option<PassReport>>> {
        self.scheduler.lock().as_ref().map(|h| h.subscribe_reports())
    }

    /// Stop the scheduler and drop the realtime feeds
    pub async fn shutdown(&self) {
        self.subscriptions.lock().clear();
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    fn local_write(&self) {
        if !self.is_online() {
            return;
        }
        if let Some(handle) = self.scheduler.lock().as_ref() {
            handle.trigger(SyncTrigger::LocalWrite);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> FieldSync {
        FieldSync::with_parts(
            LocalStore::open_in_memory().unwrap(),
            Arc::new(MemoryRemote::new()),
            SyncConfig::default(),
        )
    }

    #[test]
    fn test_save_draft_is_pending() {
        let fs = engine();
        let id = fs.save_draft(EntityKind::Shelter, json!({"name": "Escola"})).unwrap();
        let record = fs.store().lock().require(EntityKind::Shelter, id).unwrap();
        assert!(!record.synced);
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(fs.pending_counts().unwrap()[&EntityKind::Shelter], 1);
    }

    #[test]
    fn test_delete_draft_is_soft() {
        let fs = engine();
        let id = fs.save_draft(EntityKind::Shelter, json!({"name": "Escola"})).unwrap();
        fs.delete_draft(EntityKind::Shelter, id).unwrap();
        let record = fs.store().lock().require(EntityKind::Shelter, id).unwrap();
        assert!(record.is_deleted());
        assert!(record.deleted_at.is_some());
        assert!(!record.synced);
    }

    #[test]
    fn test_trigger_without_scheduler() {
        assert!(!engine().trigger_sync());
    }

    #[test]
    fn test_reset_requires_phrase() {
        let fs = engine();
        fs.save_draft(EntityKind::Shelter, json!({"name": "Escola"})).unwrap();
        assert!(fs.reset(ResetConfirmation::new("yes")).is_err());
        let summary = fs.reset(ResetConfirmation::confirmed()).unwrap();
        assert_eq!(summary.records_removed, 1);
    }
}
