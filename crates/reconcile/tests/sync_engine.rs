use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use store::{LocalStore, ManualClock, NewRecord, SyncFailure};

use reconcile::*;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()))
}

fn engine_with(config: SyncConfig) -> (FieldSync, Arc<MemoryRemote>) {
    let remote = Arc::new(MemoryRemote::new());
    let store = LocalStore::open_in_memory().unwrap().with_clock(clock());
    (FieldSync::with_parts(store, remote.clone(), config), remote)
}

fn engine() -> (FieldSync, Arc<MemoryRemote>) {
    engine_with(SyncConfig::default())
}

/// A row as another device would have written it
fn remote_row(kind: EntityKind, sync_id: SyncId, payload: serde_json::Value) -> RemoteRow {
    let record = LocalRecord {
        local_id: LocalId(0),
        entity_kind: kind,
        sync_id,
        official_id: None,
        remote_id: None,
        payload,
        status: RecordStatus::Draft,
        synced: true,
        revision: 1,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
        sync_failure: SyncFailure::default(),
    };
    to_remote(kind, &record).unwrap()
}

/// Memory backend that yields before every call so concurrent passes interleave
struct YieldingRemote(Arc<MemoryRemote>);

#[async_trait]
impl RemoteRepository for YieldingRemote {
    fn name(&self) -> &str {
        "yielding"
    }

    async fn insert(&self, table: &str, row: RemoteRow) -> remote::Result<RemoteRow> {
        tokio::task::yield_now().await;
        self.0.insert(table, row).await
    }

    async fn upsert(&self, table: &str, on_conflict: &str, row: RemoteRow) -> remote::Result<RemoteRow> {
        tokio::task::yield_now().await;
        self.0.upsert(table, on_conflict, row).await
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> remote::Result<Vec<RemoteRow>> {
        tokio::task::yield_now().await;
        self.0.select(table, query).await
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> remote::Result<String> {
        tokio::task::yield_now().await;
        self.0.upload_blob(bucket, path, bytes, content_type).await
    }

    async fn subscribe_inserts(
        &self,
        table: &str,
        handler: remote::InsertHandler,
    ) -> remote::Result<Subscription> {
        self.0.subscribe_inserts(table, handler).await
    }
}

#[tokio::test]
async fn test_official_ids_increase_within_year() {
    let (fs, remote) = engine();
    let a = fs.save_draft(EntityKind::Dossier, json!({"municipio": "Itajai"})).unwrap();
    let b = fs.save_draft(EntityKind::Dossier, json!({"municipio": "Blumenau"})).unwrap();

    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);

    let store = fs.store().lock();
    let first = store.require(EntityKind::Dossier, a).unwrap();
    let second = store.require(EntityKind::Dossier, b).unwrap();
    assert_eq!(first.official_id.as_deref(), Some("001/2026"));
    assert_eq!(second.official_id.as_deref(), Some("002/2026"));
    assert!(first.synced && second.synced);
    assert!(first.remote_id.is_some());
    assert_eq!(remote.rows("redap_records").len(), 2);
}

#[tokio::test]
async fn test_allocation_continues_after_remote_max() {
    let (fs, remote) = engine();
    let mut row = remote_row(EntityKind::Dossier, SyncId::new(), json!({}));
    row.insert("id_ocorrencia".into(), json!("041/2026"));
    remote.seed("redap_records", row);
    let mut old = remote_row(EntityKind::Dossier, SyncId::new(), json!({}));
    old.insert("id_ocorrencia".into(), json!("120/2025"));
    remote.seed("redap_records", old);

    let id = fs.save_draft(EntityKind::Dossier, json!({})).unwrap();
    fs.sync_now().await.unwrap();

    let record = fs.store().lock().require(EntityKind::Dossier, id).unwrap();
    assert_eq!(record.official_id.as_deref(), Some("042/2026"));
}

#[tokio::test]
async fn test_attachment_pushed_as_url_and_blob_kept_until_confirmed() {
    let (fs, remote) = engine();
    let draft = DraftBuilder::new(EntityKind::Inspection, json!({"processo": "P-77"}))
        .attach("f1", vec![0xff, 0xd8, 0xff], "image/jpeg", Some("fachada".into()))
        .build();
    let sync_id = draft.sync_id;
    let ticket = draft.blobs[0].ticket;
    let id = fs.save_draft_with(EntityKind::Inspection, draft).unwrap();

    // Captured offline
    remote.set_offline(true);
    assert_eq!(fs.sync_now().await.unwrap().failed, 1);
    assert_eq!(fs.store().lock().blobs_for(sync_id).unwrap(), vec![ticket]);

    // Uploaded, but the row itself is refused
    remote.set_offline(false);
    remote.reject_writes("vistorias", "schema mismatch");
    assert_eq!(fs.sync_now().await.unwrap().rejected, 1);
    let blob = fs.store().lock().get_blob(ticket).unwrap().unwrap();
    assert!(blob.remote_url.is_some());
    assert_eq!(remote.upload_count(), 1);

    remote.accept_writes("vistorias");
    assert_eq!(fs.sync_now().await.unwrap().synced, 1);
    assert_eq!(remote.upload_count(), 1);
    assert!(fs.store().lock().blobs_for(sync_id).unwrap().is_empty());

    let rows = remote.rows("vistorias");
    let url = rows[0]["fotos"][0]["source"]["url"].as_str().unwrap().to_string();
    assert!(url.starts_with(&format!("memory://vistorias/{sync_id}/f1")));
    assert_eq!(remote.blob(&url), Some(vec![0xff, 0xd8, 0xff]));
    assert!(!serde_json::Value::Object(rows[0].clone()).to_string().contains("pendingUpload"));

    let record = fs.store().lock().require(EntityKind::Inspection, id).unwrap();
    assert_eq!(record.payload["fotos"][0]["source"]["url"], url.as_str());
    assert_eq!(record.official_id.as_deref(), Some("01/2026"));
}

#[tokio::test]
async fn test_overlapping_passes_agree_on_official_id() {
    let memory = Arc::new(MemoryRemote::new());
    let store = LocalStore::open_in_memory().unwrap().with_clock(clock());
    let fs = FieldSync::with_parts(
        store,
        Arc::new(YieldingRemote(memory.clone())),
        SyncConfig::default(),
    );
    let id = fs.save_draft(EntityKind::Dossier, json!({"municipio": "Ilhota"})).unwrap();

    let (first, second) = tokio::join!(fs.sync_now(), fs.sync_now());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.synced + second.synced, 1);

    let record = fs.store().lock().require(EntityKind::Dossier, id).unwrap();
    let rows = memory.rows("redap_records");
    assert_eq!(rows.len(), 1);
    assert_eq!(record.official_id.as_deref(), Some("001/2026"));
    assert_eq!(rows[0]["id_ocorrencia"], "001/2026");
    assert!(record.synced);
}

#[tokio::test]
async fn test_legacy_inline_data_uploaded_once_across_rejections() {
    let (fs, remote) = engine_with(SyncConfig::default().with_max_rejections(0));
    let id = fs
        .store()
        .lock()
        .insert(
            EntityKind::Inspection,
            NewRecord::draft(json!({"processo": "P-9", "fotos": [{"id": "f1", "url": "data:image/png;base64,AAEC"}]})),
        )
        .unwrap();
    let sync_id = fs.store().lock().require(EntityKind::Inspection, id).unwrap().sync_id;

    remote.reject_writes("vistorias", "schema mismatch");
    for _ in 0..3 {
        assert_eq!(fs.sync_now().await.unwrap().rejected, 1);
    }
    assert_eq!(remote.upload_count(), 1);
    assert_eq!(fs.store().lock().blobs_for(sync_id).unwrap().len(), 1);

    remote.accept_writes("vistorias");
    assert_eq!(fs.sync_now().await.unwrap().synced, 1);
    assert_eq!(remote.upload_count(), 1);
    assert!(fs.store().lock().blobs_for(sync_id).unwrap().is_empty());
    let record = fs.store().lock().require(EntityKind::Inspection, id).unwrap();
    assert!(record.payload["fotos"][0]["source"]["url"]
        .as_str()
        .unwrap()
        .starts_with(&format!("memory://vistorias/{sync_id}/f1")));
}

#[tokio::test]
async fn test_inline_data_url_becomes_upload() {
    let (fs, remote) = engine();
    fs.save_draft(
        EntityKind::Dossier,
        json!({"evidence": [{"id": "e1", "url": "data:image/png;base64,AAEC", "caption": "ponte"}]}),
    )
    .unwrap();
    fs.sync_now().await.unwrap();

    assert_eq!(remote.upload_count(), 1);
    let rows = remote.rows("redap_records");
    let evidence = &rows[0]["data"]["evidence"][0];
    assert_eq!(evidence["caption"], "ponte");
    assert!(evidence["source"]["url"].as_str().unwrap().starts_with("memory://redap/"));
}

#[tokio::test]
async fn test_edited_twice_offline_pushes_final_state_once() {
    let (fs, remote) = engine();
    let id = fs.save_draft(EntityKind::Shelter, json!({"name": "Ginasio"})).unwrap();
    fs.update_draft(EntityKind::Shelter, id, json!({"name": "Ginasio", "capacity": 80})).unwrap();
    fs.update_draft(EntityKind::Shelter, id, json!({"name": "Ginasio Municipal", "capacity": 120}))
        .unwrap();

    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(remote.write_count("shelters"), 1);
    let rows = remote.rows("shelters");
    assert_eq!(rows[0]["name"], "Ginasio Municipal");
    assert_eq!(rows[0]["capacity"], 120);

    // Nothing left to push
    assert_eq!(fs.sync_now().await.unwrap().attempted(), 0);
    assert_eq!(remote.write_count("shelters"), 1);
}

#[tokio::test]
async fn test_network_failure_leaves_record_pending() {
    let (fs, remote) = engine();
    let id = fs.save_draft(EntityKind::Shelter, json!({"name": "Igreja"})).unwrap();
    remote.set_offline(true);

    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    let record = fs.store().lock().require(EntityKind::Shelter, id).unwrap();
    assert!(!record.synced);
    assert_eq!(record.sync_failure.attempts, 1);
    assert_eq!(record.sync_failure.rejections, 0);
    assert!(!record.sync_failure.quarantined);
}

#[tokio::test]
async fn test_repeated_rejection_quarantines() {
    let (fs, remote) = engine_with(SyncConfig::default().with_max_rejections(2));
    let bad = fs.save_draft(EntityKind::Shelter, json!({"name": "A"})).unwrap();
    remote.reject_writes("shelters", "violates check constraint");

    assert_eq!(fs.sync_now().await.unwrap().rejected, 1);
    assert_eq!(fs.sync_now().await.unwrap().quarantined, 1);
    assert_eq!(fs.sync_now().await.unwrap().attempted(), 0);

    let held = fs.quarantined(EntityKind::Shelter).unwrap();
    assert_eq!(held.len(), 1);
    assert!(held[0].sync_failure.last_error.as_deref().unwrap().contains("check constraint"));

    remote.accept_writes("shelters");
    assert!(fs.release_quarantine(EntityKind::Shelter, bad).unwrap());
    assert_eq!(fs.sync_now().await.unwrap().synced, 1);
}

#[tokio::test]
async fn test_rejection_does_not_block_siblings() {
    let (fs, remote) = engine();
    fs.save_draft(EntityKind::Shelter, json!({"name": "A"})).unwrap();
    fs.save_draft(EntityKind::Inspection, json!({"processo": "P-1"})).unwrap();
    remote.reject_writes("shelters", "bad row");

    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(remote.rows("vistorias").len(), 1);
}

#[tokio::test]
async fn test_edit_clears_quarantine() {
    let (fs, remote) = engine_with(SyncConfig::default().with_max_rejections(1));
    let id = fs.save_draft(EntityKind::Shelter, json!({"name": "A"})).unwrap();
    remote.reject_writes("shelters", "bad row");
    assert_eq!(fs.sync_now().await.unwrap().quarantined, 1);

    remote.accept_writes("shelters");
    fs.update_draft(EntityKind::Shelter, id, json!({"name": "A corrigido"})).unwrap();
    assert!(fs.quarantined(EntityKind::Shelter).unwrap().is_empty());
    assert_eq!(fs.sync_now().await.unwrap().synced, 1);
}

#[tokio::test]
async fn test_repair_leaves_one_survivor_with_all_sectors() {
    let (fs, _remote) = engine();
    let identity = json!({"cobrade": "1.2.1.0.0", "denominacao": "Inundacoes"});
    for sector in ["saude", "educacao", "obras"] {
        fs.save_draft(
            EntityKind::Dossier,
            json!({"tipificacao": identity.clone(), "sectionSubmissions": {sector: {"submitted": true}}}),
        )
        .unwrap();
    }

    assert_eq!(fs.repair_duplicates().unwrap(), 2);

    let records = fs.store().lock().get_all(EntityKind::Dossier).unwrap();
    let live: Vec<_> = records.iter().filter(|r| !r.is_deleted()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(
        submitted_sectors(&live[0].payload).into_iter().collect::<Vec<_>>(),
        vec!["educacao", "obras", "saude"]
    );
    assert!(records.iter().all(|r| !r.synced));
    assert_eq!(fs.repair_duplicates().unwrap(), 0);
}

#[tokio::test]
async fn test_rescue_folds_sign_offs_into_latest() {
    let (fs, _remote) = engine();
    let old = fs
        .save_draft(EntityKind::Dossier, json!({"sectionSubmissions": {"saude": {"submitted": true}}}))
        .unwrap();
    fs.delete_draft(EntityKind::Dossier, old).unwrap();
    let latest = fs.save_draft(EntityKind::Dossier, json!({"municipio": "Gaspar"})).unwrap();

    assert_eq!(fs.rescue_orphans().unwrap(), 1);
    let record = fs.store().lock().require(EntityKind::Dossier, latest).unwrap();
    assert!(submitted_sectors(&record.payload).contains("saude"));
    assert_eq!(record.payload["municipio"], "Gaspar");
    assert_eq!(fs.rescue_orphans().unwrap(), 0);
}

#[tokio::test]
async fn test_rescued_attachment_reaches_survivor() {
    let (fs, remote) = engine();
    let draft = DraftBuilder::new(
        EntityKind::Dossier,
        json!({"sectionSubmissions": {"saude": {"submitted": true}}}),
    )
    .attach("foto1", vec![7, 7, 7], "image/jpeg", None)
    .build();
    let orphan_sync = draft.sync_id;
    let orphan = fs.save_draft_with(EntityKind::Dossier, draft).unwrap();
    let latest = fs.save_draft(EntityKind::Dossier, json!({"municipio": "Gaspar"})).unwrap();
    let latest_sync = fs.store().lock().require(EntityKind::Dossier, latest).unwrap().sync_id;

    assert_eq!(fs.rescue_orphans().unwrap(), 1);
    assert_eq!(fs.store().lock().blobs_for(latest_sync).unwrap().len(), 1);

    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.rejected + report.failed + report.quarantined, 0);

    let store = fs.store().lock();
    let tombstone = store.require(EntityKind::Dossier, orphan).unwrap();
    let survivor = store.require(EntityKind::Dossier, latest).unwrap();
    assert!(tombstone.is_deleted() && tombstone.synced);
    assert!(survivor.synced);
    let url = survivor.payload["evidence"][0]["source"]["url"].as_str().unwrap();
    assert_eq!(remote.blob(url), Some(vec![7, 7, 7]));
    assert!(store.blobs_for(orphan_sync).unwrap().is_empty());
    assert!(store.blobs_for(latest_sync).unwrap().is_empty());
    assert_eq!(remote.upload_count(), 1);
}

#[tokio::test]
async fn test_repaired_attachment_survives_tombstone_push() {
    let (fs, remote) = engine();
    let identity = json!({"cobrade": "1.2.1.0.0", "denominacao": "Inundacoes"});
    let survivor = fs
        .save_draft(
            EntityKind::Dossier,
            json!({"tipificacao": identity.clone(), "sectionSubmissions": {"obras": {"submitted": true}}}),
        )
        .unwrap();
    let draft = DraftBuilder::new(
        EntityKind::Dossier,
        json!({"tipificacao": identity, "sectionSubmissions": {"saude": {"submitted": true}}}),
    )
    .attach("foto1", vec![1, 2], "image/png", Some("ponte".into()))
    .build();
    let duplicate = fs.save_draft_with(EntityKind::Dossier, draft).unwrap();

    assert_eq!(fs.repair_duplicates().unwrap(), 1);
    let report = fs.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);

    let store = fs.store().lock();
    let kept = store.require(EntityKind::Dossier, survivor).unwrap();
    let folded = store.require(EntityKind::Dossier, duplicate).unwrap();
    assert!(folded.is_deleted() && folded.synced);
    assert!(!folded.payload.to_string().contains("pendingUpload"));
    assert_eq!(kept.payload["evidence"][0]["caption"], "ponte");
    let url = kept.payload["evidence"][0]["source"]["url"].as_str().unwrap();
    assert_eq!(remote.blob(url), Some(vec![1, 2]));
}

#[tokio::test]
async fn test_pull_inserts_replaces_and_merges() {
    let (fs, remote) = engine();
    let kind = EntityKind::Shelter;

    // Unsynced local edit of a row that also changed remotely
    let shared = SyncId::new();
    let draft = Draft {
        sync_id: shared,
        payload: json!({"name": "Escola A", "capacity": 10}),
        blobs: Vec::new(),
    };
    let local = fs.save_draft_with(kind, draft).unwrap();
    remote.seed("shelters", remote_row(kind, shared, json!({"name": "Escola", "capacity": 50, "phone": "4733"})));

    // Synced local copy that the remote has since changed
    let synced_id = SyncId::new();
    fs.store()
        .lock()
        .insert(
            kind,
            NewRecord {
                synced: true,
                ..NewRecord::draft(json!({"name": "Velho"})).with_sync_id(synced_id)
            },
        )
        .unwrap();
    remote.seed("shelters", remote_row(kind, synced_id, json!({"name": "Novo"})));

    // Unknown to this device
    remote.seed("shelters", remote_row(kind, SyncId::new(), json!({"name": "Capela"})));

    let report = fs.pull(kind).await.unwrap();
    assert_eq!((report.inserted, report.replaced, report.merged), (1, 1, 1));

    let store = fs.store().lock();
    let merged = store.require(kind, local).unwrap();
    assert!(!merged.synced);
    assert_eq!(merged.payload["name"], "Escola A");
    assert_eq!(merged.payload["capacity"], 50);
    assert_eq!(merged.payload["phone"], "4733");

    let replaced = store.find_by_sync_id(kind, synced_id).unwrap().unwrap();
    assert!(replaced.synced);
    assert_eq!(replaced.payload["name"], "Novo");
    assert_eq!(store.get_all(kind).unwrap().len(), 3);
    assert_eq!(store.cached_remote(kind).unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_records_falls_back_when_offline() {
    let (fs, remote) = engine();
    remote.seed("shelters", remote_row(EntityKind::Shelter, SyncId::new(), json!({"name": "Capela"})));
    let online = fs.get_records(EntityKind::Shelter).await.unwrap();
    assert!(!online.cached_only);
    assert_eq!(online.records.len(), 1);

    fs.save_draft(EntityKind::Shelter, json!({"name": "Local"})).unwrap();
    remote.set_offline(true);
    let offline = fs.get_records(EntityKind::Shelter).await.unwrap();
    assert!(offline.cached_only);
    assert_eq!(offline.records.len(), 2);
    assert!(offline.cached.is_empty());
}

#[tokio::test]
async fn test_rebuild_restores_drafts() {
    let (fs, remote) = engine();
    let kind = EntityKind::Shelter;
    fs.store()
        .lock()
        .insert(
            kind,
            NewRecord {
                synced: true,
                ..NewRecord::draft(json!({"name": "Stale"}))
            },
        )
        .unwrap();
    let draft = fs.save_draft(kind, json!({"name": "Draft"})).unwrap();
    let draft_sync = fs.store().lock().require(kind, draft).unwrap().sync_id;
    remote.seed("shelters", remote_row(kind, SyncId::new(), json!({"name": "Remote"})));

    assert!(fs.rebuild(kind, &ResetConfirmation::new("sure")).await.is_err());
    assert_eq!(fs.store().lock().get_all(kind).unwrap().len(), 2);

    let report = fs.rebuild(kind, &ResetConfirmation::confirmed()).await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.drafts_restored, 1);

    let store = fs.store().lock();
    let names: Vec<String> = store
        .get_all(kind)
        .unwrap()
        .iter()
        .map(|r| r.payload["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"Remote".to_string()));
    assert!(names.contains(&"Draft".to_string()));
    assert!(!names.contains(&"Stale".to_string()));
    assert!(!store.find_by_sync_id(kind, draft_sync).unwrap().unwrap().synced);
    assert!(store.backups().unwrap().contains(&report.backup_table));
}

#[tokio::test]
async fn test_rebuild_offline_leaves_collection_untouched() {
    let (fs, remote) = engine();
    fs.save_draft(EntityKind::Shelter, json!({"name": "Draft"})).unwrap();
    remote.set_offline(true);
    assert!(fs
        .rebuild(EntityKind::Shelter, &ResetConfirmation::confirmed())
        .await
        .is_err());
    assert_eq!(fs.store().lock().get_all(EntityKind::Shelter).unwrap().len(), 1);
}

#[tokio::test]
async fn test_progress_reflects_pending() {
    let (fs, _remote) = engine();
    assert_eq!(fs.sync_progress().unwrap(), 100.0);
    fs.save_draft(EntityKind::Shelter, json!({"name": "A"})).unwrap();
    fs.save_draft(EntityKind::Shelter, json!({"name": "B"})).unwrap();
    assert_eq!(fs.sync_progress().unwrap(), 0.0);
    fs.sync_now().await.unwrap();
    assert_eq!(fs.sync_progress().unwrap(), 100.0);
    assert!(fs.pending_counts().unwrap().values().all(|&n| n == 0));
}
