//! Duplicate repair.
//!
//! Records of one kind that share an identity key are folded into a single
//! survivor through the merge engine. Folded records are soft-deleted and left
//! unsynced so the deletion reaches the remote on the next pass. Binaries
//! still waiting for upload move to the survivor along with the references.
use std::collections::{BTreeMap, BTreeSet};
use store::{EntityKind, LocalRecord, LocalStore, RecordStatus};

use crate::attachments::{detach_tickets, pending_tickets};
use crate::document::submitted_sectors;
use crate::merge::{merge_documents, Document};
use crate::Result;

/// Fold every identity group of `kind` into one survivor.
/// Returns how many records were folded away.
pub fn repair_duplicates(store: &LocalStore, kind: EntityKind) -> Result<usize> {
    let mut groups: BTreeMap<String, Vec<LocalRecord>> = BTreeMap::new();
    for record in store.get_all(kind)? {
        // A deleted dossier only takes part when it still carries sign-offs
        if record.is_deleted()
            && (kind != EntityKind::Dossier || submitted_sectors(&record.payload).is_empty())
        {
            continue;
        }
        if let Some(key) = kind.identity_key(&record.payload) {
            groups.entry(key).or_default().push(record);
        }
    }

    let mut folded = 0;
    for (key, members) in groups {
        // Deleted copies stay in play only while they hold sign-offs that no
        // live copy carries
        let live_sectors: BTreeSet<String> = members
            .iter()
            .filter(|r| !r.is_deleted())
            .flat_map(|r| submitted_sectors(&r.payload))
            .collect();
        let mut members: Vec<LocalRecord> = members
            .into_iter()
            .filter(|r| !r.is_deleted() || !submitted_sectors(&r.payload).is_subset(&live_sectors))
            .collect();
        if members.len() < 2 {
            continue;
        }
        let target_index = members.iter().position(|r| !r.is_deleted()).unwrap_or(0);
        let target = members.remove(target_index);
        tracing::info!(%kind, identity = %key, survivor = %target.local_id, duplicates = members.len(), "repairing duplicate group");
        folded += fold_into(store, kind, target, &members)?;
    }
    Ok(folded)
}

pub fn repair_all(store: &LocalStore) -> Result<usize> {
    let mut total = 0;
    for kind in EntityKind::ALL {
        total += repair_duplicates(store, kind)?;
    }
    Ok(total)
}

/// Manual recovery for dossiers: every other record carrying sector sign-offs
/// is folded into the most recently updated live dossier, regardless of
/// identity. Does nothing when there is no live dossier.
pub fn rescue_orphans(store: &LocalStore) -> Result<usize> {
    let kind = EntityKind::Dossier;
    let records = store.get_all(kind)?;

    let Some(target) = records
        .iter()
        .filter(|r| !r.is_deleted())
        .max_by_key(|r| (r.updated_at, r.local_id))
        .cloned()
    else {
        tracing::warn!("no live dossier to rescue into");
        return Ok(0);
    };

    let held = submitted_sectors(&target.payload);
    let sources: Vec<LocalRecord> = records
        .into_iter()
        .filter(|r| r.local_id != target.local_id)
        .filter(|r| {
            let sectors = submitted_sectors(&r.payload);
            !sectors.is_empty() && (!r.is_deleted() || !sectors.is_subset(&held))
        })
        .collect();
    if sources.is_empty() {
        return Ok(0);
    }
    tracing::warn!(target = %target.local_id, sources = sources.len(), "rescuing dossier sign-offs");
    fold_into(store, kind, target, &sources)
}

fn fold_into(
    store: &LocalStore,
    kind: EntityKind,
    mut target: LocalRecord,
    sources: &[LocalRecord],
) -> Result<usize> {
    let mut doc = Document::new(target.status, target.payload.clone());
    for source in sources {
        doc = merge_documents(kind, &doc, &Document::new(source.status, source.payload.clone()));
        if target.official_id.is_none() {
            target.official_id = source.official_id.clone();
        }
    }

    target.payload = doc.payload;
    target.status = match doc.status {
        // A survivor picked from an all-deleted group is revived
        RecordStatus::Deleted => RecordStatus::Draft,
        other => other,
    };
    target.deleted_at = None;
    target.synced = false;

    let moved: BTreeSet<_> = pending_tickets(&target.payload).into_iter().collect();
    if !moved.is_empty() {
        let tickets: Vec<_> = moved.iter().copied().collect();
        store.reassign_blobs(&tickets, target.sync_id)?;
    }
    store.put(kind, &target)?;

    let now = store.now();
    for source in sources {
        let mut folded = source.clone();
        detach_tickets(&mut folded.payload, &moved);
        if source.is_deleted() {
            if folded.payload != source.payload {
                store.put(kind, &folded)?;
            }
            continue;
        }
        folded.status = RecordStatus::Deleted;
        folded.deleted_at = Some(folded.deleted_at.unwrap_or(now));
        folded.synced = false;
        store.put(kind, &folded)?;
    }
    Ok(sources.len())
}
