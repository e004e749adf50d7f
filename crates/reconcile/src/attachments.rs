//! Attachment capture and upload resolution.
//!
//! Binaries never live inside a document. Captured bytes are stored as
//! pending blobs and the document holds an `UploadTicket`, either as an
//! attachment `source` or as a `ticket://<uuid>` string. Before a record is
//! pushed every ticket is uploaded (or its cached URL reused) and rewritten
//! to the public URL; the blobs are deleted only once the remote write went
//! through.
//!
//! Tickets minted for inline data are derived from the owning record and the
//! data's position in the payload, so extracting the same payload again
//! lands on the same blob and its cached upload.
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use store::{EntityKind, PendingBlob, SyncId, UploadTicket};
use uuid::Uuid;

use crate::{RemoteRepository, Result, SharedStore, SyncError};

const TICKET_SCHEME: &str = "ticket://";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AttachmentSource {
    PendingUpload { ticket: UploadTicket },
    Remote { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,

    pub source: AttachmentSource,

    /// Capture metadata such as coordinates, timestamp or sector
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

/// Payload plus the binaries it references, ready to be saved together
#[derive(Debug, Clone)]
pub struct Draft {
    pub sync_id: SyncId,
    pub payload: Value,
    pub blobs: Vec<PendingBlob>,
}

pub struct DraftBuilder {
    kind: EntityKind,
    sync_id: SyncId,
    payload: Value,
    blobs: Vec<PendingBlob>,
}

impl DraftBuilder {
    pub fn new(kind: EntityKind, payload: Value) -> Self {
        Self::for_record(kind, SyncId::new(), payload)
    }

    /// Builder for an existing record, keeping its sync id
    pub fn for_record(kind: EntityKind, sync_id: SyncId, payload: Value) -> Self {
        Self {
            kind,
            sync_id,
            payload,
            blobs: Vec::new(),
        }
    }

    /// Append a captured binary to the kind's attachment list
    pub fn attach(
        mut self,
        id: impl Into<String>,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        caption: Option<String>,
    ) -> Self {
        let id = id.into();
        let ticket = UploadTicket::new();
        self.blobs.push(PendingBlob {
            ticket,
            entity_kind: self.kind,
            owner: self.sync_id,
            attachment_id: id.clone(),
            content_type: content_type.into(),
            bytes,
            remote_url: None,
        });

        let attachment = Attachment {
            id,
            caption,
            source: AttachmentSource::PendingUpload { ticket },
            meta: Map::new(),
        };
        let item = serde_json::to_value(&attachment).unwrap_or(Value::Null);

        if !self.payload.is_object() {
            self.payload = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.payload {
            let list = map
                .entry(self.kind.attachment_field().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match list {
                Value::Array(items) => items.push(item),
                other => *other = Value::Array(vec![item]),
            }
        }
        self
    }

    /// Move inline `data:` URLs already in the payload into pending blobs
    pub fn import_inline(mut self) -> Result<Self> {
        let found = extract_inline(self.kind, self.sync_id, &mut self.payload)?;
        self.blobs.extend(found);
        Ok(self)
    }

    pub fn build(self) -> Draft {
        Draft {
            sync_id: self.sync_id,
            payload: self.payload,
            blobs: self.blobs,
        }
    }
}

/// Decode `data:<mime>;base64,<data>`
pub fn decode_data_url(raw: &str) -> Option<(String, Vec<u8>)> {
    let rest = raw.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .ok()?;
    Some((mime.to_string(), bytes))
}

/// Replace inline `data:` URLs in `payload` by ticket references and return
/// the blobs to store. Objects keep their place as attachments with a
/// pending source; bare strings become `ticket://` references.
pub fn extract_inline(
    kind: EntityKind,
    owner: SyncId,
    payload: &mut Value,
) -> Result<Vec<PendingBlob>> {
    let mut blobs = Vec::new();
    extract_into(kind, owner, payload, "", &mut blobs);
    Ok(blobs)
}

fn inline_ticket(owner: SyncId, path: &str) -> UploadTicket {
    UploadTicket(Uuid::new_v5(&owner.0, path.as_bytes()))
}

fn extract_into(
    kind: EntityKind,
    owner: SyncId,
    value: &mut Value,
    path: &str,
    blobs: &mut Vec<PendingBlob>,
) {
    match value {
        Value::Object(map) => {
            let inline_key = ["url", "data"].into_iter().find(|k| {
                map.get(*k)
                    .and_then(Value::as_str)
                    .map(|s| s.starts_with("data:"))
                    .unwrap_or(false)
            });
            if let Some(key) = inline_key {
                let raw = map
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default();
                match decode_data_url(&raw) {
                    Some((content_type, bytes)) => {
                        let ticket = inline_ticket(owner, path);
                        let id = map
                            .get("id")
                            .and_then(|v| match v {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .unwrap_or_else(|| ticket.to_string());
                        blobs.push(PendingBlob {
                            ticket,
                            entity_kind: kind,
                            owner,
                            attachment_id: id.clone(),
                            content_type,
                            bytes,
                            remote_url: None,
                        });
                        map.remove(key);
                        map.insert("id".to_string(), Value::String(id));
                        map.insert(
                            "source".to_string(),
                            serde_json::to_value(AttachmentSource::PendingUpload { ticket })
                                .unwrap_or(Value::Null),
                        );
                        return;
                    }
                    None => tracing::warn!(%kind, "undecodable inline attachment left as is"),
                }
            }
            for (k, v) in map.iter_mut() {
                extract_into(kind, owner, v, &format!("{path}/{k}"), blobs);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter_mut().enumerate() {
                extract_into(kind, owner, v, &format!("{path}/{i}"), blobs);
            }
        }
        Value::String(s) if s.starts_with("data:") => {
            if let Some((content_type, bytes)) = decode_data_url(s) {
                let ticket = inline_ticket(owner, path);
                blobs.push(PendingBlob {
                    ticket,
                    entity_kind: kind,
                    owner,
                    attachment_id: ticket.to_string(),
                    content_type,
                    bytes,
                    remote_url: None,
                });
                *s = format!("{TICKET_SCHEME}{ticket}");
            }
        }
        _ => {}
    }
}

/// Tickets referenced anywhere in `payload`
pub fn pending_tickets(payload: &Value) -> Vec<UploadTicket> {
    let mut out = Vec::new();
    collect_tickets(payload, &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect_tickets(value: &Value, out: &mut Vec<UploadTicket>) {
    match value {
        Value::Object(map) => {
            if let Some(AttachmentSource::PendingUpload { ticket }) = map
                .get("source")
                .and_then(|s| serde_json::from_value::<AttachmentSource>(s.clone()).ok())
            {
                out.push(ticket);
            }
            for v in map.values() {
                collect_tickets(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_tickets(v, out)),
        Value::String(s) => {
            if let Some(ticket) = parse_ticket_ref(s) {
                out.push(ticket);
            }
        }
        _ => {}
    }
}

fn parse_ticket_ref(s: &str) -> Option<UploadTicket> {
    s.strip_prefix(TICKET_SCHEME)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(UploadTicket)
}

/// Drop every reference to `tickets` from `value`. Attachment items are
/// removed from their list; bare ticket strings become null.
pub fn detach_tickets(value: &mut Value, tickets: &BTreeSet<UploadTicket>) {
    let detached_ref = matches!(
        value,
        Value::String(s) if parse_ticket_ref(s.as_str()).map(|t| tickets.contains(&t)).unwrap_or(false)
    );
    if detached_ref {
        *value = Value::Null;
        return;
    }
    match value {
        Value::Object(map) => {
            if source_in(map.get("source"), tickets) {
                map.remove("source");
            }
            map.values_mut().for_each(|v| detach_tickets(v, tickets));
        }
        Value::Array(items) => {
            items.retain(|item| !source_in(item.get("source"), tickets));
            items.iter_mut().for_each(|v| detach_tickets(v, tickets));
        }
        _ => {}
    }
}

fn source_in(source: Option<&Value>, tickets: &BTreeSet<UploadTicket>) -> bool {
    match source.and_then(|s| serde_json::from_value::<AttachmentSource>(s.clone()).ok()) {
        Some(AttachmentSource::PendingUpload { ticket }) => tickets.contains(&ticket),
        _ => false,
    }
}

/// Swap every resolved ticket reference for its public URL
pub fn rewrite_tickets(value: &mut Value, urls: &HashMap<UploadTicket, String>) {
    match value {
        Value::Object(map) => {
            let resolved = map
                .get("source")
                .and_then(|s| serde_json::from_value::<AttachmentSource>(s.clone()).ok())
                .and_then(|source| match source {
                    AttachmentSource::PendingUpload { ticket } => urls.get(&ticket).cloned(),
                    AttachmentSource::Remote { .. } => None,
                });
            if let Some(url) = resolved {
                map.insert(
                    "source".to_string(),
                    serde_json::to_value(AttachmentSource::Remote { url }).unwrap_or(Value::Null),
                );
            }
            for v in map.values_mut() {
                rewrite_tickets(v, urls);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_tickets(v, urls)),
        Value::String(s) => {
            if let Some(url) = parse_ticket_ref(s).and_then(|t| urls.get(&t)) {
                *s = url.clone();
            }
        }
        _ => {}
    }
}

/// A payload ready to be pushed and the tickets it was resolved from
#[derive(Debug, Clone)]
pub struct ResolvedPayload {
    pub payload: Value,
    pub tickets: Vec<UploadTicket>,
}

/// Upload every pending binary `payload` references and return the payload
/// with public URLs in place of tickets
pub async fn resolve_attachments(
    store: &SharedStore,
    remote: &Arc<dyn RemoteRepository>,
    kind: EntityKind,
    owner: SyncId,
    payload: &Value,
) -> Result<ResolvedPayload> {
    let mut payload = payload.clone();

    // Records written by older clients may still carry inline data
    let inline = extract_inline(kind, owner, &mut payload)?;
    if !inline.is_empty() {
        let store = store.lock();
        for blob in &inline {
            store.insert_blob(blob)?;
        }
    }

    let tickets = pending_tickets(&payload);
    let mut urls = HashMap::new();
    for &ticket in &tickets {
        let blob = store
            .lock()
            .get_blob(ticket)?
            .ok_or(SyncError::MissingBlob(ticket))?;
        let url = match blob.remote_url.clone() {
            Some(url) => url,
            None => {
                let path = format!("{owner}/{}.{}", blob.attachment_id, blob.extension());
                let url = remote
                    .upload_blob(kind.bucket(), &path, blob.bytes.clone(), &blob.content_type)
                    .await?;
                store.lock().record_blob_upload(ticket, &url)?;
                tracing::debug!(%kind, %ticket, %url, "attachment uploaded");
                url
            }
        };
        urls.insert(ticket, url);
    }

    rewrite_tickets(&mut payload, &urls);
    Ok(ResolvedPayload { payload, tickets })
}
