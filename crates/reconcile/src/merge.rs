//! Field- and section-level merge of a local document with its remote copy.
//!
//! The merge is total: every pair of JSON values has a defined result and no
//! error is ever raised. Rules, applied recursively:
//! - strings: the local value unless it is blank, then the remote one
//! - numbers: the larger value
//! - booleans: OR
//! - objects: key union, values merged per key
//! - arrays of keyed objects (`id`, else `url`, else `source.url`): union by
//!   key, duplicates collapsed to the richer item, ordered by key
//! - other arrays: local items followed by remote items not already present
//! - null on one side: the other side
//! - differing types: local, unless local is empty
//!
//! Whole values taken from one side are normalized the same way merged values
//! are, so `merge(merge(a, b), b) == merge(a, b)`.
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use store::{EntityKind, RecordStatus};

use crate::document::{Dossier, SectionSubmission, SignOffTime};

/// Status and payload of one replica
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub status: RecordStatus,
    pub payload: Value,
}

impl Document {
    pub fn new(status: RecordStatus, payload: Value) -> Self {
        Self { status, payload }
    }
}

/// `submitted` dominates; otherwise the local status stands
pub fn merge_status(local: RecordStatus, remote: RecordStatus) -> RecordStatus {
    if local == RecordStatus::Submitted || remote == RecordStatus::Submitted {
        RecordStatus::Submitted
    } else {
        local
    }
}

pub fn merge_documents(kind: EntityKind, local: &Document, remote: &Document) -> Document {
    let payload = match kind {
        EntityKind::Dossier => merge_dossier(&local.payload, &remote.payload),
        _ => merge_value(&local.payload, &remote.payload),
    };
    let status = merge_status(local.status, remote.status);
    tracing::debug!(%kind, ?status, "documents merged");
    Document { status, payload }
}

/// Dossier merge: typed sector sign-offs, keyed evidence, generic fields.
/// Falls back to the generic merge when either side is not a dossier.
pub fn merge_dossier(local: &Value, remote: &Value) -> Value {
    let (Some(l), Some(r)) = (Dossier::from_payload(local), Dossier::from_payload(remote)) else {
        tracing::warn!("dossier payload did not parse; using generic merge");
        return merge_value(local, remote);
    };

    let mut sections: BTreeMap<String, SectionSubmission> = BTreeMap::new();
    for key in l.section_submissions.keys().chain(r.section_submissions.keys()) {
        if sections.contains_key(key) {
            continue;
        }
        let merged = match (l.section_submissions.get(key), r.section_submissions.get(key)) {
            (Some(a), Some(b)) => merge_section(a, b),
            (Some(a), None) | (None, Some(a)) => normalize_section(a),
            (None, None) => continue,
        };
        sections.insert(key.clone(), merged);
    }

    let evidence = match merge_value(&Value::Array(l.evidence), &Value::Array(r.evidence)) {
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    let fields = match merge_value(&Value::Object(l.fields), &Value::Object(r.fields)) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    Dossier {
        section_submissions: sections,
        evidence,
        fields,
    }
    .to_payload()
}

fn merge_section(local: &SectionSubmission, remote: &SectionSubmission) -> SectionSubmission {
    let extra = match merge_value(
        &Value::Object(local.extra.clone()),
        &Value::Object(remote.extra.clone()),
    ) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    SectionSubmission {
        submitted: local.submitted || remote.submitted,
        // First sign-off time is kept
        submitted_at: match (&local.submitted_at, &remote.submitted_at) {
            (Some(a), Some(b)) => Some(SignOffTime::earliest(a, b)),
            (a, b) => a.clone().or_else(|| b.clone()),
        },
        submitted_by: best_text(&local.submitted_by, &remote.submitted_by),
        role: best_text(&local.role, &remote.role),
        signature_ref: best_text(&local.signature_ref, &remote.signature_ref),
        extra,
    }
}

fn normalize_section(s: &SectionSubmission) -> SectionSubmission {
    let mut out = s.clone();
    if let Value::Object(map) = normalize(&Value::Object(s.extra.clone())) {
        out.extra = map;
    }
    out
}

fn best_text(local: &Option<String>, remote: &Option<String>) -> Option<String> {
    match (local, remote) {
        (Some(l), _) if !l.trim().is_empty() => Some(l.clone()),
        (_, Some(r)) if !r.trim().is_empty() => Some(r.clone()),
        (l, r) => l.clone().or_else(|| r.clone()),
    }
}

pub fn merge_value(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Null, other) | (other, Value::Null) => normalize(other),
        (Value::String(l), Value::String(r)) => {
            if l.trim().is_empty() {
                Value::String(r.clone())
            } else {
                Value::String(l.clone())
            }
        }
        (Value::Number(l), Value::Number(r)) => {
            if number_greater(r, l) {
                Value::Number(r.clone())
            } else {
                Value::Number(l.clone())
            }
        }
        (Value::Bool(l), Value::Bool(r)) => Value::Bool(*l || *r),
        (Value::Object(l), Value::Object(r)) => {
            let mut out = Map::new();
            for (k, lv) in l {
                let merged = match r.get(k) {
                    Some(rv) => merge_value(lv, rv),
                    None => normalize(lv),
                };
                out.insert(k.clone(), merged);
            }
            for (k, rv) in r {
                if !l.contains_key(k) {
                    out.insert(k.clone(), normalize(rv));
                }
            }
            Value::Object(out)
        }
        (Value::Array(l), Value::Array(r)) => merge_arrays(l, r),
        (l, r) => {
            if is_empty(l) {
                normalize(r)
            } else {
                normalize(l)
            }
        }
    }
}

/// Integers compare exactly; floats only when either side is one
fn number_greater(a: &Number, b: &Number) -> bool {
    match (a.as_i64(), b.as_i64(), a.as_u64(), b.as_u64()) {
        (Some(x), Some(y), _, _) => x > y,
        (_, _, Some(x), Some(y)) => x > y,
        // u64 past i64::MAX against a negative
        (None, Some(_), Some(_), None) => true,
        (Some(_), None, None, Some(_)) => false,
        _ => a.as_f64().unwrap_or(f64::MIN) > b.as_f64().unwrap_or(f64::MIN),
    }
}

fn merge_arrays(local: &[Value], remote: &[Value]) -> Value {
    if is_keyed(local) && is_keyed(remote) {
        return Value::Array(keyed_union(local.iter().chain(remote.iter())));
    }
    let mut out: Vec<Value> = local.iter().map(normalize).collect();
    for item in remote {
        let item = normalize(item);
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Value::Array(out)
}

/// Recursively bring a value into merged form
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        Value::Array(items) if is_keyed(items) && !items.is_empty() => {
            Value::Array(keyed_union(items.iter()))
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

fn keyed_union<'a>(items: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut by_key: BTreeMap<String, Value> = BTreeMap::new();
    for item in items {
        let Some(key) = item_key(item) else { continue };
        let item = normalize(item);
        match by_key.get(&key) {
            Some(existing) if richness(existing, &item) != Ordering::Less => {}
            _ => {
                by_key.insert(key, item);
            }
        }
    }
    by_key.into_values().collect()
}

/// Identity of an evidence item
pub fn item_key(item: &Value) -> Option<String> {
    let obj = item.as_object()?;
    let text = |v: &Value| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    obj.get("id")
        .and_then(text)
        .or_else(|| obj.get("url").and_then(text))
        .or_else(|| obj.get("source").and_then(|s| s.get("url")).and_then(text))
}

fn is_keyed(items: &[Value]) -> bool {
    items.iter().all(|i| item_key(i).is_some())
}

/// Total order on duplicates: captioned beats uncaptioned, uploaded beats
/// pending, then the canonical JSON text breaks the tie
fn richness(a: &Value, b: &Value) -> Ordering {
    let captioned = |v: &Value| {
        ["caption", "legenda"].iter().any(|k| {
            v.get(k)
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        })
    };
    let resolved = |v: &Value| match v.get("source") {
        Some(source) => source.get("kind").and_then(Value::as_str) == Some("remote"),
        None => v
            .get("url")
            .and_then(Value::as_str)
            .map(|u| !u.starts_with("data:"))
            .unwrap_or(false),
    };
    captioned(a)
        .cmp(&captioned(b))
        .then_with(|| resolved(a).cmp(&resolved(b)))
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
