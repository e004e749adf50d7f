/// Multi-author dossier model
/// Sector sign-offs, evidence and free-form fields as stored in the payload
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// When a sector signed off. Values that are not RFC 3339 are carried
/// verbatim so a merge never drops them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignOffTime {
    At(DateTime<Utc>),
    Raw(Value),
}

impl SignOffTime {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(t) => Some(*t),
            Self::Raw(_) => None,
        }
    }

    /// Earliest parsed time wins; a parsed time beats a raw one; between raw
    /// values the local one stands
    pub fn earliest(local: &Self, remote: &Self) -> Self {
        match (local, remote) {
            (Self::At(a), Self::At(b)) => Self::At(*a.min(b)),
            (Self::Raw(_), Self::At(_)) => remote.clone(),
            _ => local.clone(),
        }
    }
}

/// One sector's sign-off on a dossier. `submitted` never goes back to false
/// through a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSubmission {
    #[serde(default, alias = "preenchido")]
    pub submitted: bool,

    #[serde(
        default,
        alias = "data",
        deserialize_with = "lenient_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub submitted_at: Option<SignOffTime>,

    #[serde(default, alias = "usuario", skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,

    #[serde(default, alias = "cargo", skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, alias = "assinatura_url", skip_serializing_if = "Option::is_none")]
    pub signature_ref: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dossier {
    #[serde(
        default,
        alias = "submissoes_setoriais",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub section_submissions: BTreeMap<String, SectionSubmission>,

    /// Evidence items keyed by attachment id or URL
    #[serde(default, alias = "evidencias", skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Value>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Dossier {
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match serde_json::from_value(payload.clone()) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::debug!(error = %e, "payload is not a well-formed dossier");
                None
            }
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    pub fn submitted_sectors(&self) -> BTreeSet<String> {
        self.section_submissions
            .iter()
            .filter(|(_, s)| s.submitted)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Sectors marked submitted in a dossier payload, read leniently so that
/// malformed documents still report what they carry
pub fn submitted_sectors(payload: &Value) -> BTreeSet<String> {
    if let Some(d) = Dossier::from_payload(payload) {
        return d.submitted_sectors();
    }
    let sections = payload
        .get("sectionSubmissions")
        .or_else(|| payload.get("submissoes_setoriais"));
    match sections {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, s)| {
                s.get("submitted")
                    .or_else(|| s.get("preenchido"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<SignOffTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(d) => Some(SignOffTime::At(d.with_timezone(&Utc))),
            Err(_) => Some(SignOffTime::Raw(Value::String(s))),
        },
        Some(other) => Some(SignOffTime::Raw(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_field_names_are_accepted() {
        let payload = json!({
            "submissoes_setoriais": {
                "saude": {"preenchido": true, "usuario": "ana", "data": "2026-02-01T10:00:00Z", "responsavel": "Dra. Ana"},
                "obras": {"preenchido": false, "data": ""}
            },
            "evidencias": [{"url": "https://x/1.jpg"}],
            "tipificacao": {"cobrade": "1.2.1.0.0"}
        });
        let d = Dossier::from_payload(&payload).unwrap();
        assert!(d.section_submissions["saude"].submitted);
        assert_eq!(d.section_submissions["saude"].submitted_by.as_deref(), Some("ana"));
        assert_eq!(d.section_submissions["saude"].extra["responsavel"], "Dra. Ana");
        assert!(d.section_submissions["obras"].submitted_at.is_none());
        assert_eq!(d.evidence.len(), 1);

        let out = d.to_payload();
        assert!(out.get("sectionSubmissions").is_some());
        assert!(out.get("submissoes_setoriais").is_none());
        assert_eq!(out["tipificacao"]["cobrade"], "1.2.1.0.0");
    }

    #[test]
    fn test_unparsed_sign_off_time_round_trips() {
        let payload = json!({
            "sectionSubmissions": {
                "saude": {"submitted": true, "submittedAt": "2026-02-01"},
                "obras": {"submitted": true, "data": 1767225600},
                "educacao": {"submitted": true, "submittedAt": "2026-03-01T10:00:00Z"}
            }
        });
        let d = Dossier::from_payload(&payload).unwrap();
        assert_eq!(
            d.section_submissions["saude"].submitted_at,
            Some(SignOffTime::Raw(json!("2026-02-01")))
        );
        assert!(d.section_submissions["educacao"].submitted_at.as_ref().unwrap().at().is_some());

        let out = d.to_payload();
        assert_eq!(out["sectionSubmissions"]["saude"]["submittedAt"], "2026-02-01");
        assert_eq!(out["sectionSubmissions"]["obras"]["submittedAt"], 1767225600);
        assert_eq!(out["sectionSubmissions"]["educacao"]["submittedAt"], "2026-03-01T10:00:00Z");
    }

    #[test]
    fn test_empty_collections_are_not_serialized() {
        let d = Dossier::from_payload(&json!({"a": 1})).unwrap();
        assert_eq!(d.to_payload(), json!({"a": 1}));
    }

    #[test]
    fn test_submitted_sectors() {
        let payload = json!({"sectionSubmissions": {"saude": {"submitted": true}, "educacao": {"submitted": false}}});
        let sectors = submitted_sectors(&payload);
        assert_eq!(sectors.into_iter().collect::<Vec<_>>(), vec!["saude".to_string()]);
    }
}
