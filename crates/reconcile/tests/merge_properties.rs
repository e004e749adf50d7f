use serde_json::{json, Value};
use store::{EntityKind, RecordStatus};

use reconcile::merge::{merge_dossier, merge_value};
use reconcile::{merge_documents, submitted_sectors, Document};

fn samples() -> Vec<Value> {
    vec![
        json!({}),
        json!({
            "municipio": "Itajai",
            "afetados": 120,
            "sectionSubmissions": {
                "saude": {"submitted": true, "submittedAt": "2026-03-01T10:00:00Z", "submittedBy": "ana"}
            },
            "evidence": [{"id": "e1", "source": {"kind": "remote", "url": "https://cdn/e1.jpg"}}]
        }),
        json!({
            "municipio": "",
            "afetados": 300,
            "danos": {"pontes": 2, "obs": ["ponte norte"]},
            "sectionSubmissions": {
                "saude": {"submitted": false},
                "educacao": {"submitted": true, "submittedAt": "2026-03-02T08:30:00Z"}
            },
            "evidence": [
                {"id": "e1", "caption": "ponte", "source": {"kind": "remote", "url": "https://cdn/e1.jpg"}},
                {"id": "e2", "source": {"kind": "remote", "url": "https://cdn/e2.jpg"}}
            ]
        }),
        json!({
            "municipio": "Navegantes",
            "danos": {"pontes": 1, "obs": ["ponte sul"], "escolas": null},
            "sectionSubmissions": {
                "obras": {"preenchido": true, "usuario": "caio", "cargo": "engenheiro"}
            },
            "evidencias": [{"url": "https://cdn/e3.jpg"}]
        }),
    ]
}

fn sectors_of(payload: &Value, sector: &str) -> bool {
    submitted_sectors(payload).contains(sector)
}

#[test]
fn test_merge_is_idempotent() {
    for a in samples() {
        for b in samples() {
            let once = merge_dossier(&a, &b);
            let twice = merge_dossier(&once, &b);
            assert_eq!(twice, once, "merge(merge(a, b), b) != merge(a, b) for\n{a}\n{b}");
        }
    }
}

#[test]
fn test_generic_merge_is_idempotent() {
    for a in samples() {
        for b in samples() {
            let once = merge_value(&a, &b);
            assert_eq!(merge_value(&once, &b), once);
        }
    }
}

#[test]
fn test_submitted_is_or_of_both_sides() {
    for a in samples() {
        for b in samples() {
            let merged = merge_dossier(&a, &b);
            for sector in ["saude", "educacao", "obras"] {
                assert_eq!(
                    sectors_of(&merged, sector),
                    sectors_of(&a, sector) || sectors_of(&b, sector),
                    "sector {sector} for\n{a}\n{b}"
                );
            }
        }
    }
}

#[test]
fn test_flags_and_evidence_commute() {
    for a in samples() {
        for b in samples() {
            let ab = merge_dossier(&a, &b);
            let ba = merge_dossier(&b, &a);
            assert_eq!(submitted_sectors(&ab), submitted_sectors(&ba));
            assert_eq!(ab.get("evidence"), ba.get("evidence"));
        }
    }
}

#[test]
fn test_scalars_prefer_local() {
    let local = json!({"municipio": "Itajai"});
    let remote = json!({"municipio": "Navegantes"});
    assert_eq!(merge_dossier(&local, &remote)["municipio"], "Itajai");
    assert_eq!(merge_dossier(&remote, &local)["municipio"], "Navegantes");
}

#[test]
fn test_sectors_from_both_devices_survive() {
    let local = Document::new(
        RecordStatus::Draft,
        json!({"sectionSubmissions": {"saude": {"submitted": true}}}),
    );
    let remote = Document::new(
        RecordStatus::Draft,
        json!({"sectionSubmissions": {"educacao": {"submitted": true}}}),
    );
    let merged = merge_documents(EntityKind::Dossier, &local, &remote);
    assert!(sectors_of(&merged.payload, "saude"));
    assert!(sectors_of(&merged.payload, "educacao"));
}

#[test]
fn test_submitted_status_dominates() {
    let local = Document::new(RecordStatus::Draft, json!({}));
    let remote = Document::new(RecordStatus::Submitted, json!({}));
    assert_eq!(
        merge_documents(EntityKind::Dossier, &local, &remote).status,
        RecordStatus::Submitted
    );
    let deleted = Document::new(RecordStatus::Deleted, json!({}));
    assert_eq!(
        merge_documents(EntityKind::Shelter, &local, &deleted).status,
        RecordStatus::Draft
    );
}

#[test]
fn test_evidence_deduplicated_by_key() {
    let merged = merge_dossier(&samples()[1], &samples()[2]);
    let evidence = merged["evidence"].as_array().unwrap();
    assert_eq!(evidence.len(), 2);
    assert_eq!(evidence[0]["id"], "e1");
    assert_eq!(evidence[0]["caption"], "ponte");
}

#[test]
fn test_first_sign_off_time_kept() {
    let local = json!({"sectionSubmissions": {"saude": {"submitted": true, "submittedAt": "2026-03-05T00:00:00Z"}}});
    let remote = json!({"sectionSubmissions": {"saude": {"submitted": true, "submittedAt": "2026-03-01T00:00:00Z"}}});
    let merged = merge_dossier(&local, &remote);
    assert_eq!(
        merged["sectionSubmissions"]["saude"]["submittedAt"],
        "2026-03-01T00:00:00Z"
    );
}

#[test]
fn test_unparsed_sign_off_time_survives_merge() {
    let local = json!({"sectionSubmissions": {"saude": {"submitted": true, "submittedAt": "2026-02-01"}}});
    let remote = json!({"sectionSubmissions": {"educacao": {"submitted": true}}});
    let merged = merge_dossier(&local, &remote);
    assert_eq!(merged["sectionSubmissions"]["saude"]["submittedAt"], "2026-02-01");

    let parsed = json!({"sectionSubmissions": {"saude": {"submitted": true, "submittedAt": "2026-03-01T00:00:00Z"}}});
    let merged = merge_dossier(&local, &parsed);
    assert_eq!(merged["sectionSubmissions"]["saude"]["submittedAt"], "2026-03-01T00:00:00Z");
    assert_eq!(merge_dossier(&merged, &parsed), merged);
}
