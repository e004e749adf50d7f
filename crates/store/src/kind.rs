/// Closed set of entity kinds handled by the local store
/// Each kind carries its local table, remote table, bucket and field mapping
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Inspection,
    Interdiction,
    Shelter,
    ShelterOccupant,
    ShelterDonation,
    ShelterInventory,
    ShelterDistribution,
    Dossier,
}

/// Human-readable numbering scheme for kinds that carry an official ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numbering {
    /// Remote column holding the formatted identifier
    pub column: &'static str,
    /// Zero-padded width of the numeric component
    pub width: usize,
}

/// One payload field with a dedicated remote column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub local: &'static str,
    pub remote: &'static str,
}

const fn field(local: &'static str, remote: &'static str) -> FieldMapping {
    FieldMapping { local, remote }
}

const INSPECTION_FIELDS: &[FieldMapping] = &[
    field("processo", "processo"),
    field("agente", "agente"),
    field("matricula", "matricula"),
    field("solicitante", "solicitante"),
    field("cpf", "cpf"),
    field("telefone", "telefone"),
    field("endereco", "endereco"),
    field("coordenadas", "coordenadas"),
    field("dataHora", "data_hora"),
    field("tipoInfo", "tipo_info"),
    field("observacoes", "observacoes"),
    field("fotos", "fotos"),
    field("documentos", "documentos"),
];

const INTERDICTION_FIELDS: &[FieldMapping] = &[
    field("dataHora", "data_hora"),
    field("municipio", "municipio"),
    field("bairro", "bairro"),
    field("endereco", "endereco"),
    field("tipoAlvo", "tipo_alvo"),
    field("tipoAlvoEspecificar", "tipo_alvo_especificar"),
    field("latitude", "latitude"),
    field("longitude", "longitude"),
    field("coordenadas", "coordenadas"),
    field("responsavelNome", "responsavel_nome"),
    field("responsavelCpf", "responsavel_cpf"),
    field("responsavelTelefone", "responsavel_telefone"),
    field("responsavelEmail", "responsavel_email"),
    field("riscoTipo", "risco_tipo"),
    field("riscoGrau", "risco_grau"),
    field("situacaoObservada", "situacao_observada"),
    field("medidaTipo", "medida_tipo"),
    field("medidaPrazo", "medida_prazo"),
    field("medidaPrazoData", "medida_prazo_data"),
    field("evacuacaoNecessaria", "evacuacao_necessaria"),
    field("fotos", "fotos"),
    field("relatorioTecnico", "relatorio_tecnico"),
    field("recomendacoes", "recomendacoes"),
    field("orgaosAcionados", "orgaos_acionados"),
];

const SHELTER_FIELDS: &[FieldMapping] = &[
    field("name", "name"),
    field("address", "address"),
    field("capacity", "capacity"),
    field("status", "status"),
    field("managerName", "manager_name"),
    field("phone", "phone"),
];

const OCCUPANT_FIELDS: &[FieldMapping] = &[
    field("shelterId", "shelter_id"),
    field("fullName", "full_name"),
    field("cpf", "cpf"),
    field("familyGroup", "family_group"),
    field("isFamilyHead", "is_family_head"),
    field("status", "status"),
    field("entryDate", "entry_date"),
];

const DONATION_FIELDS: &[FieldMapping] = &[
    field("shelterId", "shelter_id"),
    field("donationType", "donation_type"),
    field("donorName", "donor_name"),
    field("quantity", "quantity"),
    field("unit", "unit"),
    field("donationDate", "donation_date"),
];

const INVENTORY_FIELDS: &[FieldMapping] = &[
    field("shelterId", "shelter_id"),
    field("itemName", "item_name"),
    field("category", "category"),
    field("quantity", "quantity"),
    field("unit", "unit"),
];

const DISTRIBUTION_FIELDS: &[FieldMapping] = &[
    field("shelterId", "shelter_id"),
    field("inventoryId", "inventory_id"),
    field("itemName", "item_name"),
    field("quantity", "quantity"),
    field("recipientName", "recipient_name"),
    field("distributionDate", "distribution_date"),
];

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Inspection,
        EntityKind::Interdiction,
        EntityKind::Shelter,
        EntityKind::ShelterOccupant,
        EntityKind::ShelterDonation,
        EntityKind::ShelterInventory,
        EntityKind::ShelterDistribution,
        EntityKind::Dossier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inspection => "inspection",
            Self::Interdiction => "interdiction",
            Self::Shelter => "shelter",
            Self::ShelterOccupant => "shelter_occupant",
            Self::ShelterDonation => "shelter_donation",
            Self::ShelterInventory => "shelter_inventory",
            Self::ShelterDistribution => "shelter_distribution",
            Self::Dossier => "dossier",
        }
    }

    /// Local collection (SQLite table) holding this kind
    pub fn local_table(&self) -> &'static str {
        match self {
            Self::Inspection => "inspections",
            Self::Interdiction => "interdictions",
            Self::Shelter => "shelters",
            Self::ShelterOccupant => "shelter_occupants",
            Self::ShelterDonation => "shelter_donations",
            Self::ShelterInventory => "shelter_inventory",
            Self::ShelterDistribution => "shelter_distributions",
            Self::Dossier => "dossiers",
        }
    }

    pub fn remote_table(&self) -> &'static str {
        match self {
            Self::Inspection => "vistorias",
            Self::Interdiction => "interdicoes",
            Self::Shelter => "shelters",
            Self::ShelterOccupant => "occupants",
            Self::ShelterDonation => "donations",
            Self::ShelterInventory => "inventory",
            Self::ShelterDistribution => "distributions",
            Self::Dossier => "redap_records",
        }
    }

    /// Object-storage bucket for attachments of this kind
    pub fn bucket(&self) -> &'static str {
        match self {
            Self::Inspection => "vistorias",
            Self::Interdiction => "interdicoes",
            Self::Dossier => "redap",
            Self::Shelter
            | Self::ShelterOccupant
            | Self::ShelterDonation
            | Self::ShelterInventory
            | Self::ShelterDistribution => "shelters",
        }
    }

    pub fn numbering(&self) -> Option<Numbering> {
        match self {
            Self::Inspection => Some(Numbering {
                column: "vistoria_id",
                width: 2,
            }),
            Self::Interdiction => Some(Numbering {
                column: "interdicao_id",
                width: 2,
            }),
            Self::Dossier => Some(Numbering {
                column: "id_ocorrencia",
                width: 3,
            }),
            _ => None,
        }
    }

    /// Remote column the upsert conflicts on
    pub fn sync_id_column(&self) -> &'static str {
        match self {
            Self::Dossier => "redap_id",
            _ => "sync_id",
        }
    }

    /// Remote column carrying the record lifecycle status
    pub fn status_column(&self) -> &'static str {
        match self {
            Self::Dossier => "status",
            _ => "record_status",
        }
    }

    /// JSON column holding payload keys without a dedicated column
    pub fn catch_all_column(&self) -> &'static str {
        match self {
            Self::Dossier => "data",
            _ => "extra",
        }
    }

    pub fn fields(&self) -> &'static [FieldMapping] {
        match self {
            Self::Inspection => INSPECTION_FIELDS,
            Self::Interdiction => INTERDICTION_FIELDS,
            Self::Shelter => SHELTER_FIELDS,
            Self::ShelterOccupant => OCCUPANT_FIELDS,
            Self::ShelterDonation => DONATION_FIELDS,
            Self::ShelterInventory => INVENTORY_FIELDS,
            Self::ShelterDistribution => DISTRIBUTION_FIELDS,
            Self::Dossier => &[],
        }
    }

    /// Payload key that new attachments are appended to
    pub fn attachment_field(&self) -> &'static str {
        match self {
            Self::Dossier => "evidence",
            Self::Inspection | Self::Interdiction => "fotos",
            _ => "attachments",
        }
    }

    /// Semantic identity used to detect duplicates created independently offline.
    /// Kinds without a natural key never deduplicate.
    pub fn identity_key(&self, payload: &serde_json::Value) -> Option<String> {
        let text = |path: &[&str]| -> String {
            let mut cur = payload;
            for part in path {
                match cur.get(part) {
                    Some(next) => cur = next,
                    None => return String::new(),
                }
            }
            match cur {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => String::new(),
            }
        };

        let parts = match self {
            Self::Dossier => vec![
                text(&["tipificacao", "cobrade"]),
                text(&["tipificacao", "denominacao"]),
            ],
            Self::Shelter => vec![text(&["name"])],
            Self::ShelterOccupant => vec![text(&["shelterId"]), text(&["fullName"])],
            Self::ShelterInventory => vec![text(&["category"]), text(&["itemName"])],
            _ => return None,
        };

        let normalized: Vec<String> = parts.iter().map(|p| normalize_key_part(p)).collect();
        if normalized.iter().all(|p| p.is_empty()) {
            return None;
        }
        Some(normalized.join("_"))
    }
}

fn normalize_key_part(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.local_table() == s)
            .ok_or_else(|| StoreError::UnknownKind(s.to_string()))
    }
}
