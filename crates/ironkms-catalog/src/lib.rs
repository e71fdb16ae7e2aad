//! Static volume-license product catalog.
//!
//! Built once at startup from an embedded JSON resource and shared
//! read-only across sessions: application groups (families of SKUs
//! sharing a KMS identity) and individual SKUs, both keyed by canonical
//! UUID bytes for O(1) lookup.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

const EMBEDDED_CATALOG: &str = include_str!("../data/catalog.json");

/// Family of SKUs sharing a KMS identity (Windows, Office, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationGroup {
    pub id: Uuid,
    pub display_name: String,
    /// First five decimal digits of EPIDs derived for this group.
    pub pid_prefix: String,
    /// Activation threshold this group's clients expect to see met.
    pub min_clients: u32,
}

/// A specific product edition.
#[derive(Debug, Clone, Deserialize)]
pub struct Sku {
    pub id: Uuid,
    pub display_name: String,
    pub group: Uuid,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    groups: Vec<ApplicationGroup>,
    skus: Vec<Sku>,
}

/// Catalog loading failure; fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("malformed catalog resource")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate identifier {0} in catalog")]
    DuplicateId(Uuid),
    #[error("SKU {sku} references unknown application group {group}")]
    UnknownGroup { sku: Uuid, group: Uuid },
    #[error("application group {group} has a malformed PID prefix {prefix:?}")]
    BadPidPrefix { group: Uuid, prefix: String },
}

/// The static product catalog.
#[derive(Debug)]
pub struct Catalog {
    groups: HashMap<Uuid, ApplicationGroup>,
    skus: HashMap<Uuid, Sku>,
}

impl Catalog {
    /// Loads the catalog embedded in this crate.
    pub fn load_embedded() -> Result<Self, CatalogError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    /// Parses a catalog from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;

        let mut groups = HashMap::with_capacity(file.groups.len());
        for group in file.groups {
            if group.pid_prefix.len() != 5 || !group.pid_prefix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CatalogError::BadPidPrefix {
                    group: group.id,
                    prefix: group.pid_prefix,
                });
            }
            let id = group.id;
            if groups.insert(id, group).is_some() {
                return Err(CatalogError::DuplicateId(id));
            }
        }

        let mut skus = HashMap::with_capacity(file.skus.len());
        for sku in file.skus {
            if !groups.contains_key(&sku.group) {
                return Err(CatalogError::UnknownGroup {
                    sku: sku.id,
                    group: sku.group,
                });
            }
            let id = sku.id;
            if skus.insert(id, sku).is_some() {
                return Err(CatalogError::DuplicateId(id));
            }
        }

        Ok(Self { groups, skus })
    }

    /// Looks up an application group.
    pub fn group(&self, id: &Uuid) -> Option<&ApplicationGroup> {
        self.groups.get(id)
    }

    /// Looks up a SKU.
    pub fn sku(&self, id: &Uuid) -> Option<&Sku> {
        self.skus.get(id)
    }

    /// Display name of an application group, falling back to the
    /// hyphenated hex form for unknown UUIDs.
    pub fn app_name(&self, id: &Uuid) -> String {
        match self.groups.get(id) {
            Some(group) => group.display_name.clone(),
            None => id.to_string(),
        }
    }

    /// Display name of a SKU, falling back to the hyphenated hex form
    /// for unknown UUIDs.
    pub fn sku_name(&self, id: &Uuid) -> String {
        match self.skus.get(id) {
            Some(sku) => sku.display_name.clone(),
            None => id.to_string(),
        }
    }

    /// Activation threshold of an application group; zero for unknown
    /// groups (the configured client count then prevails).
    pub fn min_clients(&self, id: &Uuid) -> u32 {
        self.groups.get(id).map(|group| group.min_clients).unwrap_or(0)
    }

    /// KMS PID prefix of an application group, if known.
    pub fn pid_prefix(&self, id: &Uuid) -> Option<&str> {
        self.groups.get(id).map(|group| group.pid_prefix.as_str())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn sku_count(&self) -> usize {
        self.skus.len()
    }
}
