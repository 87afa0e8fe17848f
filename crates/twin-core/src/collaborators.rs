//! External collaborators consumed by the twin service
//!
//! Ontology and source-storage services live outside this crate. Only the
//! narrow contracts the control loop needs are modeled here, together with
//! static implementations used for seeding and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RecordKind, Result, TwinError};
use crate::models::AttributeMap;

/// Entity type declared by an ontology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeBlueprint {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeBlueprint>,
}

/// Connection settings of a source storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub kind: String,
}

/// Authoritative record as returned by source storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub values: AttributeMap,
}

#[async_trait]
pub trait OntologyService: Send + Sync {
    async fn get_ontology(&self, id: &str) -> Result<Ontology>;
}

#[async_trait]
pub trait StorageService: Send + Sync {
    async fn get_storage_config(&self, id: &str) -> Result<StorageConfig>;
    /// Every authoritative record currently held by the storage
    async fn fetch_records(&self, id: &str) -> Result<Vec<SourceRecord>>;
}

/// Ontology catalog held in memory
#[derive(Default)]
pub struct StaticOntologyService {
    ontologies: DashMap<String, Ontology>,
}

impl StaticOntologyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ontology: Ontology) {
        self.ontologies.insert(ontology.id.clone(), ontology);
    }
}

#[async_trait]
impl OntologyService for StaticOntologyService {
    async fn get_ontology(&self, id: &str) -> Result<Ontology> {
        self.ontologies
            .get(id)
            .map(|o| o.clone())
            .ok_or_else(|| TwinError::not_found(RecordKind::Ontology, id))
    }
}

/// Source storages and their records held in memory
#[derive(Default)]
pub struct StaticStorageService {
    storages: DashMap<String, (StorageConfig, Vec<SourceRecord>)>,
}

impl StaticStorageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: StorageConfig, records: Vec<SourceRecord>) {
        self.storages.insert(config.id.clone(), (config, records));
    }

    /// Replace the records of an existing storage
    pub fn set_records(&self, id: &str, records: Vec<SourceRecord>) -> Result<()> {
        let mut entry = self
            .storages
            .get_mut(id)
            .ok_or_else(|| TwinError::not_found(RecordKind::Storage, id))?;
        entry.1 = records;
        Ok(())
    }
}

#[async_trait]
impl StorageService for StaticStorageService {
    async fn get_storage_config(&self, id: &str) -> Result<StorageConfig> {
        self.storages
            .get(id)
            .map(|s| s.0.clone())
            .ok_or_else(|| TwinError::not_found(RecordKind::Storage, id))
    }

    async fn fetch_records(&self, id: &str) -> Result<Vec<SourceRecord>> {
        self.storages
            .get(id)
            .map(|s| s.1.clone())
            .ok_or_else(|| TwinError::not_found(RecordKind::Storage, id))
    }
}
