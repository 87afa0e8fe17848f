//! Seed data for the in-process ontology and storage services

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use twin_core::collaborators::{
    Ontology, SourceRecord, StaticOntologyService, StaticStorageService, StorageConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedStorage {
    #[serde(flatten)]
    pub config: StorageConfig,
    #[serde(default)]
    pub records: Vec<SourceRecord>,
}

/// Contents of the `seed_file`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub ontologies: Vec<Ontology>,
    #[serde(default)]
    pub storages: Vec<SeedStorage>,
}

impl SeedData {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    pub fn install(self, ontology: &StaticOntologyService, storage: &StaticStorageService) {
        let ontologies = self.ontologies.len();
        let storages = self.storages.len();

        for o in self.ontologies {
            ontology.insert(o);
        }
        for s in self.storages {
            storage.insert(s.config, s.records);
        }

        info!(ontologies, storages, "Seed data installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use twin_core::collaborators::{OntologyService, StorageService};

    #[tokio::test]
    async fn test_load_and_install_seed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "ontologies": [
                    {{"id": "onto-1", "project_id": "p1", "entity_types": [{{"name": "pump"}}]}}
                ],
                "storages": [
                    {{"id": "s1", "project_id": "p1", "kind": "csv",
                      "records": [{{"id": "r1", "entity_type": "pump", "values": {{"rpm": 900}}}}]}}
                ]
            }}"#
        )
        .unwrap();

        let seed = SeedData::load(file.path()).await.unwrap();
        let ontology = StaticOntologyService::new();
        let storage = StaticStorageService::new();
        seed.install(&ontology, &storage);

        let o = ontology.get_ontology("onto-1").await.unwrap();
        assert_eq!(o.entity_types[0].name, "pump");
        let s = storage.get_storage_config("s1").await.unwrap();
        assert_eq!(s.kind, "csv");
        let records = storage.fetch_records("s1").await.unwrap();
        assert_eq!(records[0].values["rpm"], serde_json::json!(900));
    }

    #[tokio::test]
    async fn test_missing_seed_file_is_an_error() {
        let err = SeedData::load(Path::new("/nonexistent/seed.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read seed file"));
    }
}
