use super::{Snapshot, StoreSnapshot};
use crate::schema::SchemaCatalog;
use crate::storage::{DatabaseSchema, LocalDatabase, StorageBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseExportInfo {
    pub name: String,
    pub version: u32,
    pub stores: Vec<String>,
    pub record_counts: BTreeMap<String, u64>,
}

impl DatabaseExportInfo {
    pub fn total_records(&self) -> u64 {
        self.record_counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportInfo {
    pub databases: Vec<DatabaseExportInfo>,
    pub total_records: u64,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportError {
    pub database: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub databases: Snapshot,
    pub export_info: ExportInfo,
    #[serde(default)]
    pub errors: Vec<ExportError>,
}

impl ExportResult {
    /// Counts keyed `"<database>.<store>"`, the shape backup metadata uses.
    pub fn record_counts(&self) -> BTreeMap<String, u64> {
        self.export_info
            .databases
            .iter()
            .flat_map(|db| {
                db.record_counts
                    .iter()
                    .map(move |(store, count)| (format!("{}.{}", db.name, store), *count))
            })
            .collect()
    }

    /// Names of the databases that made it into the snapshot, in export order.
    pub fn database_names(&self) -> Vec<String> {
        self.export_info
            .databases
            .iter()
            .map(|db| db.name.clone())
            .collect()
    }
}

/// Full-scan exporter over every database of the catalog.
pub struct DatabaseExporter {
    backend: Arc<dyn StorageBackend>,
    catalog: SchemaCatalog,
}

impl DatabaseExporter {
    pub fn new(backend: Arc<dyn StorageBackend>, catalog: SchemaCatalog) -> Self {
        Self { backend, catalog }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Snapshot every catalog database. A database that cannot be opened or
    /// read is left out and reported in `errors`.
    pub async fn export_all_databases(&self) -> ExportResult {
        info!(
            "Starting export of {} databases",
            self.catalog.databases().len()
        );

        let mut databases = Snapshot::new();
        let mut infos = Vec::new();
        let mut errors = Vec::new();

        for schema in self.catalog.databases() {
            match self.export_database(schema).await {
                Ok((stores, info)) => {
                    debug!(
                        "Exported {}: {} stores, {} records",
                        info.name,
                        info.stores.len(),
                        info.total_records()
                    );
                    databases.insert(schema.name.clone(), stores);
                    infos.push(info);
                }
                Err(e) => {
                    warn!("Failed to export database {}: {}", schema.name, e);
                    errors.push(ExportError {
                        database: schema.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let total_records = infos.iter().map(DatabaseExportInfo::total_records).sum();
        info!(
            "Export finished: {} databases, {} records, {} errors",
            infos.len(),
            total_records,
            errors.len()
        );

        ExportResult {
            databases,
            export_info: ExportInfo {
                databases: infos,
                total_records,
                exported_at: Utc::now(),
            },
            errors,
        }
    }

    /// Open `schema` at its catalog version and dump every store.
    pub async fn export_database(
        &self,
        schema: &DatabaseSchema,
    ) -> crate::storage::Result<(StoreSnapshot, DatabaseExportInfo)> {
        let db = self.backend.open(schema).await?;
        let store_names = db.store_names();

        let mut stores = StoreSnapshot::new();
        let mut record_counts = BTreeMap::new();
        for store in &store_names {
            let records = db.get_all(store).await?;
            record_counts.insert(store.clone(), records.len() as u64);
            stores.insert(
                store.clone(),
                records.iter().map(|record| record.to_json()).collect(),
            );
        }

        let info = DatabaseExportInfo {
            name: db.name().to_string(),
            version: db.version(),
            stores: store_names,
            record_counts,
        };
        Ok((stores, info))
    }

    /// Per-store record counts without reading the records.
    pub async fn database_stats(&self) -> (Vec<DatabaseExportInfo>, Vec<ExportError>) {
        let mut stats = Vec::new();
        let mut errors = Vec::new();

        for schema in self.catalog.databases() {
            match self.count_database(schema).await {
                Ok(info) => stats.push(info),
                Err(e) => {
                    warn!("Failed to read statistics for {}: {}", schema.name, e);
                    errors.push(ExportError {
                        database: schema.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        (stats, errors)
    }

    async fn count_database(&self, schema: &DatabaseSchema) -> crate::storage::Result<DatabaseExportInfo> {
        let db: Box<dyn LocalDatabase> = self.backend.open(schema).await?;
        let stores = db.store_names();

        let mut record_counts = BTreeMap::new();
        for store in &stores {
            record_counts.insert(store.clone(), db.count(store).await? as u64);
        }

        Ok(DatabaseExportInfo {
            name: db.name().to_string(),
            version: db.version(),
            stores,
            record_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CREDIT_DB, POS_DB, SALES_DB};
    use crate::storage::{MemoryBackend, StoreSchema};
    use crate::value::Value;
    use chrono::TimeZone;
    use serde_json::json;

    async fn seed(backend: &MemoryBackend, catalog: &SchemaCatalog) {
        let schema = catalog.database(POS_DB).unwrap();
        let db = backend.open(schema).await.unwrap();
        let mut tx = db.begin_write("products").await.unwrap();
        let mut record = Value::from_json(json!({"id": 1, "name": "Çay"}));
        record.set_path(
            "createdAt",
            Value::Date(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        );
        tx.put(record).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_export_all_databases() {
        let backend = MemoryBackend::new();
        let catalog = SchemaCatalog::default();
        seed(&backend, &catalog).await;

        let exporter = DatabaseExporter::new(Arc::new(backend), catalog);
        let result = exporter.export_all_databases().await;

        assert!(result.errors.is_empty());
        assert_eq!(result.database_names(), vec![POS_DB, SALES_DB, CREDIT_DB]);
        assert_eq!(result.export_info.total_records, 1);

        let products = &result.databases[POS_DB]["products"];
        assert_eq!(
            products[0]["createdAt"],
            json!({"__type": "Date", "value": "2024-01-01T00:00:00.000Z"})
        );

        // empty stores still export
        assert_eq!(result.databases[SALES_DB]["sales"], Vec::<serde_json::Value>::new());
        let counts = result.record_counts();
        assert_eq!(counts["posDB.products"], 1);
        assert_eq!(counts["salesDB.sales"], 0);
    }

    #[tokio::test]
    async fn test_failed_database_is_skipped() {
        let backend = MemoryBackend::new();
        let newer = DatabaseSchema {
            name: SALES_DB.to_string(),
            version: 9,
            stores: vec![StoreSchema::keyed("sales", "id")],
        };
        backend.open(&newer).await.unwrap();

        let exporter = DatabaseExporter::new(Arc::new(backend), SchemaCatalog::default());
        let result = exporter.export_all_databases().await;

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].database, SALES_DB);
        assert!(!result.databases.contains_key(SALES_DB));
        assert!(result.databases.contains_key(POS_DB));
        assert!(result.databases.contains_key(CREDIT_DB));
    }

    #[tokio::test]
    async fn test_database_stats() {
        let backend = MemoryBackend::new();
        let catalog = SchemaCatalog::default();
        seed(&backend, &catalog).await;

        let exporter = DatabaseExporter::new(Arc::new(backend), catalog);
        let (stats, errors) = exporter.database_stats().await;

        assert!(errors.is_empty());
        let pos = stats.iter().find(|db| db.name == POS_DB).unwrap();
        assert_eq!(pos.record_counts["products"], 1);
        assert_eq!(pos.total_records(), 1);
    }
}
