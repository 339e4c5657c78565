//! Reconciliation of restored snapshots into the live databases.
//!
//! Every database and store is imported independently: a failure is
//! recorded and the import moves on. Within a store all records share one
//! write transaction, so a store is either committed as a whole or left
//! untouched.

use super::{Snapshot, StoreSnapshot};
use crate::schema::SchemaCatalog;
use crate::storage::{Key, LocalDatabase, StorageBackend, StorageError, StoreTransaction};
use crate::value::{normalize_dates, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records between two progress notifications.
pub const PROGRESS_INTERVAL: usize = 10;
/// Per-record failures logged at `warn` for each store; the rest go to `debug`.
pub const MAX_LOGGED_RECORD_ERRORS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub database: String,
    pub store: String,
    /// Records imported so far in this store.
    pub processed: usize,
    /// Records offered for this store.
    pub total: usize,
    /// Records imported so far in this database.
    pub database_imported: usize,
}

pub type ProgressCallback = Arc<dyn Fn(ImportProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ImportOptions {
    /// Empty each store before writing the restored records.
    pub clear_existing: bool,
    pub on_progress: Option<ProgressCallback>,
}

impl ImportOptions {
    pub fn clear_existing(mut self, clear_existing: bool) -> Self {
        self.clear_existing = clear_existing;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(ImportProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ImportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportOptions")
            .field("clear_existing", &self.clear_existing)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportErrorKind {
    /// The snapshot names a database outside the catalog.
    UnknownDatabase,
    DatabaseOpenFailure,
    /// The snapshot names a store the live database does not have.
    SchemaDrift,
    NoValidRecords,
    TransactionFailure,
}

impl ImportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportErrorKind::UnknownDatabase => "unknown database",
            ImportErrorKind::DatabaseOpenFailure => "database open failure",
            ImportErrorKind::SchemaDrift => "schema drift",
            ImportErrorKind::NoValidRecords => "no valid records",
            ImportErrorKind::TransactionFailure => "transaction failure",
        }
    }
}

impl fmt::Display for ImportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    pub database: String,
    pub store: Option<String>,
    pub kind: ImportErrorKind,
    pub message: String,
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.store {
            Some(store) => write!(f, "{}.{}: {}: {}", self.database, store, self.kind, self.message),
            None => write!(f, "{}: {}: {}", self.database, self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub kind: ImportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImportResult {
    pub success: bool,
    pub imported_count: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Records rejected by the store; these do not fail the table.
    pub failed: usize,
    pub error: Option<TableFailure>,
}

impl TableImportResult {
    fn failure(kind: ImportErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(TableFailure {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseImportResult {
    pub database: String,
    pub success: bool,
    pub imported_count: usize,
    pub tables: BTreeMap<String, TableImportResult>,
    pub errors: Vec<ImportError>,
}

impl DatabaseImportResult {
    /// At least one store made it in.
    pub fn any_imported(&self) -> bool {
        self.tables.values().any(|table| table.success)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: bool,
    pub imported_databases: Vec<String>,
    pub total_imported: usize,
    pub errors: Vec<ImportError>,
}

enum RecordOutcome {
    Inserted,
    Updated,
}

struct ProgressReporter<'a> {
    callback: Option<&'a ProgressCallback>,
    database: &'a str,
    store: &'a str,
    total: usize,
    imported_before: usize,
}

impl ProgressReporter<'_> {
    fn report(&self, processed: usize) {
        if let Some(callback) = self.callback {
            callback(ImportProgress {
                database: self.database.to_string(),
                store: self.store.to_string(),
                processed,
                total: self.total,
                database_imported: self.imported_before + processed,
            });
        }
    }
}

pub struct DatabaseImporter {
    backend: Arc<dyn StorageBackend>,
    catalog: SchemaCatalog,
}

impl DatabaseImporter {
    pub fn new(backend: Arc<dyn StorageBackend>, catalog: SchemaCatalog) -> Self {
        Self { backend, catalog }
    }

    /// Import every database of `snapshot`, one after another.
    pub async fn import_all_databases(
        &self,
        snapshot: &Snapshot,
        options: &ImportOptions,
    ) -> ImportResult {
        info!(
            "Starting import of {} databases (clear_existing={})",
            snapshot.len(),
            options.clear_existing
        );

        let mut result = ImportResult {
            success: true,
            ..Default::default()
        };

        for (database, stores) in snapshot {
            let db_result = self.import_database(database, stores, options).await;

            if db_result.any_imported() {
                result.imported_databases.push(database.clone());
            }
            result.total_imported += db_result.imported_count;
            result.success &= db_result.success;
            result.errors.extend(db_result.errors);
        }

        info!(
            "Import finished: {} records into {} databases, {} errors",
            result.total_imported,
            result.imported_databases.len(),
            result.errors.len()
        );
        result
    }

    pub async fn import_database(
        &self,
        database: &str,
        stores: &StoreSnapshot,
        options: &ImportOptions,
    ) -> DatabaseImportResult {
        let mut result = DatabaseImportResult {
            database: database.to_string(),
            success: true,
            ..Default::default()
        };

        let Some(schema) = self.catalog.database(database) else {
            warn!("Skipping unknown database {}", database);
            result.success = false;
            result.errors.push(ImportError {
                database: database.to_string(),
                store: None,
                kind: ImportErrorKind::UnknownDatabase,
                message: format!("{database} is not a known database"),
            });
            return result;
        };

        let db = match self.backend.open(schema).await {
            Ok(db) => db,
            Err(e) => {
                warn!("Failed to open database {}: {}", database, e);
                result.success = false;
                result.errors.push(ImportError {
                    database: database.to_string(),
                    store: None,
                    kind: ImportErrorKind::DatabaseOpenFailure,
                    message: e.to_string(),
                });
                return result;
            }
        };

        for (store, records) in stores {
            if !db.has_store(store) {
                warn!(
                    "Store {} is missing from {} (version {}); skipping",
                    store,
                    database,
                    db.version()
                );
                result.success = false;
                result.errors.push(ImportError {
                    database: database.to_string(),
                    store: Some(store.clone()),
                    kind: ImportErrorKind::SchemaDrift,
                    message: format!("store {store} does not exist in {database}"),
                });
                continue;
            }

            let reporter = ProgressReporter {
                callback: options.on_progress.as_ref(),
                database,
                store,
                total: records.len(),
                imported_before: result.imported_count,
            };
            let table = self
                .import_records(db.as_ref(), store, records, options.clear_existing, &reporter)
                .await;
            reporter.report(table.imported_count);

            match &table.error {
                None => result.imported_count += table.imported_count,
                // A store that was empty when backed up has nothing to restore.
                Some(failure)
                    if failure.kind == ImportErrorKind::NoValidRecords && records.is_empty() =>
                {
                    debug!("Store {}.{} is empty in the backup", database, store);
                }
                Some(failure) => {
                    result.success = false;
                    result.errors.push(ImportError {
                        database: database.to_string(),
                        store: Some(store.clone()),
                        kind: failure.kind,
                        message: failure.message.clone(),
                    });
                }
            }
            result.tables.insert(store.clone(), table);
        }

        debug!(
            "Imported {} records into {} ({} store errors)",
            result.imported_count,
            database,
            result.errors.len()
        );
        result
    }

    /// Upsert `records` into one store inside a single transaction.
    pub async fn import_table(
        &self,
        db: &dyn LocalDatabase,
        store: &str,
        records: &[serde_json::Value],
        clear_existing: bool,
    ) -> TableImportResult {
        let reporter = ProgressReporter {
            callback: None,
            database: db.name(),
            store,
            total: records.len(),
            imported_before: 0,
        };
        self.import_records(db, store, records, clear_existing, &reporter)
            .await
    }

    async fn import_records(
        &self,
        db: &dyn LocalDatabase,
        store: &str,
        records: &[serde_json::Value],
        clear_existing: bool,
        reporter: &ProgressReporter<'_>,
    ) -> TableImportResult {
        let records: Vec<Value> = records
            .iter()
            .filter(|record| !record.is_null())
            .cloned()
            .map(normalize_dates)
            .collect();

        if records.is_empty() {
            debug!("No valid records for {}.{}", db.name(), store);
            return TableImportResult::failure(
                ImportErrorKind::NoValidRecords,
                "no valid records to import",
            );
        }

        let mut tx = match db.begin_write(store).await {
            Ok(tx) => tx,
            Err(e) => return transaction_failure(db.name(), store, "begin", e),
        };

        if clear_existing {
            if let Err(e) = tx.clear().await {
                return transaction_failure(db.name(), store, "clear", e);
            }
        }

        let key_path = tx.key_path().map(str::to_string);
        let mut result = TableImportResult::default();

        for record in records {
            let key_value = key_path
                .as_deref()
                .and_then(|path| record.lookup_path(path))
                .cloned();

            let outcome = match key_value {
                Some(key_value) if !clear_existing => upsert(&mut tx, &key_value, record).await,
                _ if clear_existing => tx.add(record).await.map(|_| RecordOutcome::Inserted),
                _ => tx.put(record).await.map(|_| RecordOutcome::Inserted),
            };

            match outcome {
                Ok(outcome) => {
                    match outcome {
                        RecordOutcome::Inserted => result.inserted += 1,
                        RecordOutcome::Updated => result.updated += 1,
                    }
                    result.imported_count += 1;
                    if result.imported_count % PROGRESS_INTERVAL == 0 {
                        reporter.report(result.imported_count);
                    }
                }
                Err(e) => {
                    result.failed += 1;
                    if result.failed <= MAX_LOGGED_RECORD_ERRORS {
                        warn!("Failed to import record into {}.{}: {}", db.name(), store, e);
                    } else {
                        debug!("Failed to import record into {}.{}: {}", db.name(), store, e);
                    }
                }
            }
        }

        if let Err(e) = tx.commit().await {
            return transaction_failure(db.name(), store, "commit", e);
        }

        if result.failed > MAX_LOGGED_RECORD_ERRORS {
            warn!(
                "{} records could not be imported into {}.{}",
                result.failed,
                db.name(),
                store
            );
        }
        debug!(
            "Imported {}.{}: {} inserted, {} updated, {} failed",
            db.name(),
            store,
            result.inserted,
            result.updated,
            result.failed
        );

        result.success = true;
        result
    }

    /// Empty every store of `database`, one transaction per store.
    pub async fn clear_database(&self, database: &str) -> crate::storage::Result<()> {
        let schema =
            self.catalog
                .database(database)
                .ok_or_else(|| StorageError::UnknownDatabase {
                    name: database.to_string(),
                })?;

        let db = self.backend.open(schema).await?;
        for store in db.store_names() {
            let mut tx = db.begin_write(&store).await?;
            tx.clear().await?;
            tx.commit().await?;
            debug!("Cleared {}.{}", database, store);
        }

        info!("Cleared database {}", database);
        Ok(())
    }
}

/// Update when the key already exists, insert otherwise. A failed lookup
/// falls back to an overwrite.
async fn upsert(
    tx: &mut Box<dyn StoreTransaction>,
    key_value: &Value,
    record: Value,
) -> crate::storage::Result<RecordOutcome> {
    let existing = match Key::from_value(key_value) {
        Ok(key) => tx.get(&key).await,
        Err(e) => Err(e),
    };

    match existing {
        Ok(Some(_)) => tx.put(record).await.map(|_| RecordOutcome::Updated),
        Ok(None) => tx.add(record).await.map(|_| RecordOutcome::Inserted),
        Err(e) => {
            debug!("Key lookup failed ({}); overwriting", e);
            tx.put(record).await.map(|_| RecordOutcome::Updated)
        }
    }
}

fn transaction_failure(
    database: &str,
    store: &str,
    stage: &str,
    error: StorageError,
) -> TableImportResult {
    warn!(
        "Transaction {} failed for {}.{}: {}",
        stage, database, store, error
    );
    TableImportResult::failure(
        ImportErrorKind::TransactionFailure,
        format!("{stage} failed: {error}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MIN_POS_SCHEMA_VERSION, POS_DB, SALES_DB};
    use crate::storage::MemoryBackend;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    fn importer(backend: &MemoryBackend) -> DatabaseImporter {
        DatabaseImporter::new(Arc::new(backend.clone()), SchemaCatalog::default())
    }

    fn stores(value: serde_json::Value) -> StoreSnapshot {
        serde_json::from_value(value).unwrap()
    }

    async fn records_of(backend: &MemoryBackend, database: &str, store: &str) -> Vec<Value> {
        let catalog = SchemaCatalog::default();
        let db = backend.open(catalog.database(database).unwrap()).await.unwrap();
        db.get_all(store).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_counts_inserts_and_updates() {
        let backend = MemoryBackend::new();
        let importer = importer(&backend);
        let sales = stores(json!({"sales": [{"id": "s-1", "total": 10}]}));

        let first = importer
            .import_database(SALES_DB, &sales, &ImportOptions::default())
            .await;
        assert_eq!(first.tables["sales"].inserted, 1);

        let second = importer
            .import_database(SALES_DB, &sales, &ImportOptions::default())
            .await;
        assert!(second.success);
        assert_eq!(second.tables["sales"].updated, 1);
        assert_eq!(records_of(&backend, SALES_DB, "sales").await.len(), 1);
    }

    #[tokio::test]
    async fn test_null_records_are_dropped() {
        let backend = MemoryBackend::new();
        let importer = importer(&backend);
        let result = importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [null, {"id": "a"}, null]})),
                &ImportOptions::default(),
            )
            .await;
        assert_eq!(result.imported_count, 1);

        let all_null = importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [null]})),
                &ImportOptions::default(),
            )
            .await;
        assert!(!all_null.success);
        assert_eq!(all_null.errors[0].kind, ImportErrorKind::NoValidRecords);
    }

    #[tokio::test]
    async fn test_empty_store_is_not_an_error() {
        let backend = MemoryBackend::new();
        let result = importer(&backend)
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{"id": "a"}], "suspendedSales": []})),
                &ImportOptions::default(),
            )
            .await;

        assert!(result.success);
        assert!(result.errors.is_empty());
        assert_eq!(result.imported_count, 1);

        let empty = &result.tables["suspendedSales"];
        assert!(!empty.success);
        assert_eq!(empty.imported_count, 0);
        assert_eq!(
            empty.error.as_ref().map(|failure| failure.kind),
            Some(ImportErrorKind::NoValidRecords)
        );
    }

    #[tokio::test]
    async fn test_dates_are_rehydrated() {
        let backend = MemoryBackend::new();
        let importer = importer(&backend);
        importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{
                    "id": "s-1",
                    "date": {"__type": "Date", "value": "2024-01-01T00:00:00.000Z"},
                    "refundedAt": {"__type": "Date", "value": "not a date"},
                    "items": [{"addedAt": "2024-02-03T04:05:06Z"}]
                }]})),
                &ImportOptions::default(),
            )
            .await;

        let records = records_of(&backend, SALES_DB, "sales").await;
        let sale = &records[0];
        assert_eq!(
            sale.get("date"),
            Some(&Value::Date(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
        );
        assert_eq!(sale.get("refundedAt"), Some(&Value::Null));
        assert_eq!(
            sale.lookup_path("items").and_then(|items| match items {
                Value::Array(items) => items[0].get("addedAt").cloned(),
                _ => None,
            }),
            Some(Value::Date(Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap()))
        );
    }

    #[tokio::test]
    async fn test_schema_drift_skips_only_the_missing_store() {
        let backend = MemoryBackend::new();
        let importer = DatabaseImporter::new(
            Arc::new(backend.clone()),
            SchemaCatalog::point_of_sale(MIN_POS_SCHEMA_VERSION),
        );
        let result = importer
            .import_database(
                POS_DB,
                &stores(json!({
                    "products": [{"id": 1, "name": "Poğaça"}],
                    "productGroups": [{"id": 1, "name": "Unlu mamul"}]
                })),
                &ImportOptions::default(),
            )
            .await;

        assert!(!result.success);
        assert!(result.any_imported());
        assert_eq!(result.imported_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ImportErrorKind::SchemaDrift);
        assert_eq!(result.errors[0].store.as_deref(), Some("productGroups"));
    }

    #[tokio::test]
    async fn test_unknown_database() {
        let backend = MemoryBackend::new();
        let mut snapshot = Snapshot::new();
        snapshot.insert("legacyDB".to_string(), stores(json!({"x": [{"id": 1}]})));

        let result = importer(&backend)
            .import_all_databases(&snapshot, &ImportOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.imported_databases.is_empty());
        assert_eq!(result.errors[0].kind, ImportErrorKind::UnknownDatabase);
        assert_eq!(result.errors[0].store, None);
    }

    #[tokio::test]
    async fn test_progress_fires_every_interval_and_at_store_end() {
        let backend = MemoryBackend::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let options = ImportOptions::default().on_progress(move |progress| {
            sink.lock().unwrap().push(progress.processed);
        });

        let sales: Vec<_> = (0..25).map(|i| json!({"id": format!("s-{i}")})).collect();
        importer(&backend)
            .import_database(SALES_DB, &stores(json!({"sales": sales})), &options)
            .await;

        assert_eq!(*events.lock().unwrap(), vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn test_commit_failure_reports_transaction_failure() {
        let backend = MemoryBackend::new();
        let importer = importer(&backend);
        importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{"id": "seed"}]})),
                &ImportOptions::default(),
            )
            .await;
        backend.set_read_only(SALES_DB, "sales", true).await.unwrap();

        let result = importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{"id": "new"}]})),
                &ImportOptions::default().clear_existing(true),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.imported_count, 0);
        assert_eq!(result.errors[0].kind, ImportErrorKind::TransactionFailure);
        let remaining = records_of(&backend, SALES_DB, "sales").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("id"), Some(&Value::from("seed")));
    }

    #[tokio::test]
    async fn test_record_errors_do_not_fail_the_store() {
        let backend = MemoryBackend::new();
        let result = importer(&backend)
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{"id": "ok"}, {"id": null}, {"total": 3}]})),
                &ImportOptions::default(),
            )
            .await;

        assert!(result.success);
        let table = &result.tables["sales"];
        assert_eq!(table.imported_count, 1);
        assert_eq!(table.failed, 2);
    }

    #[tokio::test]
    async fn test_clear_database() {
        let backend = MemoryBackend::new();
        let importer = importer(&backend);
        importer
            .import_database(
                SALES_DB,
                &stores(json!({"sales": [{"id": "a"}], "suspendedSales": [{"id": "b"}]})),
                &ImportOptions::default(),
            )
            .await;

        importer.clear_database(SALES_DB).await.unwrap();
        assert!(records_of(&backend, SALES_DB, "sales").await.is_empty());
        assert!(records_of(&backend, SALES_DB, "suspendedSales").await.is_empty());
        assert!(importer.clear_database("nope").await.is_err());
    }
}
