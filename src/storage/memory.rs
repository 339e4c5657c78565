use super::{
    resolve_key, DatabaseSchema, Key, LocalDatabase, Result, StorageBackend, StorageError,
    StoreSchema, StoreTransaction,
};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct StoreData {
    records: BTreeMap<Key, Value>,
    key_generator: f64,
    read_only: bool,
}

#[derive(Debug, Clone)]
struct StoreHandle {
    schema: StoreSchema,
    data: Arc<RwLock<StoreData>>,
}

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    version: u32,
    stores: BTreeMap<String, StoreHandle>,
}

/// Process-local storage with the same semantics as the SQLite backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    databases: Arc<RwLock<HashMap<String, DatabaseState>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commits on `store` fail, as a locked or quota-exceeded store would.
    pub async fn set_read_only(&self, database: &str, store: &str, read_only: bool) -> Result<()> {
        let handle = self.handle(database, store).await?;
        handle.data.write().await.read_only = read_only;
        Ok(())
    }

    async fn handle(&self, database: &str, store: &str) -> Result<StoreHandle> {
        let databases = self.databases.read().await;
        databases
            .get(database)
            .and_then(|db| db.stores.get(store))
            .cloned()
            .ok_or_else(|| StorageError::StoreNotFound {
                store: format!("{database}.{store}"),
            })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(&self, schema: &DatabaseSchema) -> Result<Box<dyn LocalDatabase>> {
        let mut databases = self.databases.write().await;
        let state = databases.entry(schema.name.clone()).or_default();

        if state.version > schema.version {
            return Err(StorageError::VersionError {
                name: schema.name.clone(),
                requested: schema.version,
                current: state.version,
            });
        }

        if state.version < schema.version {
            debug!(
                "Upgrading in-memory database {} from version {} to {}",
                schema.name, state.version, schema.version
            );
            for store in &schema.stores {
                state
                    .stores
                    .entry(store.name.clone())
                    .or_insert_with(|| StoreHandle {
                        schema: store.clone(),
                        data: Arc::new(RwLock::new(StoreData::default())),
                    });
            }
            state.version = schema.version;
        }

        Ok(Box::new(MemoryDatabase {
            name: schema.name.clone(),
            version: state.version,
            stores: state.stores.clone(),
        }))
    }
}

struct MemoryDatabase {
    name: String,
    version: u32,
    stores: BTreeMap<String, StoreHandle>,
}

impl MemoryDatabase {
    fn handle(&self, store: &str) -> Result<&StoreHandle> {
        self.stores
            .get(store)
            .ok_or_else(|| StorageError::StoreNotFound {
                store: store.to_string(),
            })
    }
}

#[async_trait]
impl LocalDatabase for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.get(name).map(|h| &h.schema)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        let data = self.handle(store)?.data.read().await;
        Ok(data.records.values().cloned().collect())
    }

    async fn count(&self, store: &str) -> Result<usize> {
        Ok(self.handle(store)?.data.read().await.records.len())
    }

    async fn begin_write(&self, store: &str) -> Result<Box<dyn StoreTransaction>> {
        let handle = self.handle(store)?;
        let guard = handle.data.clone().write_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(MemoryTransaction {
            schema: handle.schema.clone(),
            guard: Some(guard),
            staged,
        }))
    }
}

/// Writes go to a staged copy; the store stays locked until commit or drop.
struct MemoryTransaction {
    schema: StoreSchema,
    guard: Option<OwnedRwLockWriteGuard<StoreData>>,
    staged: StoreData,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<()> {
        if self.guard.is_none() {
            return Err(StorageError::TransactionInactive {
                store: self.schema.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Value>> {
        self.ensure_active()?;
        Ok(self.staged.records.get(key).cloned())
    }

    async fn put(&mut self, mut record: Value) -> Result<Key> {
        self.ensure_active()?;
        let key = resolve_key(&self.schema, &mut record, &mut self.staged.key_generator)?;
        self.staged.records.insert(key.clone(), record);
        Ok(key)
    }

    async fn add(&mut self, mut record: Value) -> Result<Key> {
        self.ensure_active()?;
        let key = resolve_key(&self.schema, &mut record, &mut self.staged.key_generator)?;
        if self.staged.records.contains_key(&key) {
            return Err(StorageError::Constraint {
                store: self.schema.name.clone(),
                key: key.to_string(),
            });
        }
        self.staged.records.insert(key.clone(), record);
        Ok(key)
    }

    async fn clear(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.staged.records.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| StorageError::TransactionInactive {
                store: self.schema.name.clone(),
            })?;

        if guard.read_only {
            return Err(StorageError::ReadOnly {
                store: self.schema.name.clone(),
            });
        }

        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
