use super::{
    resolve_key, DatabaseSchema, Key, LocalDatabase, Result, StorageBackend, StorageError,
    StoreSchema, StoreTransaction,
};
use crate::value::Value;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One SQLite file per logical database under `data_directory`.
///
/// Store layouts live in `__object_stores`; every record of every store lives
/// in `__records`, keyed by `(store, key)` where `key` is [`Key::encode`].
/// `PRAGMA user_version` holds the schema version.
#[derive(Debug)]
pub struct SqliteBackend {
    data_directory: PathBuf,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteBackend {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn database_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.data_directory.join(format!("{name}.sqlite")))
    }

    async fn pool(&self, name: &str) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }

        let path = self.database_path(name)?;
        tokio::fs::create_dir_all(&self.data_directory).await?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        debug!("Opened SQLite database {} at {}", name, path.display());
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn open(&self, schema: &DatabaseSchema) -> Result<Box<dyn LocalDatabase>> {
        let pool = self.pool(&schema.name).await?;
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS __object_stores (
                name TEXT PRIMARY KEY,
                key_path TEXT,
                auto_increment INTEGER NOT NULL DEFAULT 0,
                key_generator REAL NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS __records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (store, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;
        let current = current.max(0) as u32;

        if current > schema.version {
            return Err(StorageError::VersionError {
                name: schema.name.clone(),
                requested: schema.version,
                current,
            });
        }

        if current < schema.version {
            info!(
                "Upgrading database {} from version {} to {}",
                schema.name, current, schema.version
            );
            for store in &schema.stores {
                sqlx::query(
                    "INSERT OR IGNORE INTO __object_stores (name, key_path, auto_increment) VALUES (?1, ?2, ?3)",
                )
                .bind(&store.name)
                .bind(store.key_path.as_deref())
                .bind(store.auto_increment)
                .execute(&mut *tx)
                .await?;
            }
            // PRAGMA does not take bound parameters; the version is numeric
            sqlx::query(&format!("PRAGMA user_version = {}", schema.version))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let rows = sqlx::query(
            "SELECT name, key_path, auto_increment FROM __object_stores ORDER BY name",
        )
        .fetch_all(&pool)
        .await?;

        let mut stores = Vec::with_capacity(rows.len());
        for row in rows {
            let auto_increment: i64 = row.try_get("auto_increment")?;
            stores.push(StoreSchema {
                name: row.try_get("name")?,
                key_path: row.try_get("key_path")?,
                auto_increment: auto_increment != 0,
            });
        }

        Ok(Box::new(SqliteDatabase {
            name: schema.name.clone(),
            version: current.max(schema.version),
            pool,
            stores,
        }))
    }
}

struct SqliteDatabase {
    name: String,
    version: u32,
    pool: SqlitePool,
    stores: Vec<StoreSchema>,
}

impl SqliteDatabase {
    fn require_store(&self, store: &str) -> Result<&StoreSchema> {
        self.store(store).ok_or_else(|| StorageError::StoreNotFound {
            store: store.to_string(),
        })
    }
}

#[async_trait]
impl LocalDatabase for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name.clone()).collect()
    }

    fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        self.require_store(store)?;
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT value FROM __records WHERE store = ?1 ORDER BY seq")
                .bind(store)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|text| Ok(Value::from_stored_json(serde_json::from_str(text)?)))
            .collect()
    }

    async fn count(&self, store: &str) -> Result<usize> {
        self.require_store(store)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM __records WHERE store = ?1")
            .bind(store)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn begin_write(&self, store: &str) -> Result<Box<dyn StoreTransaction>> {
        let schema = self.require_store(store)?.clone();
        let mut tx = self.pool.begin().await?;

        let key_generator: f64 =
            sqlx::query_scalar("SELECT key_generator FROM __object_stores WHERE name = ?1")
                .bind(store)
                .fetch_one(&mut *tx)
                .await?;

        Ok(Box::new(SqliteTransaction {
            schema,
            tx: Some(tx),
            key_generator,
            initial_generator: key_generator,
        }))
    }
}

struct SqliteTransaction {
    schema: StoreSchema,
    tx: Option<Transaction<'static, Sqlite>>,
    key_generator: f64,
    initial_generator: f64,
}

impl SqliteTransaction {
    fn active(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx
            .as_mut()
            .ok_or_else(|| StorageError::TransactionInactive {
                store: self.schema.name.clone(),
            })
    }

    fn prepare(&mut self, mut record: Value) -> Result<(Key, String)> {
        if self.tx.is_none() {
            return Err(StorageError::TransactionInactive {
                store: self.schema.name.clone(),
            });
        }
        let key = resolve_key(&self.schema, &mut record, &mut self.key_generator)?;
        let text = serde_json::to_string(&record.to_json())?;
        Ok((key, text))
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Value>> {
        let store = self.schema.name.clone();
        let tx = self.active()?;
        let text: Option<String> =
            sqlx::query_scalar("SELECT value FROM __records WHERE store = ?1 AND key = ?2")
                .bind(&store)
                .bind(key.encode())
                .fetch_optional(&mut **tx)
                .await?;

        match text {
            Some(text) => Ok(Some(Value::from_stored_json(serde_json::from_str(&text)?))),
            None => Ok(None),
        }
    }

    async fn put(&mut self, record: Value) -> Result<Key> {
        let (key, text) = self.prepare(record)?;
        let store = self.schema.name.clone();
        let tx = self.active()?;
        sqlx::query(
            r#"
            INSERT INTO __records (store, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (store, key) DO UPDATE SET value = excluded.value
        "#,
        )
        .bind(&store)
        .bind(key.encode())
        .bind(text)
        .execute(&mut **tx)
        .await?;
        Ok(key)
    }

    async fn add(&mut self, record: Value) -> Result<Key> {
        let (key, text) = self.prepare(record)?;
        let store = self.schema.name.clone();
        let tx = self.active()?;
        let inserted = sqlx::query("INSERT INTO __records (store, key, value) VALUES (?1, ?2, ?3)")
            .bind(&store)
            .bind(key.encode())
            .bind(text)
            .execute(&mut **tx)
            .await;

        match inserted {
            Ok(_) => Ok(key),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::Constraint {
                    store,
                    key: key.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&mut self) -> Result<()> {
        let store = self.schema.name.clone();
        let tx = self.active()?;
        sqlx::query("DELETE FROM __records WHERE store = ?1")
            .bind(&store)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| StorageError::TransactionInactive {
                store: self.schema.name.clone(),
            })?;

        if self.key_generator != self.initial_generator {
            sqlx::query("UPDATE __object_stores SET key_generator = ?1 WHERE name = ?2")
                .bind(self.key_generator)
                .bind(&self.schema.name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
