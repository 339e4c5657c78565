//! Local databases the point-of-sale app keeps its data in.
//!
//! A database holds named object stores; a store holds schemaless records
//! addressed by a primary key. The key lives inside the record at the store's
//! key path, or is generated out-of-line when the store has none.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database {name} is at version {current}, cannot open at version {requested}")]
    VersionError {
        name: String,
        requested: u32,
        current: u32,
    },

    #[error("Unknown database: {name}")]
    UnknownDatabase { name: String },

    #[error("Object store not found: {store}")]
    StoreNotFound { store: String },

    #[error("Key already exists in store {store}: {key}")]
    Constraint { store: String, key: String },

    #[error("Invalid data: {message}")]
    DataError { message: String },

    #[error("Transaction on store {store} is no longer active")]
    TransactionInactive { store: String },

    #[error("Store {store} is read-only")]
    ReadOnly { store: String },

    #[error("Invalid database name: {name}")]
    InvalidName { name: String },

    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Layout of one object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    /// Record field holding the primary key; `None` means out-of-line keys.
    pub key_path: Option<String>,
    pub auto_increment: bool,
}

impl StoreSchema {
    /// Store whose records carry their own key at `key_path`.
    pub fn keyed(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: Some(key_path.to_string()),
            auto_increment: false,
        }
    }

    /// Keyed store that numbers records lacking a key.
    pub fn auto_increment(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: Some(key_path.to_string()),
            auto_increment: true,
        }
    }

    /// Store with generated out-of-line keys.
    pub fn keyless(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: None,
            auto_increment: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: u32,
    pub stores: Vec<StoreSchema>,
}

impl DatabaseSchema {
    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }
}

/// A primary key. Ordered numbers first, then dates, then strings.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
}

impl Key {
    /// Key held by `value`; only numbers, strings and dates qualify.
    pub fn from_value(value: &Value) -> Result<Key> {
        match value {
            Value::Number(n) => match n.as_f64() {
                // -0 and 0 are the same key
                Some(f) if f.is_finite() => Ok(Key::Number(if f == 0.0 { 0.0 } else { f })),
                _ => Err(StorageError::DataError {
                    message: format!("number {n} is not a valid key"),
                }),
            },
            Value::String(s) => Ok(Key::Text(s.clone())),
            // Keys are persisted at millisecond precision
            Value::Date(dt) => Ok(Key::Date(dt.trunc_subsecs(3))),
            other => Err(StorageError::DataError {
                message: format!("{} is not a valid key", value_kind(other)),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(f) => {
                if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    Value::Number((*f as i64).into())
                } else {
                    serde_json::Number::from_f64(*f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::Date(dt) => Value::Date(*dt),
            Key::Text(s) => Value::String(s.clone()),
        }
    }

    /// Canonical text form used as the persisted key column.
    pub fn encode(&self) -> String {
        match self {
            Key::Number(f) => format!("n:{f}"),
            Key::Date(dt) => format!("d:{}", dt.timestamp_millis()),
            Key::Text(s) => format!("s:{s}"),
        }
    }

    pub fn decode(encoded: &str) -> Option<Key> {
        let (tag, body) = encoded.split_once(':')?;
        match tag {
            "n" => body.parse().ok().map(Key::Number),
            "d" => body
                .parse()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(Key::Date),
            "s" => Some(Key::Text(body.to_string())),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::Text(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Date(a), Key::Date(b)) => a.timestamp_millis().cmp(&b.timestamp_millis()),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::Date(dt) => write!(f, "{}", dt.to_rfc3339()),
            Key::Text(s) => write!(f, "{s:?}"),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Date(_) => "date",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Work out the key `record` is stored under, generating one for
/// auto-increment stores and keeping the generator ahead of explicit keys.
pub(crate) fn resolve_key(
    schema: &StoreSchema,
    record: &mut Value,
    key_generator: &mut f64,
) -> Result<Key> {
    let Some(key_path) = schema.key_path.as_deref() else {
        if schema.auto_increment {
            return Ok(next_generated_key(key_generator));
        }
        return Err(StorageError::DataError {
            message: format!("store {} requires an explicit key", schema.name),
        });
    };

    if record.as_object().is_none() {
        return Err(StorageError::DataError {
            message: format!(
                "{} record cannot carry key path {key_path} in store {}",
                value_kind(record),
                schema.name
            ),
        });
    }

    match record.lookup_path(key_path) {
        Some(value) => {
            let key = Key::from_value(value)?;
            if let (true, Key::Number(n)) = (schema.auto_increment, &key) {
                if n.floor() > *key_generator {
                    *key_generator = n.floor();
                }
            }
            Ok(key)
        }
        None if schema.auto_increment => {
            let key = next_generated_key(key_generator);
            if !record.set_path(key_path, key.to_value()) {
                return Err(StorageError::DataError {
                    message: format!("cannot inject generated key at {key_path}"),
                });
            }
            Ok(key)
        }
        None => Err(StorageError::DataError {
            message: format!(
                "record has no value at key path {key_path} in store {}",
                schema.name
            ),
        }),
    }
}

fn next_generated_key(key_generator: &mut f64) -> Key {
    *key_generator += 1.0;
    Key::Number(*key_generator)
}

/// Opens local databases.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Open the database described by `schema`, creating it and any missing
    /// stores. Fails with [`StorageError::VersionError`] when the live
    /// database is newer than `schema.version`.
    async fn open(&self, schema: &DatabaseSchema) -> Result<Box<dyn LocalDatabase>>;
}

/// An open local database.
#[async_trait]
pub trait LocalDatabase: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn store_names(&self) -> Vec<String>;
    fn store(&self, name: &str) -> Option<&StoreSchema>;

    fn has_store(&self, name: &str) -> bool {
        self.store(name).is_some()
    }

    /// Every record of `store`.
    async fn get_all(&self, store: &str) -> Result<Vec<Value>>;

    async fn count(&self, store: &str) -> Result<usize>;

    /// Begin the single read-write transaction for `store`. Dropping the
    /// handle without [`StoreTransaction::commit`] discards its writes.
    async fn begin_write(&self, store: &str) -> Result<Box<dyn StoreTransaction>>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    fn schema(&self) -> &StoreSchema;

    fn key_path(&self) -> Option<&str> {
        self.schema().key_path.as_deref()
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Value>>;

    /// Insert or overwrite.
    async fn put(&mut self, record: Value) -> Result<Key>;

    /// Insert; fails with [`StorageError::Constraint`] if the key exists.
    async fn add(&mut self, record: Value) -> Result<Key>;

    async fn clear(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;
}
