pub mod application;
pub mod backup;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod schema;
pub mod storage;
pub mod value;

pub use config::Config;
pub use schema::SchemaCatalog;
pub use value::Value;

// Re-export storage types
pub use storage::{
    DatabaseSchema, Key, LocalDatabase, MemoryBackend, SqliteBackend, StorageBackend,
    StorageError, StoreSchema, StoreTransaction,
};

// Re-export backup types
pub use backup::{
    BackupDeserializer, BackupError, BackupHistory, BackupManager, BackupMetadata,
    BackupSerializer, BackupType, BackupVerifier, DataFormat, DatabaseExporter, DatabaseImporter,
    ExportResult, ImportOptions, ImportResult, MetadataOverrides, Snapshot,
};
