pub mod deserializer;
pub mod exporter;
pub mod history;
pub mod importer;
pub mod manager;
pub mod serializer;
pub mod verification;

pub use deserializer::*;
pub use exporter::*;
pub use history::*;
pub use importer::*;
pub use manager::*;
pub use serializer::*;
pub use verification::*;

use crate::compression::CompressionMethod;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Container format version written by this build.
pub const FORMAT_VERSION: &str = "1.0";
/// Major container version this build can read.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;
/// File extension of backup containers.
pub const BACKUP_EXTENSION: &str = "roxoe";
pub const DEFAULT_DESCRIPTION: &str = "Roxoe POS backup";

/// Records of one database, by store name.
pub type StoreSnapshot = BTreeMap<String, Vec<serde_json::Value>>;

/// Exported records: database name → store name → records.
pub type Snapshot = BTreeMap<String, StoreSnapshot>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub version: String,
    #[serde(default)]
    pub app_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub record_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default)]
    pub data_format: DataFormat,
    #[serde(default = "default_compression_method")]
    pub compression_method: String,
    /// SHA-256 of the compressed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn default_compression_method() -> String {
    CompressionMethod::Zstd.to_string()
}

impl BackupMetadata {
    pub fn total_records(&self) -> u64 {
        self.record_counts.values().sum()
    }
}

/// Caller-supplied metadata fields; anything left `None` takes the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataOverrides {
    pub version: Option<String>,
    pub app_version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub databases: Option<Vec<String>>,
    pub record_counts: Option<BTreeMap<String, u64>>,
    pub backup_type: Option<BackupType>,
    pub data_format: Option<DataFormat>,
    pub compression_method: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    /// Labelled differently but restored with the same upsert merge as `Full`.
    Incremental,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Compressed,
    Raw,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt backup container: {message}")]
    FormatCorruption { message: String },

    #[error("Checksum mismatch: expected {expected}, calculated {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Unsupported backup format version: {version}")]
    UnsupportedVersion { version: String },

    #[error("Unsupported compression method: {method}")]
    UnsupportedCompression { method: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled by user")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;
