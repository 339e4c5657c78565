use crate::schema::{SchemaCatalog, CURRENT_POS_SCHEMA_VERSION, MIN_POS_SCHEMA_VERSION};
use crate::storage::{MemoryBackend, SqliteBackend, StorageBackend};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_FILE_ENV: &str = "ROXOE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the local databases live
    pub storage: StorageConfig,

    /// Backup file and history settings
    pub backup: BackupConfig,

    pub schema: SchemaConfig,

    /// Operational settings
    pub operational: OperationalConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    /// Process-local; contents are lost on exit
    Memory,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Sqlite => f.write_str("sqlite"),
            StorageKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageKind::Sqlite),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!(
                "Invalid storage backend: {other}. Must be 'sqlite' or 'memory'"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend (sqlite or memory)
    pub backend: StorageKind,

    /// Directory holding one SQLite file per database
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Default directory for new backups
    pub backup_directory: PathBuf,

    /// JSON log of created backups
    pub history_file: PathBuf,

    /// Entries kept in the history log
    pub history_limit: usize,

    /// zstd level, 1-22
    pub compression_level: i32,

    /// Largest decoded payload accepted on restore
    pub max_payload_bytes: u64,

    /// Application version recorded in backup metadata
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// posDB schema version; 6 adds product groups
    pub pos_schema_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

fn base_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roxoe")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Sqlite,
            data_directory: base_directory().join("databases"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        let base = base_directory();
        Self {
            backup_directory: base.join("backups"),
            history_file: base.join("backup_history.json"),
            history_limit: crate::backup::DEFAULT_HISTORY_LIMIT,
            compression_level: crate::compression::DEFAULT_COMPRESSION_LEVEL,
            max_payload_bytes: crate::compression::DEFAULT_MAX_DECOMPRESSED_BYTES,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            pos_schema_version: CURRENT_POS_SCHEMA_VERSION,
        }
    }
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` (or `ROXOE_CONFIG`) if any,
    /// then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_FILE_ENV).map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    fn apply_env(&mut self) -> Result<()> {
        // Storage configuration
        if let Ok(backend) = env::var("ROXOE_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }

        if let Ok(dir) = env::var("ROXOE_DATA_DIR") {
            self.storage.data_directory = PathBuf::from(dir);
        }

        // Backup configuration
        if let Ok(dir) = env::var("ROXOE_BACKUP_DIR") {
            self.backup.backup_directory = PathBuf::from(dir);
        }

        if let Ok(file) = env::var("ROXOE_HISTORY_FILE") {
            self.backup.history_file = PathBuf::from(file);
        }

        if let Ok(limit) = env::var("ROXOE_HISTORY_LIMIT") {
            self.backup.history_limit = limit
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid ROXOE_HISTORY_LIMIT: {}", e))?;
        }

        if let Ok(level) = env::var("ROXOE_COMPRESSION_LEVEL") {
            self.backup.compression_level = level
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid ROXOE_COMPRESSION_LEVEL: {}", e))?;
        }

        if let Ok(bytes) = env::var("ROXOE_MAX_PAYLOAD_BYTES") {
            self.backup.max_payload_bytes = bytes
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid ROXOE_MAX_PAYLOAD_BYTES: {}", e))?;
        }

        if let Ok(version) = env::var("ROXOE_APP_VERSION") {
            self.backup.app_version = version;
        }

        if let Ok(version) = env::var("ROXOE_POS_SCHEMA_VERSION") {
            self.schema.pos_schema_version = version
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid ROXOE_POS_SCHEMA_VERSION: {}", e))?;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            self.operational.log_level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageKind::Sqlite
            && self.storage.data_directory.as_os_str().is_empty()
        {
            return Err(anyhow::anyhow!("Data directory is required for sqlite storage"));
        }

        if self.backup.backup_directory.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Backup directory is required"));
        }

        if self.backup.history_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("History file is required"));
        }

        if self.backup.history_limit == 0 {
            return Err(anyhow::anyhow!("History limit must be greater than 0"));
        }

        if !(1..=22).contains(&self.backup.compression_level) {
            return Err(anyhow::anyhow!(
                "Compression level must be between 1 and 22, got {}",
                self.backup.compression_level
            ));
        }

        if self.backup.max_payload_bytes == 0 {
            return Err(anyhow::anyhow!("Max payload size must be greater than 0"));
        }

        if self.schema.pos_schema_version < MIN_POS_SCHEMA_VERSION {
            return Err(anyhow::anyhow!(
                "POS schema version {} is not supported (minimum {})",
                self.schema.pos_schema_version,
                MIN_POS_SCHEMA_VERSION
            ));
        }

        match self.operational.log_level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(anyhow::anyhow!("Invalid log level: {other}")),
        }

        Ok(())
    }

    pub fn catalog(&self) -> SchemaCatalog {
        SchemaCatalog::point_of_sale(self.schema.pos_schema_version)
    }

    pub fn storage_backend(&self) -> Arc<dyn StorageBackend> {
        match self.storage.backend {
            StorageKind::Sqlite => Arc::new(SqliteBackend::new(self.storage.data_directory.clone())),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "ROXOE_STORAGE_BACKEND",
        "ROXOE_DATA_DIR",
        "ROXOE_HISTORY_LIMIT",
        "ROXOE_COMPRESSION_LEVEL",
        "ROXOE_MAX_PAYLOAD_BYTES",
        "ROXOE_POS_SCHEMA_VERSION",
        CONFIG_FILE_ENV,
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.backup.history_limit, 20);
        assert_eq!(config.backup.compression_level, 3);
        assert_eq!(config.schema.pos_schema_version, 6);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.backup.history_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backup.compression_level = 30;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backup.max_payload_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.schema.pos_schema_version = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.operational.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("ROXOE_STORAGE_BACKEND", "memory");
        env::set_var("ROXOE_HISTORY_LIMIT", "5");
        env::set_var("ROXOE_POS_SCHEMA_VERSION", "5");
        env::set_var("ROXOE_MAX_PAYLOAD_BYTES", "1048576");

        let config = Config::from_env().unwrap();
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.backup.history_limit, 5);
        assert_eq!(config.backup.max_payload_bytes, 1_048_576);
        assert_eq!(config.catalog().version_of("posDB"), Some(5));

        env::set_var("ROXOE_HISTORY_LIMIT", "many");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_file_then_env() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roxoe.toml");
        std::fs::write(
            &path,
            "[backup]\nhistory_limit = 7\ncompression_level = 9\n\n[storage]\nbackend = \"memory\"\n",
        )
        .unwrap();
        env::set_var("ROXOE_COMPRESSION_LEVEL", "12");

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.backup.history_limit, 7);
        assert_eq!(config.backup.compression_level, 12);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        // unspecified sections keep their defaults
        assert_eq!(config.schema.pos_schema_version, CURRENT_POS_SCHEMA_VERSION);
        clear_env();
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
