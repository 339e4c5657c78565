use super::{
    BackupDeserializer, BackupError, BackupHistory, BackupHistoryEntry, BackupMetadata,
    BackupSerializer, BackupType, BackupVerifier, DataFormat, DatabaseExporter, DatabaseImporter,
    ExportError, ImportOptions, ImportResult, MetadataOverrides, Result, Snapshot,
    VerificationReport, BACKUP_EXTENSION,
};
use crate::config::BackupConfig;
use crate::schema::SchemaCatalog;
use crate::storage::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

impl FileFilter {
    pub fn backups() -> Self {
        Self {
            name: "Roxoe backup".to_string(),
            extensions: vec![BACKUP_EXTENSION.to_string()],
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFile {
    pub name: String,
    pub content: Vec<u8>,
}

/// Picks where backups are written to and read from.
#[async_trait]
pub trait FileLocator: Send + Sync {
    /// Destination for a new backup; `None` means the user cancelled.
    async fn save_file(&self, suggested_name: &str) -> Option<PathBuf>;

    /// Backup to restore; `Ok(None)` means the user cancelled.
    async fn open_file(&self, filter: &FileFilter) -> Result<Option<OpenedFile>>;
}

/// Non-interactive locator backed by a fixed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLocator {
    /// New backups land here under their suggested name. Opening is cancelled.
    Directory(PathBuf),
    /// Backups are written to and read from exactly this file.
    File(PathBuf),
}

#[async_trait]
impl FileLocator for PathLocator {
    async fn save_file(&self, suggested_name: &str) -> Option<PathBuf> {
        match self {
            PathLocator::Directory(dir) => Some(dir.join(suggested_name)),
            PathLocator::File(path) => Some(path.clone()),
        }
    }

    async fn open_file(&self, filter: &FileFilter) -> Result<Option<OpenedFile>> {
        let PathLocator::File(path) = self else {
            return Ok(None);
        };

        if !filter.matches(path) {
            warn!(
                "{} does not have a {} extension",
                path.display(),
                filter.extensions.join("/")
            );
        }

        let content = fs::read(path).await?;
        Ok(Some(OpenedFile {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content,
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateBackupOptions {
    pub description: Option<String>,
    pub backup_type: BackupType,
    pub data_format: DataFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBackup {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
    pub size_bytes: u64,
    /// Databases left out of the backup because they could not be exported.
    pub export_errors: Vec<ExportError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredBackup {
    pub file_name: Option<String>,
    pub metadata: BackupMetadata,
    pub import: ImportResult,
}

pub fn suggested_file_name(now: DateTime<Utc>) -> String {
    format!(
        "roxoe_backup_{}.{}",
        now.format("%Y-%m-%d_%H-%M-%S"),
        BACKUP_EXTENSION
    )
}

/// Runs export → serialize → write and read → deserialize → import.
pub struct BackupManager {
    exporter: DatabaseExporter,
    importer: DatabaseImporter,
    serializer: BackupSerializer,
    deserializer: BackupDeserializer,
    verifier: BackupVerifier,
    history: BackupHistory,
    locator: Arc<dyn FileLocator>,
}

impl BackupManager {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        catalog: SchemaCatalog,
        config: &BackupConfig,
        locator: Arc<dyn FileLocator>,
    ) -> Self {
        Self {
            exporter: DatabaseExporter::new(backend.clone(), catalog.clone()),
            importer: DatabaseImporter::new(backend, catalog),
            serializer: BackupSerializer::new(config.app_version.clone())
                .with_compression_level(config.compression_level),
            deserializer: BackupDeserializer::new()
                .with_max_payload_bytes(config.max_payload_bytes),
            verifier: BackupVerifier::new().with_max_payload_bytes(config.max_payload_bytes),
            history: BackupHistory::new(config.history_file.clone(), config.history_limit),
            locator,
        }
    }

    pub fn exporter(&self) -> &DatabaseExporter {
        &self.exporter
    }

    pub fn importer(&self) -> &DatabaseImporter {
        &self.importer
    }

    pub fn history(&self) -> &BackupHistory {
        &self.history
    }

    /// Export every database and write the container where the locator says.
    pub async fn create_backup(&self, options: CreateBackupOptions) -> Result<CreatedBackup> {
        let started = Utc::now();
        info!("Creating {:?} backup", options.backup_type);

        let export = self.exporter.export_all_databases().await;
        if !export.errors.is_empty() {
            warn!(
                "{} databases could not be exported and are missing from the backup",
                export.errors.len()
            );
        }

        let overrides = MetadataOverrides {
            created_at: Some(started),
            description: options.description,
            databases: Some(export.database_names()),
            record_counts: Some(export.record_counts()),
            backup_type: Some(options.backup_type),
            data_format: Some(options.data_format),
            ..Default::default()
        };
        let (metadata, bytes) = self
            .serializer
            .serialize_with_metadata(&export.databases, overrides)?;

        let Some(path) = self.locator.save_file(&suggested_file_name(started)).await else {
            info!("Backup cancelled before writing");
            return Err(BackupError::Cancelled);
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;
        let size_bytes = bytes.len() as u64;

        info!(
            "Backup written to {} ({} bytes, {} records)",
            path.display(),
            size_bytes,
            metadata.total_records()
        );

        let entry = BackupHistoryEntry::from_metadata(&metadata, &path, size_bytes);
        if let Err(e) = self.history.record(entry).await {
            warn!("Backup succeeded but history could not be updated: {}", e);
        }

        Ok(CreatedBackup {
            path,
            metadata,
            size_bytes,
            export_errors: export.errors,
        })
    }

    /// Ask the locator for a backup and import it.
    pub async fn restore_backup(&self, options: &ImportOptions) -> Result<RestoredBackup> {
        let Some(file) = self.locator.open_file(&FileFilter::backups()).await? else {
            info!("Restore cancelled before reading");
            return Err(BackupError::Cancelled);
        };

        info!("Restoring backup {}", file.name);
        let mut restored = self.restore_bytes(&file.content, options).await?;
        restored.file_name = Some(file.name);
        Ok(restored)
    }

    /// Validate `bytes` and import them. A corrupt or tampered container is
    /// rejected before any store is touched.
    pub async fn restore_bytes(&self, bytes: &[u8], options: &ImportOptions) -> Result<RestoredBackup> {
        let (metadata, data) = match self.deserializer.decode::<Snapshot>(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Backup rejected: {}", e);
                return Err(e);
            }
        };

        debug!(
            "Backup from {} ({} declared records, format {})",
            metadata.created_at,
            metadata.total_records(),
            metadata.version
        );

        let import = self.importer.import_all_databases(&data, options).await;
        if import.success {
            info!("Restore completed: {} records", import.total_imported);
        } else {
            warn!(
                "Restore completed with {} errors: {} records imported",
                import.errors.len(),
                import.total_imported
            );
        }

        Ok(RestoredBackup {
            file_name: None,
            metadata,
            import,
        })
    }

    /// Header of the backup at `path`, without decoding its payload.
    pub async fn inspect_backup(&self, path: &Path) -> Result<BackupMetadata> {
        let bytes = fs::read(path).await?;
        self.deserializer.read_metadata(&bytes)
    }

    pub async fn verify_backup(&self, path: &Path) -> Result<VerificationReport> {
        info!("Verifying backup {}", path.display());
        let bytes = fs::read(path).await?;
        Ok(self.verifier.verify_bytes(&bytes))
    }
}
