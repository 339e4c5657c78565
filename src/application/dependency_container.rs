use crate::backup::{BackupManager, FileLocator};
use crate::config::{Config, StorageKind};
use crate::schema::SchemaCatalog;
use crate::storage::{SqliteBackend, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,
    pub catalog: SchemaCatalog,

    // Storage layer
    pub backend: Arc<dyn StorageBackend>,
    sqlite: Option<Arc<SqliteBackend>>,
}

impl DependencyContainer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        debug!("Initializing dependency container");

        let catalog = config.catalog();
        let sqlite = match config.storage.backend {
            StorageKind::Sqlite => Some(Arc::new(SqliteBackend::new(
                config.storage.data_directory.clone(),
            ))),
            StorageKind::Memory => None,
        };
        let backend: Arc<dyn StorageBackend> = match &sqlite {
            Some(sqlite) => sqlite.clone(),
            None => config.storage_backend(),
        };

        Ok(Self {
            config,
            catalog,
            backend,
            sqlite,
        })
    }

    /// Create the directories the configuration points at.
    pub async fn initialize(&self) -> Result<()> {
        if self.sqlite.is_some() {
            fs::create_dir_all(&self.config.storage.data_directory)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create data directory {}",
                        self.config.storage.data_directory.display()
                    )
                })?;
        }

        fs::create_dir_all(&self.config.backup.backup_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create backup directory {}",
                    self.config.backup.backup_directory.display()
                )
            })?;

        info!(
            "Using {} storage, posDB schema version {}",
            self.config.storage.backend, self.config.schema.pos_schema_version
        );
        Ok(())
    }

    pub fn backup_manager(&self, locator: Arc<dyn FileLocator>) -> BackupManager {
        BackupManager::new(
            self.backend.clone(),
            self.catalog.clone(),
            &self.config.backup,
            locator,
        )
    }

    pub async fn shutdown(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
