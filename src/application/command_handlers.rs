use crate::application::DependencyContainer;
use crate::backup::{
    BackupType, CreateBackupOptions, DataFormat, DatabaseImporter, ImportOptions, PathLocator,
};
use crate::config::Config;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Clean separation of command handling logic from main.rs
pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn create(
        &self,
        output: Option<PathBuf>,
        description: Option<String>,
        incremental: bool,
        raw: bool,
    ) -> Result<()> {
        let locator = match output {
            Some(path) => PathLocator::File(path),
            None => PathLocator::Directory(self.container.config.backup.backup_directory.clone()),
        };
        let manager = self.container.backup_manager(Arc::new(locator));

        let options = CreateBackupOptions {
            description,
            backup_type: if incremental {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            data_format: if raw {
                DataFormat::Raw
            } else {
                DataFormat::Compressed
            },
        };

        let created = manager.create_backup(options).await?;
        for failure in &created.export_errors {
            warn!("⚠️  {} was not backed up: {}", failure.database, failure.message);
        }
        info!(
            "✅ Backup created: {} ({} records, {} bytes)",
            created.path.display(),
            created.metadata.total_records(),
            created.size_bytes
        );
        Ok(())
    }

    pub async fn restore(&self, path: PathBuf, clear_existing: bool) -> Result<()> {
        let manager = self.container.backup_manager(Arc::new(PathLocator::File(path)));
        let options = ImportOptions::default()
            .clear_existing(clear_existing)
            .on_progress(|progress| {
                info!(
                    "📦 {}.{}: {}/{}",
                    progress.database, progress.store, progress.processed, progress.total
                );
            });

        let restored = manager.restore_backup(&options).await?;
        let import = &restored.import;

        for failure in &import.errors {
            error!("❌ {}", failure);
        }
        info!(
            "{} Restored {} records into {} databases from {}",
            if import.success { "✅" } else { "⚠️ " },
            import.total_imported,
            import.imported_databases.len(),
            restored.file_name.as_deref().unwrap_or("backup")
        );

        if import.success {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Restore finished with {} errors",
                import.errors.len()
            ))
        }
    }

    pub async fn inspect(&self, path: &Path) -> Result<()> {
        let manager = self.container.backup_manager(Arc::new(PathLocator::File(path.to_path_buf())));
        let metadata = manager.inspect_backup(path).await?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        Ok(())
    }

    pub async fn verify(&self, path: &Path) -> Result<()> {
        let manager = self.container.backup_manager(Arc::new(PathLocator::File(path.to_path_buf())));
        let report = manager.verify_backup(path).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);

        if report.is_valid() {
            info!("✅ {} is intact", path.display());
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Backup verification failed: {}",
                report.issues_found.join("; ")
            ))
        }
    }

    pub async fn history(&self, clear: bool) -> Result<()> {
        let manager = self.container.backup_manager(Arc::new(PathLocator::Directory(
            self.container.config.backup.backup_directory.clone(),
        )));

        if clear {
            manager.history().clear().await?;
            info!("🧹 Backup history cleared");
            return Ok(());
        }

        let entries = manager.history().load().await;
        if entries.is_empty() {
            info!("No backups recorded yet");
            return Ok(());
        }

        info!("📊 Total backups: {}", entries.len());
        for entry in entries {
            info!(
                "{}  {}  {} records  {} bytes  {}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.path.display(),
                entry.total_records,
                entry.size_bytes,
                entry.description
            );
        }
        Ok(())
    }
}

pub struct DatabaseCommandHandler {
    container: Arc<DependencyContainer>,
}

impl DatabaseCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn stats(&self) -> Result<()> {
        let manager = self.container.backup_manager(Arc::new(PathLocator::Directory(
            self.container.config.backup.backup_directory.clone(),
        )));
        let (stats, errors) = manager.exporter().database_stats().await;

        for db in &stats {
            info!("💾 {} (version {}): {} records", db.name, db.version, db.total_records());
            for (store, count) in &db.record_counts {
                info!("   {}: {}", store, count);
            }
        }
        for failure in &errors {
            error!("❌ {}: {}", failure.database, failure.message);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} databases could not be read", errors.len()))
        }
    }

    pub async fn clear(&self, database: Option<String>, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(anyhow::anyhow!(
                "Refusing to clear without --yes; this deletes every record"
            ));
        }

        let importer = DatabaseImporter::new(
            self.container.backend.clone(),
            self.container.catalog.clone(),
        );
        let targets = match database {
            Some(name) => vec![name],
            None => self.container.catalog.names(),
        };

        for name in targets {
            importer.clear_database(&name).await?;
            info!("🧹 Cleared {}", name);
        }
        Ok(())
    }
}

pub struct ConfigCommandHandler {
    config: Config,
}

impl ConfigCommandHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Write the effective configuration as TOML, or print it.
    pub async fn init_config(&self, output: Option<PathBuf>, force: bool) -> Result<()> {
        let rendered = self.config.to_toml()?;

        let Some(path) = output else {
            println!("{rendered}");
            return Ok(());
        };

        if path.exists() && !force {
            return Err(anyhow::anyhow!(
                "{} already exists; use --force to overwrite",
                path.display()
            ));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, rendered).await?;
        info!("✅ Configuration written to {}", path.display());
        Ok(())
    }
}
