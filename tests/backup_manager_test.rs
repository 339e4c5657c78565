//! End-to-end backup and restore through the manager, on both backends.


use anyhow::Result;
use roxoe_backup::application::{Application, BackupCommandHandler};
use roxoe_backup::backup::{
    BackupError, BackupType, CreateBackupOptions, DataFormat, DatabaseImporter, ImportOptions,
    PathLocator, Snapshot, BACKUP_EXTENSION,
};
use roxoe_backup::schema::{CREDIT_DB, POS_DB, SALES_DB};
use roxoe_backup::Value;
use serial_test::serial;
use std::sync::Arc;
use test_helpers::{sample_snapshot, total_records, TestEnvironment};

#[tokio::test]
async fn test_create_then_restore_on_sqlite() -> Result<()> {
    let source = TestEnvironment::sqlite()?;
    source.seed(&sample_snapshot()).await;

    let created = source
        .manager()
        .create_backup(CreateBackupOptions {
            description: Some("end of day".to_string()),
            ..Default::default()
        })
        .await?;

    assert!(created.path.exists());
    assert_eq!(
        created.path.extension().and_then(|e| e.to_str()),
        Some(BACKUP_EXTENSION)
    );
    assert!(created.export_errors.is_empty());
    assert_eq!(
        created.metadata.total_records(),
        total_records(&sample_snapshot()) as u64
    );
    assert_eq!(created.metadata.databases, vec![POS_DB, SALES_DB, CREDIT_DB]);
    assert_eq!(created.metadata.record_counts["posDB.products"], 2);

    let target = TestEnvironment::sqlite()?;
    let restored = target
        .manager_for(&created.path)
        .restore_backup(&ImportOptions::default())
        .await?;

    assert!(restored.import.success, "{:?}", restored.import.errors);
    assert_eq!(
        restored.import.total_imported,
        total_records(&sample_snapshot())
    );
    assert_eq!(restored.metadata.description, "end of day");

    let products = target.records(POS_DB, "products").await;
    assert_eq!(products.len(), 2);
    assert!(matches!(products[0].get("createdAt"), Some(Value::Date(_))));
    let settings = target.records(POS_DB, "settings").await;
    assert_eq!(
        settings[0].lookup_path("value.footer"),
        Some(&Value::from("Teşekkürler"))
    );
    Ok(())
}

#[tokio::test]
async fn test_restore_is_idempotent_on_sqlite() -> Result<()> {
    let env = TestEnvironment::sqlite()?;
    env.seed(&sample_snapshot()).await;

    let backup = env.path().join("manual.roxoe");
    let manager = env.manager_for(&backup);
    manager.create_backup(CreateBackupOptions::default()).await?;

    let restored = manager.restore_backup(&ImportOptions::default()).await?;
    assert!(restored.import.success);
    assert_eq!(env.records(SALES_DB, "sales").await.len(), 1);
    assert_eq!(env.records(CREDIT_DB, "customers").await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_corrupted_backup_aborts_before_import() -> Result<()> {
    let source = TestEnvironment::memory()?;
    source.seed(&sample_snapshot()).await;
    let created = source
        .manager()
        .create_backup(CreateBackupOptions::default())
        .await?;

    let mut bytes = tokio::fs::read(&created.path).await?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    let target = TestEnvironment::memory()?;
    let result = target
        .manager()
        .restore_bytes(&bytes, &ImportOptions::default())
        .await;

    assert!(matches!(result, Err(BackupError::IntegrityMismatch { .. })));
    assert!(target.records(SALES_DB, "sales").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_oversized_payload_is_refused() -> Result<()> {
    let source = TestEnvironment::memory()?;
    source.seed(&sample_snapshot()).await;
    let created = source
        .manager()
        .create_backup(CreateBackupOptions::default())
        .await?;

    let mut target = TestEnvironment::memory()?;
    target.config.backup.max_payload_bytes = 256;
    let result = target
        .manager_for(&created.path)
        .restore_backup(&ImportOptions::default())
        .await;

    assert!(matches!(result, Err(BackupError::Compression { .. })));
    assert!(target.records(SALES_DB, "sales").await.is_empty());

    let report = target.manager().verify_backup(&created.path).await?;
    assert!(!report.is_valid());
    assert_eq!(report.checksum_verified, Some(true));
    Ok(())
}

#[tokio::test]
async fn test_verify_and_inspect() -> Result<()> {
    let env = TestEnvironment::memory()?;
    env.seed(&sample_snapshot()).await;
    let manager = env.manager();
    let created = manager
        .create_backup(CreateBackupOptions {
            backup_type: BackupType::Incremental,
            data_format: DataFormat::Raw,
            ..Default::default()
        })
        .await?;

    let report = manager.verify_backup(&created.path).await?;
    assert!(report.is_valid(), "{:?}", report.issues_found);
    assert_eq!(report.checksum_verified, Some(true));

    let metadata = manager.inspect_backup(&created.path).await?;
    assert_eq!(metadata.backup_type, BackupType::Incremental);
    assert_eq!(metadata.data_format, DataFormat::Raw);
    assert_eq!(metadata.compression_method, "none");
    assert_eq!(metadata.app_version, "test");
    Ok(())
}

#[tokio::test]
async fn test_history_is_capped() -> Result<()> {
    let mut env = TestEnvironment::memory()?;
    env.config.backup.history_limit = 3;
    env.seed(&sample_snapshot()).await;

    for i in 0..5 {
        env.manager_for(env.path().join(format!("backup-{i}.roxoe")))
            .create_backup(CreateBackupOptions {
                description: Some(format!("backup {i}")),
                ..Default::default()
            })
            .await?;
    }

    let history = env.manager().history().load().await;
    let names: Vec<_> = history.iter().map(|e| e.file_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["backup-4.roxoe", "backup-3.roxoe", "backup-2.roxoe"]
    );
    assert!(history
        .iter()
        .all(|e| e.total_records == total_records(&sample_snapshot()) as u64));
    Ok(())
}

#[tokio::test]
async fn test_empty_databases_back_up_as_empty_stores() -> Result<()> {
    let env = TestEnvironment::memory()?;
    let created = env
        .manager()
        .create_backup(CreateBackupOptions::default())
        .await?;

    assert_eq!(created.metadata.total_records(), 0);
    assert_eq!(created.metadata.record_counts["salesDB.sales"], 0);

    let restored = env
        .manager_for(&created.path)
        .restore_backup(&ImportOptions::default())
        .await?;
    assert!(restored.import.success, "{:?}", restored.import.errors);
    assert!(restored.import.errors.is_empty());
    assert_eq!(restored.import.total_imported, 0);
    assert!(restored.import.imported_databases.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_restore_command_with_partly_empty_databases() -> Result<()> {
    let env = TestEnvironment::sqlite()?;
    let app = Application::new(env.config.clone())?;
    app.initialize().await?;

    let snapshot: Snapshot = serde_json::from_value(serde_json::json!({
        "posDB": {"products": [{"id": 1, "name": "Simit", "price": 15}]},
        "salesDB": {"sales": [{"id": "s-1", "total": 15}]}
    }))?;
    let seeded = DatabaseImporter::new(app.container.backend.clone(), env.catalog())
        .import_all_databases(&snapshot, &ImportOptions::default())
        .await;
    assert!(seeded.success, "{:?}", seeded.errors);

    let backup = env.path().join("shop.roxoe");
    let handler = BackupCommandHandler::new(app.container.clone());
    handler
        .create(Some(backup.clone()), None, false, false)
        .await?;
    handler.restore(backup.clone(), false).await?;

    let restored = app
        .container
        .backup_manager(Arc::new(PathLocator::File(backup)))
        .restore_backup(&ImportOptions::default())
        .await?;
    assert!(restored.import.success);
    assert!(restored.import.errors.is_empty());
    assert_eq!(restored.import.total_imported, 2);
    assert_eq!(
        restored.import.imported_databases,
        vec![POS_DB.to_string(), SALES_DB.to_string()]
    );

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_manager_from_environment_config() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    std::env::set_var("ROXOE_STORAGE_BACKEND", "memory");
    std::env::set_var("ROXOE_BACKUP_DIR", dir.path().join("out"));
    std::env::set_var("ROXOE_HISTORY_FILE", dir.path().join("history.json"));

    let config = roxoe_backup::Config::from_env()?;
    std::env::remove_var("ROXOE_STORAGE_BACKEND");
    std::env::remove_var("ROXOE_BACKUP_DIR");
    std::env::remove_var("ROXOE_HISTORY_FILE");

    let app = roxoe_backup::application::Application::new(config)?;
    app.initialize().await?;
    let manager = app.container.backup_manager(std::sync::Arc::new(
        roxoe_backup::backup::PathLocator::Directory(dir.path().join("out")),
    ));
    let created = manager.create_backup(CreateBackupOptions::default()).await?;

    assert!(created.path.starts_with(dir.path().join("out")));
    assert_eq!(manager.history().load().await.len(), 1);
    Ok(())
}
