use super::{BackupMetadata, BackupType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Entries kept before the oldest is evicted.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHistoryEntry {
    pub id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub backup_type: BackupType,
    pub databases: Vec<String>,
    pub record_counts: BTreeMap<String, u64>,
    pub total_records: u64,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BackupHistoryEntry {
    pub fn from_metadata(metadata: &BackupMetadata, path: &Path, size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            created_at: metadata.created_at,
            description: metadata.description.clone(),
            backup_type: metadata.backup_type,
            databases: metadata.databases.clone(),
            record_counts: metadata.record_counts.clone(),
            total_records: metadata.total_records(),
            size_bytes,
            checksum: metadata.checksum.clone(),
        }
    }
}

enum HistoryFile {
    Entries(Vec<BackupHistoryEntry>),
    Corrupt,
}

/// JSON log of created backups, newest first.
#[derive(Debug, Clone)]
pub struct BackupHistory {
    path: PathBuf,
    limit: usize,
}

impl BackupHistory {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable log is an empty history.
    pub async fn load(&self) -> Vec<BackupHistoryEntry> {
        match self.read().await {
            HistoryFile::Entries(entries) => entries,
            HistoryFile::Corrupt => Vec::new(),
        }
    }

    /// Prepend `entry`, dropping the oldest entries beyond the limit. A
    /// corrupt log is moved aside to `<file>.corrupt` before being replaced.
    pub async fn record(&self, entry: BackupHistoryEntry) -> Result<Vec<BackupHistoryEntry>> {
        let mut entries = match self.read().await {
            HistoryFile::Entries(entries) => entries,
            HistoryFile::Corrupt => {
                let aside = self.corrupt_path();
                fs::rename(&self.path, &aside).await?;
                warn!(
                    "Moved corrupt backup history {} to {}",
                    self.path.display(),
                    aside.display()
                );
                Vec::new()
            }
        };
        entries.insert(0, entry);
        entries.truncate(self.limit);

        self.write(&entries).await?;
        debug!("Backup history now holds {} entries", entries.len());
        Ok(entries)
    }

    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self) -> HistoryFile {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return HistoryFile::Entries(Vec::new())
            }
            Err(e) => {
                warn!("Failed to read backup history {}: {}", self.path.display(), e);
                return HistoryFile::Entries(Vec::new());
            }
        };

        match serde_json::from_str(&contents) {
            Ok(entries) => HistoryFile::Entries(entries),
            Err(e) => {
                warn!("Backup history {} is corrupt: {}", self.path.display(), e);
                HistoryFile::Corrupt
            }
        }
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }

    async fn write(&self, entries: &[BackupHistoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
